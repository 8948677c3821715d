//! Runtime configuration
//!
//! Values come from an optional TOML file and are overridden by
//! `TCPMD5_*` environment variables.

use std::path::Path;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use socket2::Domain;

/// Address family of the capability probe's scratch socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeFamily {
    Ipv4,
    Ipv6,
}

impl ProbeFamily {
    pub fn domain(&self) -> Domain {
        match self {
            ProbeFamily::Ipv4 => Domain::IPV4,
            ProbeFamily::Ipv6 => Domain::IPV6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tcpmd5Config {
    /// Family of the probe's scratch socket
    pub probe_family: ProbeFamily,
    /// Fail the probe when a fresh socket reports a key (or cannot be read)
    pub strict_fresh_check: bool,
    /// Handle shape names left out of the registry
    pub disabled_shapes: Vec<String>,
    /// Default tracing filter for binaries
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Tcpmd5Config {
    fn default() -> Self {
        Self {
            probe_family: ProbeFamily::Ipv4,
            strict_fresh_check: false,
            disabled_shapes: Vec::new(),
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }
}

impl Tcpmd5Config {
    /// Load configuration from `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                bail!("Configuration file {} not found", path.display());
            }
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("TCPMD5")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("disabled_shapes"),
        );

        let config = builder
            .build()
            .context("failed to assemble configuration sources")?;
        config
            .try_deserialize()
            .context("failed to parse TCP MD5 configuration")
    }
}
