//! Capability probe
//!
//! Runs once at startup: checks the key buffer against the platform maximum,
//! then performs a full set/clear cycle on a scratch socket. The result is
//! informational; accessor calls still go to the kernel when it fails.

use std::fmt;
use std::os::fd::AsRawFd;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::accessor::{bound_address, read_key, write_key};
use crate::config::Tcpmd5Config;
use crate::native::OptionBackend;
use crate::types::{KEY_BUFFER_CAPACITY, TCP_MD5SIG_MAXKEYLEN};

/// Filler byte for the probe key.
const PROBE_KEY_BYTE: u8 = 0x5a;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStep {
    BufferSize,
    Open,
    FreshRead,
    Set,
    Clear,
}

impl fmt::Display for ProbeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeStep::BufferSize => "buffer size",
            ProbeStep::Open => "open",
            ProbeStep::FreshRead => "get",
            ProbeStep::Set => "set",
            ProbeStep::Clear => "clear",
        };
        f.write_str(name)
    }
}

/// Outcome of the capability probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityResult {
    pub supported: bool,
    pub reason: String,
    pub failed_step: Option<ProbeStep>,
}

impl CapabilityResult {
    fn pass() -> Self {
        Self {
            supported: true,
            reason: "TCP MD5 signature option is supported".to_string(),
            failed_step: None,
        }
    }

    fn fail(step: ProbeStep, reason: impl fmt::Display) -> Self {
        let result = Self {
            supported: false,
            reason: format!("{} step failed: {}", step, reason),
            failed_step: Some(step),
        };
        error!("TCP MD5 capability probe failed: {}", result.reason);
        result
    }
}

/// Probe the kernel through `backend`.
pub fn probe<B: OptionBackend + ?Sized>(backend: &B, config: &Tcpmd5Config) -> CapabilityResult {
    probe_with_limits(backend, config, TCP_MD5SIG_MAXKEYLEN, KEY_BUFFER_CAPACITY)
}

pub(crate) fn probe_with_limits<B: OptionBackend + ?Sized>(
    backend: &B,
    config: &Tcpmd5Config,
    platform_max: usize,
    buffer_capacity: usize,
) -> CapabilityResult {
    if platform_max > buffer_capacity {
        return CapabilityResult::fail(
            ProbeStep::BufferSize,
            format!(
                "platform maximum key length {} exceeds buffer capacity {}",
                platform_max, buffer_capacity
            ),
        );
    }

    // Closed on drop, whichever step returns.
    let scratch = match backend.open_scratch(config.probe_family.domain()) {
        Ok(socket) => socket,
        Err(e) => return CapabilityResult::fail(ProbeStep::Open, e),
    };
    let fd = scratch.as_raw_fd();

    let fresh = match read_key(backend, fd) {
        Ok(key) if key.is_empty() => None,
        Ok(key) => Some(format!("fresh socket reports a key of length {}", key.len())),
        Err(e) => Some(e.to_string()),
    };
    if let Some(reason) = fresh {
        if config.strict_fresh_check {
            return CapabilityResult::fail(ProbeStep::FreshRead, reason);
        }
        warn!("Ignoring fresh socket read-back anomaly: {}", reason);
    }

    let local = match bound_address(backend, fd) {
        Ok(addr) => addr,
        Err(e) => return CapabilityResult::fail(ProbeStep::Set, e),
    };

    let key = vec![PROBE_KEY_BYTE; platform_max];
    if let Err(e) = write_key(backend, fd, &local, &key) {
        return CapabilityResult::fail(ProbeStep::Set, e);
    }

    if let Err(e) = write_key(backend, fd, &local, &[]) {
        return CapabilityResult::fail(ProbeStep::Clear, e);
    }

    info!("TCP MD5 signature support confirmed");
    CapabilityResult::pass()
}
