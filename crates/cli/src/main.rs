//! TCP MD5 Signature Command Line Interface
//!
//! Probes kernel support for the TCP MD5 signature option, lists the socket
//! handle shapes the library recognizes, and exercises a key on a live
//! listener.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tcpmd5::{KeyAccessFactory, KeyMapping, LogFormat, Tcpmd5Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tcpmd5ctl")]
#[command(about = "TCP MD5 signature capability and key tool", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capability probe
    Probe {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List registered handle shapes in match order
    Shapes,
    /// Bind a listener keyed for a peer before it listens, then remove the key
    TryKey {
        /// Address to bind the listener to
        #[arg(long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,
        /// Peer address the key applies to
        #[arg(long)]
        peer: IpAddr,
        /// ASCII password
        #[arg(long, conflicts_with = "key_hex")]
        password: Option<String>,
        /// Raw key bytes as hex
        #[arg(long)]
        key_hex: Option<String>,
    },
}

fn init_logging(config: &Tcpmd5Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init(),
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Tcpmd5Config::load(cli.config.as_deref())?;
    init_logging(&config);

    let factory = KeyAccessFactory::init_global(&config);

    match cli.command {
        Commands::Probe { json } => {
            let capability = factory.capability();
            if json {
                println!("{}", serde_json::to_string_pretty(capability)?);
            } else if capability.supported {
                println!("supported: {}", capability.reason);
            } else {
                println!("unsupported: {}", capability.reason);
            }
            if !capability.supported {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Shapes => {
            for (priority, shape) in factory.accessor().registry().shapes().iter().enumerate() {
                println!("{:>2}  {}", priority, shape.name());
            }
        }
        Commands::TryKey {
            bind,
            peer,
            password,
            key_hex,
        } => {
            let key = match (password, key_hex) {
                (Some(password), None) => {
                    if !password.is_ascii() {
                        anyhow::bail!("password must be ASCII");
                    }
                    password.into_bytes()
                }
                (None, Some(key_hex)) => hex::decode(key_hex.trim()).context("invalid hex key")?,
                _ => anyhow::bail!("one of --password or --key-hex is required"),
            };

            let mut mapping = KeyMapping::new();
            mapping.insert(peer, key.as_slice())?;

            let accessor = factory.accessor();
            let listener = accessor
                .bind_with_mapping(bind, &mapping)
                .with_context(|| format!("failed to bind keyed listener on {}", bind))?;
            info!("Listener bound on {}", listener.local_addr()?);
            println!("installed {}-byte key for {}", key.len(), peer);

            match accessor.get(&listener) {
                Ok(current) => println!("kernel reports a {}-byte key", current.len()),
                Err(e) => println!("key read-back unavailable: {}", e),
            }

            accessor
                .clear_for_peer(&listener, SocketAddr::new(peer, 0))
                .with_context(|| format!("failed to remove key for {}", peer))?;
            println!("removed key for {}", peer);
        }
    }

    Ok(ExitCode::SUCCESS)
}
