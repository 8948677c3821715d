//! TCP MD5 Signature Key Access
//!
//! Installs, inspects and clears the per-connection RFC 2385 MD5 key of a
//! TCP socket through the Linux `TCP_MD5SIG` option.
//!
//! ## Modules
//! - `registry`: Maps opaque socket handles to native descriptors
//! - `probe`: Startup self-test of kernel support
//! - `accessor`: Get/set/clear key operations
//! - `factory`: Process-wide registry, accessor and probe result
//! - `mapping`: Per-peer key table for server sockets
//! - `native`: Kernel option record and system call backend
//! - `config`: File and environment configuration
//! - `errors`: Invalid-argument, illegal-state and I/O error kinds

pub mod accessor;
pub mod config;
pub mod errors;
pub mod factory;
pub mod mapping;
pub mod native;
pub mod probe;
pub mod registry;
pub mod types;

#[cfg(test)]
mod testing;

// ------------------------------------------------------------
// Re-exports for workspace-wide use
// ------------------------------------------------------------

pub use accessor::{validate_key_length, KeyAccessor, DEFAULT_BACKLOG};
pub use config::{LogFormat, ProbeFamily, Tcpmd5Config};
pub use errors::{Error, ErrorKind, NativeOp, RegistrationError, Result};
pub use factory::{KeyAccess, KeyAccessFactory};
pub use mapping::KeyMapping;
pub use native::{KernelBackend, Md5Sig, OptionBackend};
pub use probe::{probe, CapabilityResult, ProbeStep};
pub use registry::{known_shapes, HandleRegistry, HandleShape, RegistryBuilder, ShapeDescriptor};
pub use types::{KeyMaterial, KEY_BUFFER_CAPACITY, TCP_MD5SIG_MAXKEYLEN};
