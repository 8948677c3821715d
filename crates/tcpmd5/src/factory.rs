//! Key access factory
//!
//! Bundles the frozen handle registry, a [`KeyAccessor`] and the cached
//! capability probe result. The process-wide instance is built once, on
//! first use.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::accessor::KeyAccessor;
use crate::config::Tcpmd5Config;
use crate::errors::Result;
use crate::native::{KernelBackend, OptionBackend};
use crate::probe::{probe, CapabilityResult};
use crate::registry::HandleRegistry;
use crate::types::KeyMaterial;

static GLOBAL_FACTORY: OnceCell<KeyAccessFactory> = OnceCell::new();

#[derive(Debug)]
pub struct KeyAccessFactory<B = KernelBackend> {
    accessor: KeyAccessor<B>,
    capability: CapabilityResult,
}

impl KeyAccessFactory<KernelBackend> {
    /// Process-wide factory, initialized with the default configuration if
    /// [`KeyAccessFactory::init_global`] was not called first.
    pub fn global() -> &'static KeyAccessFactory {
        Self::init_global(&Tcpmd5Config::default())
    }

    /// Build the process-wide factory from `config`. Later calls return the
    /// existing instance and ignore their argument.
    pub fn init_global(config: &Tcpmd5Config) -> &'static KeyAccessFactory {
        GLOBAL_FACTORY.get_or_init(|| {
            let registry = Arc::new(HandleRegistry::from_config(config));
            let registry = match HandleRegistry::install_global(registry.clone()) {
                Ok(()) => registry,
                Err(_) => {
                    let published = HandleRegistry::global();
                    let ignored = ignored_disabled_shapes(config, &published);
                    if ignored.is_empty() {
                        debug!("Handle registry already published; reusing it");
                    } else {
                        warn!(
                            "Handle registry already published; disabled_shapes {:?} not applied",
                            ignored
                        );
                    }
                    published
                }
            };
            Self::new(registry, KernelBackend, config)
        })
    }
}

impl<B: OptionBackend> KeyAccessFactory<B> {
    /// Probe `backend` and wrap it in an accessor over `registry`.
    pub fn new(registry: Arc<HandleRegistry>, backend: B, config: &Tcpmd5Config) -> Self {
        let capability = probe(&backend, config);
        if capability.supported {
            info!(
                "TCP MD5 key access available for {} handle shapes",
                registry.len()
            );
        }
        Self {
            accessor: KeyAccessor::new(registry, backend),
            capability,
        }
    }

    /// Whether the capability probe passed.
    pub fn is_available(&self) -> bool {
        self.capability.supported
    }

    pub fn capability(&self) -> &CapabilityResult {
        &self.capability
    }

    pub fn accessor(&self) -> &KeyAccessor<B> {
        &self.accessor
    }

    /// Resolve `handle` once and return key operations bound to it.
    pub fn key_access<'a>(&'a self, handle: &'a dyn Any) -> Result<KeyAccess<'a, B>> {
        let fd = self.accessor.registry().descriptor(handle)?;
        Ok(KeyAccess {
            accessor: &self.accessor,
            _handle: handle,
            fd,
        })
    }
}

/// Shapes `config` disables that `registry` still carries.
fn ignored_disabled_shapes<'a>(config: &'a Tcpmd5Config, registry: &HandleRegistry) -> Vec<&'a str> {
    let names = registry.names();
    config
        .disabled_shapes
        .iter()
        .map(String::as_str)
        .filter(|name| names.iter().any(|n| n == name))
        .collect()
}

/// Key operations bound to one resolved socket handle.
pub struct KeyAccess<'a, B = KernelBackend> {
    accessor: &'a KeyAccessor<B>,
    // Borrowed so the descriptor stays open while this value lives.
    _handle: &'a dyn Any,
    fd: RawFd,
}

impl<B: OptionBackend> KeyAccess<'_, B> {
    pub fn descriptor(&self) -> RawFd {
        self.fd
    }

    pub fn get_key(&self) -> Result<KeyMaterial> {
        self.accessor.get_fd(self.fd)
    }

    pub fn set_key(&self, key: &[u8]) -> Result<()> {
        self.accessor.set_fd(self.fd, key)
    }

    pub fn clear_key(&self) -> Result<()> {
        self.accessor.set_fd(self.fd, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::probe::ProbeStep;
    use crate::testing::{Failures, MemoryBackend};
    use std::net::TcpListener;
    use std::os::fd::AsRawFd;

    fn factory(backend: MemoryBackend) -> KeyAccessFactory<MemoryBackend> {
        let config = Tcpmd5Config::default();
        KeyAccessFactory::new(
            Arc::new(HandleRegistry::from_config(&config)),
            backend,
            &config,
        )
    }

    #[test]
    fn test_bound_access_round_trip() {
        let factory = factory(MemoryBackend::new());
        assert!(factory.is_available());

        let socket = TcpListener::bind("127.0.0.1:0").unwrap();
        let access = factory.key_access(&socket).unwrap();
        assert_eq!(access.descriptor(), socket.as_raw_fd());

        assert!(access.get_key().unwrap().is_empty());
        access.set_key(b"peer-secret").unwrap();
        assert_eq!(access.get_key().unwrap().as_bytes(), b"peer-secret");
        access.clear_key().unwrap();
        assert!(access.get_key().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_handle_is_illegal_state() {
        let factory = factory(MemoryBackend::new());
        let err = factory.key_access(&"not a socket").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[test]
    fn test_unavailable_factory_still_attempts_kernel_calls() {
        let factory = factory(MemoryBackend::failing(Failures {
            set: Some(libc::ENOPROTOOPT),
            ..Failures::default()
        }));
        assert!(!factory.is_available());
        assert_eq!(factory.capability().failed_step, Some(ProbeStep::Set));

        let socket = TcpListener::bind("127.0.0.1:0").unwrap();
        let err = factory.key_access(&socket).unwrap().set_key(b"k").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_disabled_shapes_still_registered_are_reported() {
        let registry = HandleRegistry::from_config(&Tcpmd5Config::default());
        let config = Tcpmd5Config {
            disabled_shapes: vec!["std::net::TcpStream".into(), "no::such::Shape".into()],
            ..Default::default()
        };
        assert_eq!(
            ignored_disabled_shapes(&config, &registry),
            vec!["std::net::TcpStream"]
        );

        let filtered = HandleRegistry::from_config(&config);
        assert!(ignored_disabled_shapes(&config, &filtered).is_empty());
    }

    #[test]
    fn test_global_factory_is_built_once() {
        let a = KeyAccessFactory::global() as *const _;
        let b = KeyAccessFactory::init_global(&Tcpmd5Config {
            strict_fresh_check: true,
            ..Default::default()
        }) as *const _;
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(
            KeyAccessFactory::global().accessor().registry(),
            &HandleRegistry::global()
        ));
    }
}
