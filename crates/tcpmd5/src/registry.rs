//! Handle registry
//!
//! Maps an opaque socket handle (`&dyn Any`) to its native descriptor. Each
//! supported concrete handle type is a [`HandleShape`]. Shapes are collected
//! in a [`RegistryBuilder`] and frozen into a [`HandleRegistry`]; the frozen
//! registry is never mutated, so lookups need no locking.

use std::any::{Any, TypeId};
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::config::Tcpmd5Config;
use crate::errors::{Error, RegistrationError, Result};

/// Reads the descriptor out of a handle already known to have the shape's type.
pub type Extractor = fn(&dyn Any) -> Option<RawFd>;

/// One supported concrete representation of a socket handle.
#[derive(Clone, Copy)]
pub struct HandleShape {
    name: &'static str,
    type_id: TypeId,
    extract: Extractor,
}

impl HandleShape {
    /// Shape for any type exposing its descriptor through [`AsRawFd`].
    pub fn of<T: AsRawFd + 'static>(name: &'static str) -> Self {
        Self {
            name,
            type_id: TypeId::of::<T>(),
            extract: extract_raw_fd::<T>,
        }
    }

    /// Shape with a hand-written extractor, for handle types that keep the
    /// descriptor somewhere other than `AsRawFd`.
    pub fn custom(name: &'static str, type_id: TypeId, extract: Extractor) -> Self {
        Self {
            name,
            type_id,
            extract,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Whether `handle`'s runtime type is this shape's type.
    pub fn matches(&self, handle: &dyn Any) -> bool {
        handle.type_id() == self.type_id
    }

    /// Extract the native descriptor. A missing or negative descriptor is an
    /// illegal state.
    pub fn descriptor(&self, handle: &dyn Any) -> Result<RawFd> {
        match (self.extract)(handle) {
            Some(fd) if fd >= 0 => Ok(fd),
            _ => Err(Error::unreadable_descriptor(self.name)),
        }
    }
}

impl fmt::Debug for HandleShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleShape")
            .field("name", &self.name)
            .field("type_id", &self.type_id)
            .finish()
    }
}

fn extract_raw_fd<T: AsRawFd + 'static>(handle: &dyn Any) -> Option<RawFd> {
    handle.downcast_ref::<T>().map(AsRawFd::as_raw_fd)
}

/// Registration input: a shape, or the reason it cannot exist in this build.
#[derive(Debug, Clone)]
pub struct ShapeDescriptor {
    name: &'static str,
    shape: std::result::Result<HandleShape, &'static str>,
}

impl ShapeDescriptor {
    pub fn available(shape: HandleShape) -> Self {
        Self {
            name: shape.name,
            shape: Ok(shape),
        }
    }

    pub fn unavailable(name: &'static str, reason: &'static str) -> Self {
        Self {
            name,
            shape: Err(reason),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Known handle shapes in match priority order.
pub fn known_shapes() -> Vec<ShapeDescriptor> {
    let mut shapes = vec![
        ShapeDescriptor::available(HandleShape::of::<std::net::TcpListener>(
            "std::net::TcpListener",
        )),
        ShapeDescriptor::available(HandleShape::of::<std::net::TcpStream>(
            "std::net::TcpStream",
        )),
        ShapeDescriptor::available(HandleShape::of::<socket2::Socket>("socket2::Socket")),
    ];

    #[cfg(feature = "tokio")]
    shapes.extend([
        ShapeDescriptor::available(HandleShape::of::<tokio::net::TcpListener>(
            "tokio::net::TcpListener",
        )),
        ShapeDescriptor::available(HandleShape::of::<tokio::net::TcpStream>(
            "tokio::net::TcpStream",
        )),
    ]);

    #[cfg(not(feature = "tokio"))]
    shapes.extend([
        ShapeDescriptor::unavailable("tokio::net::TcpListener", "built without the tokio feature"),
        ShapeDescriptor::unavailable("tokio::net::TcpStream", "built without the tokio feature"),
    ]);

    shapes
}

/// Build phase of the registry.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    shapes: Vec<HandleShape>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shape. On failure the builder is left unchanged.
    pub fn register(&mut self, descriptor: ShapeDescriptor) -> std::result::Result<(), RegistrationError> {
        let shape = descriptor
            .shape
            .map_err(|reason| RegistrationError::Unavailable {
                name: descriptor.name.to_string(),
                reason: reason.to_string(),
            })?;

        if self
            .shapes
            .iter()
            .any(|s| s.name == shape.name || s.type_id == shape.type_id)
        {
            return Err(RegistrationError::Duplicate {
                name: shape.name.to_string(),
            });
        }

        self.shapes
            .try_reserve(1)
            .map_err(|_| RegistrationError::OutOfMemory {
                name: shape.name.to_string(),
            })?;
        self.shapes.push(shape);
        Ok(())
    }

    /// Attempt every descriptor, logging failures. Returns how many registered.
    pub fn register_all(&mut self, descriptors: impl IntoIterator<Item = ShapeDescriptor>) -> usize {
        let mut registered = 0;
        for descriptor in descriptors {
            let name = descriptor.name;
            match self.register(descriptor) {
                Ok(()) => {
                    debug!("Registered handle shape {}", name);
                    registered += 1;
                }
                Err(e) => warn!("Skipping handle shape: {}", e),
            }
        }
        registered
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Freeze into an immutable registry.
    pub fn build(self) -> HandleRegistry {
        HandleRegistry {
            shapes: self.shapes.into_boxed_slice(),
        }
    }
}

/// Frozen, insertion-ordered set of handle shapes.
#[derive(Debug)]
pub struct HandleRegistry {
    shapes: Box<[HandleShape]>,
}

static GLOBAL_REGISTRY: OnceCell<Arc<HandleRegistry>> = OnceCell::new();

impl HandleRegistry {
    /// Registry holding every known shape except those disabled in `config`.
    pub fn from_config(config: &Tcpmd5Config) -> Self {
        let mut builder = RegistryBuilder::new();
        let descriptors = known_shapes().into_iter().filter(|d| {
            let disabled = config.disabled_shapes.iter().any(|n| n == d.name());
            if disabled {
                debug!("Handle shape {} disabled by configuration", d.name());
            }
            !disabled
        });
        let registered = builder.register_all(descriptors);

        if registered == 0 {
            error!("No handle shapes registered; every key access will fail");
        } else {
            info!("Handle registry built with {} shapes", registered);
        }
        builder.build()
    }

    /// Publish `registry` as the process-wide registry. Hands it back if one
    /// was already published.
    pub fn install_global(registry: Arc<HandleRegistry>) -> std::result::Result<(), Arc<HandleRegistry>> {
        GLOBAL_REGISTRY.set(registry)
    }

    /// Process-wide registry, built from the default configuration on first use.
    pub fn global() -> Arc<HandleRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(Self::from_config(&Tcpmd5Config::default())))
            .clone()
    }

    /// First shape whose type matches `handle`.
    pub fn resolve(&self, handle: &dyn Any) -> Option<&HandleShape> {
        self.shapes.iter().find(|shape| shape.matches(handle))
    }

    /// Resolve `handle` and extract its descriptor.
    pub fn descriptor(&self, handle: &dyn Any) -> Result<RawFd> {
        let shape = self
            .resolve(handle)
            .ok_or_else(|| Error::unknown_handle(&self.names().join(", ")))?;
        shape.descriptor(handle)
    }

    pub fn shapes(&self) -> &[HandleShape] {
        &self.shapes
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.shapes.iter().map(HandleShape::name).collect()
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }
}
