//! Key accessor
//!
//! Reads, installs and removes the MD5 key of a socket. Every call resolves
//! the handle through the [`HandleRegistry`] first and validates key length
//! before any native memory is written.
//!
//! All operations block on system calls. Async callers should run them on a
//! blocking-capable thread (e.g. `tokio::task::spawn_blocking`).

use std::any::Any;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::errors::{Error, NativeOp, Result};
use crate::mapping::KeyMapping;
use crate::native::{KernelBackend, Md5Sig, OptionBackend};
use crate::registry::HandleRegistry;
use crate::types::{KeyMaterial, KEY_BUFFER_CAPACITY, TCP_MD5SIG_MAXKEYLEN};

/// Listen backlog used by [`KeyAccessor::bind_with_mapping`].
pub const DEFAULT_BACKLOG: i32 = 128;

/// Reject keys the kernel or the record buffer cannot hold. The two limits
/// are checked independently.
pub fn validate_key_length(len: usize) -> Result<()> {
    validate_key_length_with_limits(len, TCP_MD5SIG_MAXKEYLEN, KEY_BUFFER_CAPACITY)
}

pub(crate) fn validate_key_length_with_limits(
    len: usize,
    platform_max: usize,
    buffer_capacity: usize,
) -> Result<()> {
    if len > platform_max {
        return Err(Error::key_too_long(len, platform_max));
    }
    if len > buffer_capacity {
        return Err(Error::key_too_long(len, buffer_capacity));
    }
    Ok(())
}

fn stream_socket(addr: &SocketAddr) -> Result<Socket> {
    Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::io(NativeOp::Socket, e))
}

pub(crate) fn read_key<B: OptionBackend + ?Sized>(backend: &B, fd: RawFd) -> Result<KeyMaterial> {
    let mut record = Md5Sig::zeroed();
    backend
        .get_option(fd, &mut record)
        .map_err(|e| Error::io(NativeOp::Getsockopt, e))?;

    let key = record.key().ok_or_else(|| {
        Error::illegal_state(format!(
            "kernel reported key length {} beyond buffer capacity {}",
            record.keylen, KEY_BUFFER_CAPACITY
        ))
    })?;
    Ok(KeyMaterial::from(key))
}

pub(crate) fn bound_address<B: OptionBackend + ?Sized>(backend: &B, fd: RawFd) -> Result<SocketAddr> {
    backend
        .local_addr(fd)
        .map_err(|e| Error::io(NativeOp::Getsockname, e))
}

/// Build a record for `addr` and `key` and hand it to the kernel. `key` must
/// already be validated.
pub(crate) fn write_key<B: OptionBackend + ?Sized>(
    backend: &B,
    fd: RawFd,
    addr: &SocketAddr,
    key: &[u8],
) -> Result<()> {
    let mut record = Md5Sig::zeroed();
    record.set_address(addr);
    record.fill_key(key);
    backend
        .set_option(fd, &record)
        .map_err(|e| Error::io(NativeOp::Setsockopt, e))
}

/// Get/set/clear operations over registered handle shapes.
#[derive(Debug)]
pub struct KeyAccessor<B = KernelBackend> {
    registry: Arc<HandleRegistry>,
    backend: B,
}

impl KeyAccessor<KernelBackend> {
    /// Accessor over the process-wide registry and the real kernel.
    pub fn kernel() -> Self {
        Self::new(HandleRegistry::global(), KernelBackend)
    }
}

impl<B: OptionBackend> KeyAccessor<B> {
    pub fn new(registry: Arc<HandleRegistry>, backend: B) -> Self {
        Self { registry, backend }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Current key of the socket behind `handle`. Empty means no key.
    pub fn get(&self, handle: &dyn Any) -> Result<KeyMaterial> {
        let fd = self.registry.descriptor(handle)?;
        self.get_fd(fd)
    }

    /// Install `key` on the socket behind `handle`. The record carries the
    /// socket's local binding as its address.
    pub fn set(&self, handle: &dyn Any, key: &[u8]) -> Result<()> {
        let fd = self.registry.descriptor(handle)?;
        self.set_fd(fd, key)
    }

    /// Remove the key from the socket behind `handle`.
    pub fn clear(&self, handle: &dyn Any) -> Result<()> {
        self.set(handle, &[])
    }

    /// Install `key` for connections from `peer`, e.g. on a listening socket.
    pub fn set_for_peer(&self, handle: &dyn Any, peer: SocketAddr, key: &[u8]) -> Result<()> {
        validate_key_length(key.len())?;
        let fd = self.registry.descriptor(handle)?;
        debug!(fd, %peer, keylen = key.len(), "Setting peer TCP MD5 key");
        write_key(&self.backend, fd, &peer, key)
    }

    /// Remove the key installed for `peer`.
    pub fn clear_for_peer(&self, handle: &dyn Any, peer: SocketAddr) -> Result<()> {
        self.set_for_peer(handle, peer, &[])
    }

    /// Install every entry of `mapping` on the socket behind `handle`.
    /// Stops at the first failure. Returns how many keys were installed.
    pub fn apply_mapping(&self, handle: &dyn Any, mapping: &KeyMapping) -> Result<usize> {
        let fd = self.registry.descriptor(handle)?;
        self.apply_mapping_fd(fd, mapping)
    }

    /// Bind a listener on `addr` with every key of `mapping` installed
    /// before `listen`, so the first SYN from each mapped peer is verified.
    pub fn bind_with_mapping(&self, addr: SocketAddr, mapping: &KeyMapping) -> Result<TcpListener> {
        let socket = stream_socket(&addr)?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::io(NativeOp::Setsockopt, e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::io(NativeOp::Bind, e))?;
        let applied = self.apply_mapping_fd(socket.as_raw_fd(), mapping)?;
        socket
            .listen(DEFAULT_BACKLOG)
            .map_err(|e| Error::io(NativeOp::Listen, e))?;
        info!(%addr, applied, "Listening with TCP MD5 keys");
        Ok(socket.into())
    }

    /// Connect to `peer` with `key` installed before the handshake starts.
    pub fn connect_with_key(&self, peer: SocketAddr, key: &[u8]) -> Result<TcpStream> {
        validate_key_length(key.len())?;
        let socket = stream_socket(&peer)?;
        let fd = socket.as_raw_fd();
        debug!(fd, %peer, keylen = key.len(), "Setting TCP MD5 key before connect");
        write_key(&self.backend, fd, &peer, key)?;
        socket
            .connect(&peer.into())
            .map_err(|e| Error::io(NativeOp::Connect, e))?;
        Ok(socket.into())
    }

    fn apply_mapping_fd(&self, fd: RawFd, mapping: &KeyMapping) -> Result<usize> {
        let mut applied = 0;
        for (ip, key) in mapping.iter() {
            write_key(&self.backend, fd, &SocketAddr::new(*ip, 0), key.as_bytes())?;
            applied += 1;
        }
        debug!(fd, applied, "Applied TCP MD5 key mapping");
        Ok(applied)
    }

    pub(crate) fn get_fd(&self, fd: RawFd) -> Result<KeyMaterial> {
        read_key(&self.backend, fd)
    }

    pub(crate) fn set_fd(&self, fd: RawFd, key: &[u8]) -> Result<()> {
        validate_key_length(key.len())?;
        // Kernels that match the option instance by address ignore a removal
        // without one, so the address is always populated.
        let local = bound_address(&self.backend, fd)?;
        debug!(fd, %local, keylen = key.len(), "Setting TCP MD5 key");
        write_key(&self.backend, fd, &local, key)
    }
}
