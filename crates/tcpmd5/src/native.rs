//! Kernel ABI for the `TCP_MD5SIG` socket option
//!
//! [`Md5Sig`] mirrors Linux `struct tcp_md5sig` byte for byte. All native
//! calls go through [`OptionBackend`] so the accessor and the capability
//! probe never touch `libc` directly.

use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{BorrowedFd, RawFd};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::types::KEY_BUFFER_CAPACITY;

/// `IPPROTO_TCP`-level option number of the MD5 signature option.
pub const TCP_MD5SIG: libc::c_int = 14;

/// In-memory image of `struct tcp_md5sig`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Md5Sig {
    pub addr: libc::sockaddr_storage,
    pub flags: u8,
    pub prefixlen: u8,
    pub keylen: u16,
    pub ifindex: libc::c_int,
    pub key: [u8; KEY_BUFFER_CAPACITY],
}

impl Md5Sig {
    /// A record with every byte cleared, including padding.
    pub fn zeroed() -> Self {
        // SAFETY: Md5Sig is plain old data; the all-zero bit pattern is a
        // valid value for every field.
        unsafe { mem::zeroed() }
    }

    /// Key bytes as reported by `keylen`, or `None` when `keylen` exceeds the
    /// buffer.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.get(..usize::from(self.keylen))
    }

    /// Copy `key` into the buffer and set `keylen`. The caller validates the
    /// length first.
    pub(crate) fn fill_key(&mut self, key: &[u8]) {
        debug_assert!(key.len() <= KEY_BUFFER_CAPACITY);
        self.key[..key.len()].copy_from_slice(key);
        self.keylen = key.len() as u16;
    }

    /// Store `addr` in the family-tagged address field.
    pub fn set_address(&mut self, addr: &SocketAddr) {
        self.addr = sockaddr_from(addr);
    }

    /// Address field decoded back into a [`SocketAddr`], if it holds one.
    pub fn address(&self) -> Option<SocketAddr> {
        sockaddr_to(&self.addr)
    }
}

impl fmt::Debug for Md5Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Md5Sig")
            .field("addr", &self.address())
            .field("flags", &self.flags)
            .field("prefixlen", &self.prefixlen)
            .field("keylen", &self.keylen)
            .field("ifindex", &self.ifindex)
            .finish_non_exhaustive()
    }
}

fn sockaddr_from(addr: &SocketAddr) -> libc::sockaddr_storage {
    // SAFETY: sockaddr_storage is plain old data.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: sockaddr_storage is large enough and suitably aligned
            // for every concrete socket address type.
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
        }
        SocketAddr::V6(v6) => {
            // SAFETY: as above.
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.ip().octets(),
            };
            sin6.sin6_scope_id = v6.scope_id();
        }
    }
    storage
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            // SAFETY: the family tag says the storage holds a sockaddr_in.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            // SAFETY: the family tag says the storage holds a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Native calls needed by the accessor and the capability probe.
pub trait OptionBackend: Send + Sync {
    /// `getsockopt(fd, IPPROTO_TCP, TCP_MD5SIG)` into `record`.
    fn get_option(&self, fd: RawFd, record: &mut Md5Sig) -> io::Result<()>;

    /// `setsockopt(fd, IPPROTO_TCP, TCP_MD5SIG)` from `record`.
    fn set_option(&self, fd: RawFd, record: &Md5Sig) -> io::Result<()>;

    /// Current local binding of `fd` (`getsockname`).
    fn local_addr(&self, fd: RawFd) -> io::Result<SocketAddr>;

    /// Throwaway TCP socket used by the capability probe.
    fn open_scratch(&self, domain: Domain) -> io::Result<Socket> {
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
    }
}

/// Backend issuing real system calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelBackend;

impl OptionBackend for KernelBackend {
    #[cfg(target_os = "linux")]
    fn get_option(&self, fd: RawFd, record: &mut Md5Sig) -> io::Result<()> {
        let mut len = mem::size_of::<Md5Sig>() as libc::socklen_t;
        // SAFETY: record is a valid, writable Md5Sig and len is its size.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                TCP_MD5SIG,
                record as *mut Md5Sig as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    #[cfg(target_os = "linux")]
    fn set_option(&self, fd: RawFd, record: &Md5Sig) -> io::Result<()> {
        // SAFETY: record is a valid Md5Sig and the length matches it.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                TCP_MD5SIG,
                record as *const Md5Sig as *const libc::c_void,
                mem::size_of::<Md5Sig>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn get_option(&self, _fd: RawFd, _record: &mut Md5Sig) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::ENOPROTOOPT))
    }

    #[cfg(not(target_os = "linux"))]
    fn set_option(&self, _fd: RawFd, _record: &Md5Sig) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::ENOPROTOOPT))
    }

    fn local_addr(&self, fd: RawFd) -> io::Result<SocketAddr> {
        // SAFETY: the caller's handle keeps fd open for the duration of the
        // call.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let addr = SockRef::from(&borrowed).local_addr()?;
        addr.as_socket().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket is not bound to an inet address",
            )
        })
    }
}
