//! In-memory stand-in for the kernel option table, used by unit tests.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{BorrowedFd, RawFd};

use parking_lot::Mutex;
use socket2::{Domain, SockRef, Socket};

use crate::errors::NativeOp;
use crate::native::{Md5Sig, OptionBackend};

/// Which native calls should fail, and with what errno.
#[derive(Debug, Clone, Copy, Default)]
pub struct Failures {
    pub open: Option<i32>,
    pub get: Option<i32>,
    pub set: Option<i32>,
    pub clear: Option<i32>,
    pub local_addr: Option<i32>,
}

/// Socket state observed when a record was handed to `set_option`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetState {
    pub listening: bool,
    pub connected: bool,
}

impl SetState {
    fn observe(fd: RawFd) -> Self {
        if fd < 0 {
            return Self::default();
        }
        // SAFETY: callers only pass descriptors of sockets alive for the call.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let socket = SockRef::from(&fd);
        Self {
            listening: socket.is_listener().unwrap_or(false),
            connected: socket.peer_addr().is_ok(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    keys: Mutex<HashMap<RawFd, Md5Sig>>,
    calls: Mutex<Vec<(NativeOp, RawFd)>>,
    sets: Mutex<Vec<Md5Sig>>,
    set_states: Mutex<Vec<SetState>>,
    failures: Failures,
    fresh_keylen: u16,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: Failures) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    /// Report `keylen` for descriptors that never had a key set.
    pub fn with_fresh_keylen(mut self, keylen: u16) -> Self {
        self.fresh_keylen = keylen;
        self
    }

    pub fn calls(&self) -> Vec<(NativeOp, RawFd)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Every record handed to `set_option`, oldest first.
    pub fn sets(&self) -> Vec<Md5Sig> {
        self.sets.lock().clone()
    }

    /// Socket state at each `set_option` call, oldest first.
    pub fn set_states(&self) -> Vec<SetState> {
        self.set_states.lock().clone()
    }

    pub fn last_set(&self) -> Option<Md5Sig> {
        self.sets.lock().last().copied()
    }

    /// Address a descriptor appears bound to.
    pub fn bound_address(fd: RawFd) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 10_000 + fd as u16))
    }

    fn record(&self, op: NativeOp, fd: RawFd) {
        self.calls.lock().push((op, fd));
    }
}

fn fail(errno: Option<i32>) -> io::Result<()> {
    match errno {
        Some(code) => Err(io::Error::from_raw_os_error(code)),
        None => Ok(()),
    }
}

impl OptionBackend for MemoryBackend {
    fn get_option(&self, fd: RawFd, record: &mut Md5Sig) -> io::Result<()> {
        self.record(NativeOp::Getsockopt, fd);
        fail(self.failures.get)?;
        match self.keys.lock().get(&fd) {
            Some(stored) => *record = *stored,
            None => record.keylen = self.fresh_keylen,
        }
        Ok(())
    }

    fn set_option(&self, fd: RawFd, record: &Md5Sig) -> io::Result<()> {
        self.record(NativeOp::Setsockopt, fd);
        self.sets.lock().push(*record);
        self.set_states.lock().push(SetState::observe(fd));
        if record.keylen == 0 {
            fail(self.failures.clear)?;
            // Removal without an address is silently ignored, as on kernels
            // that match the option instance by address.
            if record.address().is_some() {
                self.keys.lock().remove(&fd);
            }
        } else {
            fail(self.failures.set)?;
            self.keys.lock().insert(fd, *record);
        }
        Ok(())
    }

    fn local_addr(&self, fd: RawFd) -> io::Result<SocketAddr> {
        self.record(NativeOp::Getsockname, fd);
        fail(self.failures.local_addr)?;
        Ok(Self::bound_address(fd))
    }

    fn open_scratch(&self, domain: Domain) -> io::Result<Socket> {
        self.record(NativeOp::Socket, -1);
        fail(self.failures.open)?;
        Socket::new(domain, socket2::Type::STREAM, None)
    }
}
