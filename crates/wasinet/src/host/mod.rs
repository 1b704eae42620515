//! Host socket ABI bridge.
//!
//! [`Host`] exposes one method per primitive socket call of the host. Calls
//! are non-blocking, report failures as [`Errno`] and never release resources
//! implicitly. Backends are selected at build time, see [`platform`].

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll, Waker};

use std::sync::{Arc, Mutex, PoisonError};

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::addr::{Address, Family, Protocol, SocketType};
use crate::Errno;

#[cfg(unix)]
mod native;
#[cfg(target_os = "wasi")]
mod wasmedge;

#[cfg(test)]
pub(crate) mod scripted;

#[cfg(unix)]
pub use native::Native;
#[cfg(target_os = "wasi")]
pub use wasmedge::WasmEdge;

/// Host descriptor number.
pub type Fd = u32;

bitflags! {
    /// Descriptor flags as reported by `fd_fdstat_get`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct FdFlags: u16 {
        const APPEND = 1 << 0;
        const DSYNC = 1 << 1;
        const NONBLOCK = 1 << 2;
        const RSYNC = 1 << 3;
        const SYNC = 1 << 4;
    }

    /// Flags of a receive call.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct RiFlags: u16 {
        const RECV_PEEK = 1 << 0;
        const RECV_WAITALL = 1 << 1;
    }

    /// Flags reported by a receive call.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct RoFlags: u16 {
        const RECV_DATA_TRUNCATED = 1 << 0;
    }

    /// Flags of a send call, none are defined.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct SiFlags: u16 {}

    /// `getaddrinfo` hint flags.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct AiFlags: u16 {
        const PASSIVE = 1 << 0;
        const CANONNAME = 1 << 1;
        const NUMERICHOST = 1 << 2;
        const NUMERICSERV = 1 << 3;
        const V4MAPPED = 1 << 4;
        const ALL = 1 << 5;
        const ADDRCONFIG = 1 << 6;
    }
}

/// Socket-level option, all options carry an integer value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SockOpt {
    ReuseAddr = 0,
    Type = 1,
    /// Pending error, cleared on read.
    Error = 2,
    DontRoute = 3,
    Broadcast = 4,
    SendBuffer = 5,
    RecvBuffer = 6,
    KeepAlive = 7,
}

/// Option level of all [`SockOpt`]s.
pub const SOL_SOCKET: u32 = 0;

/// Direction of a half-close.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Shutdown {
    Read = 1,
    Write = 2,
    Both = 3,
}

/// Readiness a task can wait for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Interest {
    Readable,
    Writable,
}

/// `getaddrinfo` hints.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddrInfoHints {
    pub flags: AiFlags,
    pub family: Family,
    pub socket_type: SocketType,
    pub protocol: Protocol,
}

/// One `getaddrinfo` result entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddrInfo {
    pub family: Family,
    pub socket_type: SocketType,
    pub protocol: Protocol,
    pub address: Address,
}

/// Primitive socket calls of a host.
///
/// Implementations must be non-blocking: every call either completes
/// immediately or fails with [`Errno::AGAIN`] / [`Errno::INPROGRESS`], after
/// which callers wait using [`Host::poll_ready`].
pub trait Host: Send + Sync {
    fn open(&self, family: Family, socket_type: SocketType) -> Result<Fd, Errno>;

    fn bind(&self, fd: Fd, addr: &Address) -> Result<(), Errno>;

    fn listen(&self, fd: Fd, backlog: u32) -> Result<(), Errno>;

    fn connect(&self, fd: Fd, addr: &Address) -> Result<(), Errno>;

    fn accept(&self, fd: Fd) -> Result<Fd, Errno>;

    fn getsockopt(&self, fd: Fd, opt: SockOpt) -> Result<i32, Errno>;

    fn setsockopt(&self, fd: Fd, opt: SockOpt, value: i32) -> Result<(), Errno>;

    fn local_addr(&self, fd: Fd) -> Result<Address, Errno>;

    fn peer_addr(&self, fd: Fd) -> Result<Address, Errno>;

    fn send(&self, fd: Fd, buf: &[u8], flags: SiFlags) -> Result<usize, Errno>;

    fn send_to(&self, fd: Fd, buf: &[u8], addr: &Address, flags: SiFlags)
        -> Result<usize, Errno>;

    fn recv(&self, fd: Fd, buf: &mut [u8], flags: RiFlags) -> Result<(usize, RoFlags), Errno>;

    /// Receives a datagram, returning the source address if the host
    /// reported one.
    fn recv_from(
        &self,
        fd: Fd,
        buf: &mut [u8],
        flags: RiFlags,
    ) -> Result<(usize, Option<Address>, RoFlags), Errno>;

    fn shutdown(&self, fd: Fd, how: Shutdown) -> Result<(), Errno>;

    fn close(&self, fd: Fd) -> Result<(), Errno>;

    fn fd_flags(&self, fd: Fd) -> Result<FdFlags, Errno>;

    fn set_fd_flags(&self, fd: Fd, flags: FdFlags) -> Result<(), Errno>;

    /// Resolves `node` and `service`, returning at most `capacity` entries in
    /// host order.
    fn getaddrinfo(
        &self,
        node: &str,
        service: &str,
        hints: &AddrInfoHints,
        capacity: usize,
    ) -> Result<Vec<AddrInfo>, Errno>;

    /// Polls `fd` for readiness.
    ///
    /// Returning [`Poll::Ready`] consumes the readiness: the next call only
    /// completes after the host reports readiness anew, so callers must retry
    /// their operation before polling again.
    fn poll_ready(
        &self,
        fd: Fd,
        interest: Interest,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Errno>>;
}

/// Returns the backend of the platform this crate was built for.
#[cfg(unix)]
pub fn platform() -> Arc<dyn Host> {
    Arc::new(Native::default())
}

/// Returns the backend of the platform this crate was built for.
#[cfg(target_os = "wasi")]
pub fn platform() -> Arc<dyn Host> {
    Arc::new(WasmEdge)
}

#[cfg(not(any(unix, target_os = "wasi")))]
compile_error!("no socket host backend is available for this target");

/// Owned host descriptor, closed exactly once.
///
/// Tasks waiting for readiness park their wakers on the descriptor, closing
/// it or shutting down its reading side wakes all of them.
pub struct Descriptor {
    host: Arc<dyn Host>,
    fd: Fd,
    closed: AtomicBool,
    read_shutdown: AtomicBool,
    waiters: Mutex<Vec<Waker>>,
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("fd", &self.fd)
            .field("closed", &self.closed)
            .field("read_shutdown", &self.read_shutdown)
            .finish()
    }
}

impl Descriptor {
    /// Opens a new socket descriptor.
    pub fn open(host: Arc<dyn Host>, family: Family, ty: SocketType) -> Result<Self, Errno> {
        let fd = host.open(family, ty)?;
        trace!(fd, ?family, ?ty, "opened socket");
        Ok(Self::from_raw(host, fd))
    }

    /// Takes ownership of `fd`.
    pub fn from_raw(host: Arc<dyn Host>, fd: Fd) -> Self {
        Self {
            host,
            fd,
            closed: AtomicBool::new(false),
            read_shutdown: AtomicBool::new(false),
            waiters: Mutex::default(),
        }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Returns the descriptor number, or `None` once closed.
    pub fn fd(&self) -> Option<Fd> {
        if self.closed.load(Ordering::Acquire) {
            None
        } else {
            Some(self.fd)
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns `true` once the reading side was shut down.
    pub fn is_read_shutdown(&self) -> bool {
        self.read_shutdown.load(Ordering::Acquire)
    }

    /// Registers `waker` to be woken when the descriptor is closed or its
    /// reading side is shut down.
    pub(crate) fn park(&self, waker: &Waker) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        if !waiters.iter().any(|w| w.will_wake(waker)) {
            waiters.push(waker.clone());
        }
    }

    /// Drops a registration of `waker`, if any.
    pub(crate) fn unpark(&self, waker: &Waker) {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|w| !w.will_wake(waker));
    }

    fn wake_all(&self) {
        let waiters = core::mem::take(
            &mut *self.waiters.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if !waiters.is_empty() {
            trace!(fd = self.fd, n = waiters.len(), "waking parked tasks");
        }
        for waker in waiters {
            waker.wake();
        }
    }

    /// Shuts down one or both directions of the socket.
    pub fn shutdown(&self, how: Shutdown) -> Result<(), Errno> {
        let fd = self.fd().ok_or(Errno::BADF)?;
        self.host.shutdown(fd, how)?;
        if how != Shutdown::Write {
            self.read_shutdown.store(true, Ordering::Release);
            self.wake_all();
        }
        Ok(())
    }

    /// Switches the descriptor to non-blocking mode.
    pub fn set_nonblocking(&self) -> Result<(), Errno> {
        let fd = self.fd().ok_or(Errno::BADF)?;
        let flags = self.host.fd_flags(fd)?;
        if flags.contains(FdFlags::NONBLOCK) {
            return Ok(());
        }
        self.host.set_fd_flags(fd, flags | FdFlags::NONBLOCK)
    }

    /// Closes the descriptor. Only the first call reaches the host.
    pub fn close(&self) -> Result<(), Errno> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        trace!(fd = self.fd, "closing descriptor");
        let res = self.host.close(self.fd);
        self.wake_all();
        res
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!(fd = self.fd, ?err, "failed to close descriptor");
        }
    }
}
