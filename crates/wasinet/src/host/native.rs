use core::net::{IpAddr, SocketAddr};
use core::task::{Context, Poll};

use std::collections::HashMap;
use std::io;
use std::net::ToSocketAddrs as _;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd as _, IntoRawFd as _, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, PoisonError};

use rustix::fs::{fcntl_getfl, fcntl_setfl, OFlags};
use rustix::net::{sockopt, AddressFamily, RecvFlags, SendFlags, SocketAddrAny, SocketAddrUnix};
use tokio::io::unix::AsyncFd;
use tokio::runtime::RuntimeFlavor;
use tracing::{debug, warn};

use super::{
    AddrInfo, AddrInfoHints, AiFlags, Fd, FdFlags, Host, Interest, RiFlags, RoFlags, Shutdown,
    SiFlags, SockOpt,
};
use crate::addr::{Address, Family, SocketType};
use crate::Errno;

impl From<rustix::io::Errno> for Errno {
    fn from(err: rustix::io::Errno) -> Self {
        use rustix::io::Errno as Native;

        match err {
            Native::WOULDBLOCK => Self::AGAIN,
            #[allow(unreachable_patterns)] // EWOULDBLOCK and EAGAIN can have the same value.
            Native::AGAIN => Self::AGAIN,
            Native::INTR => Self::INTR,
            Native::INPROGRESS => Self::INPROGRESS,
            Native::ALREADY => Self::ALREADY,
            Native::ISCONN => Self::ISCONN,
            Native::NOTCONN => Self::NOTCONN,
            Native::PERM => Self::PERM,
            Native::ACCESS => Self::ACCES,
            Native::ADDRINUSE => Self::ADDRINUSE,
            Native::ADDRNOTAVAIL => Self::ADDRNOTAVAIL,
            Native::AFNOSUPPORT => Self::AFNOSUPPORT,
            Native::BADF => Self::BADF,
            Native::TIMEDOUT => Self::TIMEDOUT,
            Native::CONNREFUSED => Self::CONNREFUSED,
            Native::CONNRESET => Self::CONNRESET,
            Native::CONNABORTED => Self::CONNABORTED,
            Native::DESTADDRREQ => Self::DESTADDRREQ,
            Native::FAULT => Self::FAULT,
            Native::INVAL => Self::INVAL,
            Native::IO => Self::IO,
            Native::HOSTUNREACH => Self::HOSTUNREACH,
            Native::HOSTDOWN => Self::HOSTUNREACH,
            Native::NETDOWN => Self::NETDOWN,
            Native::NETRESET => Self::NETRESET,
            Native::NETUNREACH => Self::NETUNREACH,
            Native::NFILE => Self::NFILE,
            Native::MFILE => Self::MFILE,
            Native::MSGSIZE => Self::MSGSIZE,
            Native::NAMETOOLONG => Self::NAMETOOLONG,
            Native::NOENT => Self::NOENT,
            Native::NOMEM => Self::NOMEM,
            Native::NOBUFS => Self::NOBUFS,
            Native::NOSYS => Self::NOSYS,
            Native::NOTSOCK => Self::NOTSOCK,
            Native::NOTSUP => Self::NOTSUP,
            #[allow(unreachable_patterns)] // EOPNOTSUPP and ENOTSUP can have the same value.
            Native::OPNOTSUPP => Self::NOTSUP,
            Native::NOPROTOOPT => Self::NOPROTOOPT,
            Native::PIPE => Self::PIPE,
            Native::PROTONOSUPPORT => Self::PROTONOSUPPORT,
            Native::PROTOTYPE => Self::PROTOTYPE,
            _ => {
                warn!(?err, "unknown native error");
                Self::IO
            }
        }
    }
}

impl From<&io::Error> for Errno {
    fn from(err: &io::Error) -> Self {
        rustix::io::Errno::from_io_error(err).map_or(Self::IO, Self::from)
    }
}

/// Borrows a descriptor owned by a [`super::Descriptor`] for the duration of
/// one call.
fn borrow<'a>(fd: Fd) -> Result<BorrowedFd<'a>, Errno> {
    let raw = RawFd::try_from(fd).map_err(|_| Errno::BADF)?;
    // SAFETY: descriptor numbers handed to the host are owned by a live
    // `Descriptor`, which only closes them through `Host::close`.
    Ok(unsafe { BorrowedFd::borrow_raw(raw) })
}

fn into_fd(fd: OwnedFd) -> Result<Fd, Errno> {
    let n = Fd::try_from(fd.as_raw_fd()).map_err(|_| Errno::BADF)?;
    let _ = fd.into_raw_fd();
    Ok(n)
}

fn ip(addr: &Address) -> Result<SocketAddr, Errno> {
    addr.to_socket_addr().ok_or(Errno::AFNOSUPPORT)
}

fn unix(path: &str) -> Result<SocketAddrUnix, Errno> {
    Ok(SocketAddrUnix::new(path)?)
}

fn from_any(addr: SocketAddrAny) -> Result<Address, Errno> {
    match addr {
        SocketAddrAny::V4(addr) => Ok(addr.into()),
        SocketAddrAny::V6(addr) => Ok(addr.into()),
        SocketAddrAny::Unix(addr) => Ok(Address::Unix(
            addr.path()
                .map(|path| path.to_string_lossy().into())
                .unwrap_or_default(),
        )),
        #[allow(unreachable_patterns)]
        _ => Err(Errno::AFNOSUPPORT),
    }
}

fn recv_flags(flags: RiFlags) -> RecvFlags {
    let mut native = RecvFlags::empty();
    if flags.contains(RiFlags::RECV_PEEK) {
        native |= RecvFlags::PEEK;
    }
    if flags.contains(RiFlags::RECV_WAITALL) {
        native |= RecvFlags::WAITALL;
    }
    native
}

fn bool_opt(value: bool) -> i32 {
    i32::from(value)
}

fn size_opt(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Blocking system resolver lookup, moved off the reactor thread when running
/// on a multi-threaded runtime.
fn lookup(node: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let lookup = || (node, port).to_socket_addrs().map(Iterator::collect);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(lookup)
        }
        _ => lookup(),
    }
}

struct Registered(RawFd);

impl AsRawFd for Registered {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Host backed by the operating system socket API.
///
/// Readiness is delivered by the tokio reactor, descriptors are registered
/// with it on first poll and deregistered on close.
#[derive(Default)]
pub struct Native {
    registry: Mutex<HashMap<Fd, Arc<AsyncFd<Registered>>>>,
}

impl Native {
    fn registration(&self, fd: Fd) -> Result<Arc<AsyncFd<Registered>>, Errno> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(registration) = registry.get(&fd) {
            return Ok(Arc::clone(registration));
        }
        let raw = RawFd::try_from(fd).map_err(|_| Errno::BADF)?;
        let registration = AsyncFd::with_interest(
            Registered(raw),
            tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
        )
        .map_err(|err| Errno::from(&err))?;
        let registration = Arc::new(registration);
        registry.insert(fd, Arc::clone(&registration));
        Ok(registration)
    }
}

impl Host for Native {
    fn open(&self, family: Family, socket_type: SocketType) -> Result<Fd, Errno> {
        let domain = match family {
            Family::Inet4 => AddressFamily::INET,
            Family::Inet6 => AddressFamily::INET6,
            Family::Unix => AddressFamily::UNIX,
            Family::Unspec => return Err(Errno::AFNOSUPPORT),
        };
        let ty = match socket_type {
            SocketType::Stream => rustix::net::SocketType::STREAM,
            SocketType::Datagram => rustix::net::SocketType::DGRAM,
            SocketType::Any => return Err(Errno::PROTOTYPE),
        };
        into_fd(rustix::net::socket(domain, ty, None)?)
    }

    fn bind(&self, fd: Fd, addr: &Address) -> Result<(), Errno> {
        let fd = borrow(fd)?;
        match addr {
            Address::Unix(path) => rustix::net::bind_unix(fd, &unix(path)?)?,
            addr => rustix::net::bind(fd, &ip(addr)?)?,
        }
        Ok(())
    }

    fn listen(&self, fd: Fd, backlog: u32) -> Result<(), Errno> {
        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        rustix::net::listen(borrow(fd)?, backlog)?;
        Ok(())
    }

    fn connect(&self, fd: Fd, addr: &Address) -> Result<(), Errno> {
        let fd = borrow(fd)?;
        match addr {
            Address::Unix(path) => rustix::net::connect_unix(fd, &unix(path)?)?,
            addr => rustix::net::connect(fd, &ip(addr)?)?,
        }
        Ok(())
    }

    fn accept(&self, fd: Fd) -> Result<Fd, Errno> {
        into_fd(rustix::net::accept(borrow(fd)?)?)
    }

    fn getsockopt(&self, fd: Fd, opt: SockOpt) -> Result<i32, Errno> {
        let fd = borrow(fd)?;
        let value = match opt {
            SockOpt::ReuseAddr => bool_opt(sockopt::get_socket_reuseaddr(fd)?),
            SockOpt::Type => match sockopt::get_socket_type(fd)? {
                rustix::net::SocketType::STREAM => SocketType::Stream as i32,
                rustix::net::SocketType::DGRAM => SocketType::Datagram as i32,
                _ => SocketType::Any as i32,
            },
            SockOpt::Error => match sockopt::get_socket_error(fd)? {
                Ok(()) => 0,
                Err(err) => Errno::from(err).raw().into(),
            },
            SockOpt::Broadcast => bool_opt(sockopt::get_socket_broadcast(fd)?),
            SockOpt::SendBuffer => size_opt(sockopt::get_socket_send_buffer_size(fd)?),
            SockOpt::RecvBuffer => size_opt(sockopt::get_socket_recv_buffer_size(fd)?),
            SockOpt::KeepAlive => bool_opt(sockopt::get_socket_keepalive(fd)?),
            SockOpt::DontRoute => return Err(Errno::NOPROTOOPT),
        };
        Ok(value)
    }

    fn setsockopt(&self, fd: Fd, opt: SockOpt, value: i32) -> Result<(), Errno> {
        let fd = borrow(fd)?;
        match opt {
            SockOpt::ReuseAddr => sockopt::set_socket_reuseaddr(fd, value != 0)?,
            SockOpt::Broadcast => sockopt::set_socket_broadcast(fd, value != 0)?,
            SockOpt::KeepAlive => sockopt::set_socket_keepalive(fd, value != 0)?,
            SockOpt::SendBuffer => {
                let size = usize::try_from(value).map_err(|_| Errno::INVAL)?;
                sockopt::set_socket_send_buffer_size(fd, size)?
            }
            SockOpt::RecvBuffer => {
                let size = usize::try_from(value).map_err(|_| Errno::INVAL)?;
                sockopt::set_socket_recv_buffer_size(fd, size)?
            }
            SockOpt::Type | SockOpt::Error | SockOpt::DontRoute => {
                return Err(Errno::NOPROTOOPT)
            }
        }
        Ok(())
    }

    fn local_addr(&self, fd: Fd) -> Result<Address, Errno> {
        from_any(rustix::net::getsockname(borrow(fd)?)?)
    }

    fn peer_addr(&self, fd: Fd) -> Result<Address, Errno> {
        let addr = rustix::net::getpeername(borrow(fd)?)?;
        from_any(addr.ok_or(Errno::NOTCONN)?)
    }

    fn send(&self, fd: Fd, buf: &[u8], _flags: SiFlags) -> Result<usize, Errno> {
        Ok(rustix::net::send(borrow(fd)?, buf, SendFlags::empty())?)
    }

    fn send_to(
        &self,
        fd: Fd,
        buf: &[u8],
        addr: &Address,
        _flags: SiFlags,
    ) -> Result<usize, Errno> {
        let fd = borrow(fd)?;
        let n = match addr {
            Address::Unix(path) => {
                rustix::net::sendto_unix(fd, buf, SendFlags::empty(), &unix(path)?)?
            }
            addr => rustix::net::sendto(fd, buf, SendFlags::empty(), &ip(addr)?)?,
        };
        Ok(n)
    }

    fn recv(&self, fd: Fd, buf: &mut [u8], flags: RiFlags) -> Result<(usize, RoFlags), Errno> {
        let n = rustix::net::recv(borrow(fd)?, buf, recv_flags(flags))?;
        Ok((n, RoFlags::empty()))
    }

    fn recv_from(
        &self,
        fd: Fd,
        buf: &mut [u8],
        flags: RiFlags,
    ) -> Result<(usize, Option<Address>, RoFlags), Errno> {
        let (n, addr) = rustix::net::recvfrom(borrow(fd)?, buf, recv_flags(flags))?;
        let addr = addr.map(from_any).transpose()?;
        Ok((n, addr, RoFlags::empty()))
    }

    fn shutdown(&self, fd: Fd, how: Shutdown) -> Result<(), Errno> {
        let how = match how {
            Shutdown::Read => rustix::net::Shutdown::Read,
            Shutdown::Write => rustix::net::Shutdown::Write,
            Shutdown::Both => rustix::net::Shutdown::ReadWrite,
        };
        rustix::net::shutdown(borrow(fd)?, how)?;
        Ok(())
    }

    fn close(&self, fd: Fd) -> Result<(), Errno> {
        let raw = RawFd::try_from(fd).map_err(|_| Errno::BADF)?;
        // deregister before the number can be reused
        let registration = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fd);
        drop(registration);
        // SAFETY: the caller owns `fd` and gives it up here.
        drop(unsafe { OwnedFd::from_raw_fd(raw) });
        Ok(())
    }

    fn fd_flags(&self, fd: Fd) -> Result<FdFlags, Errno> {
        let native = fcntl_getfl(borrow(fd)?)?;
        let mut flags = FdFlags::empty();
        if native.contains(OFlags::NONBLOCK) {
            flags |= FdFlags::NONBLOCK;
        }
        if native.contains(OFlags::APPEND) {
            flags |= FdFlags::APPEND;
        }
        Ok(flags)
    }

    fn set_fd_flags(&self, fd: Fd, flags: FdFlags) -> Result<(), Errno> {
        let fd = borrow(fd)?;
        let mut native = fcntl_getfl(fd)?;
        native.set(OFlags::NONBLOCK, flags.contains(FdFlags::NONBLOCK));
        native.set(OFlags::APPEND, flags.contains(FdFlags::APPEND));
        fcntl_setfl(fd, native)?;
        Ok(())
    }

    fn getaddrinfo(
        &self,
        node: &str,
        service: &str,
        hints: &AddrInfoHints,
        capacity: usize,
    ) -> Result<Vec<AddrInfo>, Errno> {
        let port = service.parse::<u16>().map_err(|_| Errno::INVAL)?;
        if hints.flags.contains(AiFlags::NUMERICHOST) && node.parse::<IpAddr>().is_err() {
            return Err(Errno::INVAL);
        }
        let addrs = lookup(node, port).map_err(|err| {
            debug!(?err, node, "native lookup failed");
            Errno::from(&err)
        })?;
        Ok(addrs
            .into_iter()
            .map(Address::from)
            .filter(|addr| match hints.family {
                Family::Unspec => true,
                family => addr.family() == family,
            })
            .take(capacity)
            .map(|address| AddrInfo {
                family: address.family(),
                socket_type: hints.socket_type,
                protocol: hints.protocol,
                address,
            })
            .collect())
    }

    fn poll_ready(
        &self,
        fd: Fd,
        interest: Interest,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Errno>> {
        let registration = match self.registration(fd) {
            Ok(registration) => registration,
            Err(err) => return Poll::Ready(Err(err)),
        };
        let ready = match interest {
            Interest::Readable => registration.poll_read_ready(cx),
            Interest::Writable => registration.poll_write_ready(cx),
        };
        match ready {
            Poll::Ready(Ok(mut guard)) => {
                guard.clear_ready();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(Errno::from(&err))),
            Poll::Pending => Poll::Pending,
        }
    }
}
