//! In-memory [`Host`] replaying scripted results.

use core::net::{Ipv4Addr, SocketAddrV4};
use core::task::{Context, Poll};

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    AddrInfo, AddrInfoHints, Fd, FdFlags, Host, Interest, RiFlags, RoFlags, Shutdown, SiFlags,
    SockOpt,
};
use crate::addr::{Address, Family, SocketType};
use crate::Errno;

pub(crate) fn local() -> Address {
    Address::Inet4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 49152))
}

pub(crate) fn peer() -> Address {
    Address::Inet4(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 80))
}

/// Results handed out by [`Scripted`], consumed front to back.
///
/// Empty queues fall back to success, except for `accept` and `recv_from`,
/// which report [`Errno::AGAIN`].
#[derive(Default)]
pub(crate) struct Script {
    next_fd: Fd,
    flags: HashMap<Fd, FdFlags>,
    pub opened: Vec<(Fd, Family, SocketType)>,
    pub closed: Vec<Fd>,
    pub calls: Vec<String>,
    pub open: VecDeque<Errno>,
    pub bind: VecDeque<Errno>,
    pub connect: VecDeque<Errno>,
    pub so_error: VecDeque<i32>,
    pub setsockopt: HashMap<u32, Errno>,
    pub local: VecDeque<Result<Address, Errno>>,
    pub peer: VecDeque<Result<Address, Errno>>,
    pub accept: VecDeque<Result<Fd, Errno>>,
    pub recv_from: VecDeque<Result<(Vec<u8>, Option<Address>), Errno>>,
    /// Byte counts accepted by successive sends, the whole buffer once empty.
    pub send: VecDeque<usize>,
    pub sent: Vec<(Vec<u8>, Option<Address>)>,
    pub shutdown: VecDeque<Errno>,
    pub addrinfo: Vec<AddrInfo>,
    pub lookups: Vec<(String, String, AddrInfoHints, usize)>,
    /// Never report readiness.
    pub stalled: bool,
    pub polls: usize,
}

#[derive(Default)]
pub(crate) struct Scripted(Mutex<Script>);

impl Scripted {
    pub fn script(&self) -> MutexGuard<'_, Script> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn closed(&self) -> Vec<Fd> {
        self.script().closed.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    fn record(&self, call: impl Into<String>) -> MutexGuard<'_, Script> {
        let mut script = self.script();
        script.calls.push(call.into());
        script
    }
}

fn pop(queue: &mut VecDeque<Errno>) -> Result<(), Errno> {
    queue.pop_front().map_or(Ok(()), Errno::result)
}

impl Host for Scripted {
    fn open(&self, family: Family, socket_type: SocketType) -> Result<Fd, Errno> {
        let mut script = self.record("open");
        pop(&mut script.open)?;
        script.next_fd += 1;
        let fd = script.next_fd + 2;
        script.opened.push((fd, family, socket_type));
        script.flags.insert(fd, FdFlags::empty());
        Ok(fd)
    }

    fn bind(&self, _fd: Fd, addr: &Address) -> Result<(), Errno> {
        let mut script = self.record(format!("bind {addr}"));
        pop(&mut script.bind)
    }

    fn listen(&self, _fd: Fd, backlog: u32) -> Result<(), Errno> {
        self.record(format!("listen {backlog}"));
        Ok(())
    }

    fn connect(&self, _fd: Fd, addr: &Address) -> Result<(), Errno> {
        let mut script = self.record(format!("connect {addr}"));
        pop(&mut script.connect)
    }

    fn accept(&self, _fd: Fd) -> Result<Fd, Errno> {
        let mut script = self.record("accept");
        let fd = script.accept.pop_front().unwrap_or(Err(Errno::AGAIN))?;
        script.flags.insert(fd, FdFlags::empty());
        Ok(fd)
    }

    fn getsockopt(&self, _fd: Fd, opt: SockOpt) -> Result<i32, Errno> {
        let mut script = self.record(format!("getsockopt {opt:?}"));
        match opt {
            SockOpt::Error => Ok(script.so_error.pop_front().unwrap_or(0)),
            _ => Ok(0),
        }
    }

    fn setsockopt(&self, _fd: Fd, opt: SockOpt, value: i32) -> Result<(), Errno> {
        let script = self.record(format!("setsockopt {opt:?} {value}"));
        script.setsockopt.get(&(opt as u32)).copied().map_or(Ok(()), Err)
    }

    fn local_addr(&self, _fd: Fd) -> Result<Address, Errno> {
        let mut script = self.record("local_addr");
        script.local.pop_front().unwrap_or_else(|| Ok(local()))
    }

    fn peer_addr(&self, _fd: Fd) -> Result<Address, Errno> {
        let mut script = self.record("peer_addr");
        script.peer.pop_front().unwrap_or_else(|| Ok(peer()))
    }

    fn send(&self, _fd: Fd, buf: &[u8], _flags: SiFlags) -> Result<usize, Errno> {
        let mut script = self.record("send");
        let n = script.send.pop_front().unwrap_or(buf.len()).min(buf.len());
        script.sent.push((buf[..n].to_vec(), None));
        Ok(n)
    }

    fn send_to(
        &self,
        _fd: Fd,
        buf: &[u8],
        addr: &Address,
        _flags: SiFlags,
    ) -> Result<usize, Errno> {
        let mut script = self.record("send_to");
        script.sent.push((buf.to_vec(), Some(addr.clone())));
        Ok(buf.len())
    }

    fn recv(&self, fd: Fd, buf: &mut [u8], flags: RiFlags) -> Result<(usize, RoFlags), Errno> {
        let (n, _, flags) = self.recv_from(fd, buf, flags)?;
        Ok((n, flags))
    }

    fn recv_from(
        &self,
        _fd: Fd,
        buf: &mut [u8],
        _flags: RiFlags,
    ) -> Result<(usize, Option<Address>, RoFlags), Errno> {
        let mut script = self.record("recv_from");
        let (data, addr) = script.recv_from.pop_front().unwrap_or(Err(Errno::AGAIN))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        let flags = if n < data.len() {
            RoFlags::RECV_DATA_TRUNCATED
        } else {
            RoFlags::empty()
        };
        Ok((n, addr, flags))
    }

    fn shutdown(&self, _fd: Fd, how: Shutdown) -> Result<(), Errno> {
        let mut script = self.record(format!("shutdown {how:?}"));
        pop(&mut script.shutdown)
    }

    fn close(&self, fd: Fd) -> Result<(), Errno> {
        let mut script = self.record("close");
        script.closed.push(fd);
        script.flags.remove(&fd);
        Ok(())
    }

    fn fd_flags(&self, fd: Fd) -> Result<FdFlags, Errno> {
        self.script().flags.get(&fd).copied().ok_or(Errno::BADF)
    }

    fn set_fd_flags(&self, fd: Fd, flags: FdFlags) -> Result<(), Errno> {
        let mut script = self.script();
        let entry = script.flags.get_mut(&fd).ok_or(Errno::BADF)?;
        *entry = flags;
        Ok(())
    }

    fn getaddrinfo(
        &self,
        node: &str,
        service: &str,
        hints: &AddrInfoHints,
        capacity: usize,
    ) -> Result<Vec<AddrInfo>, Errno> {
        let mut script = self.record("getaddrinfo");
        script
            .lookups
            .push((node.into(), service.into(), *hints, capacity));
        Ok(script.addrinfo.iter().take(capacity).cloned().collect())
    }

    fn poll_ready(
        &self,
        _fd: Fd,
        _interest: Interest,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), Errno>> {
        let mut script = self.script();
        script.polls += 1;
        if script.stalled {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }
}
