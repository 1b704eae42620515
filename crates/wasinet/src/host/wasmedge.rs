//! WasmEdge socket extension of `wasi_snapshot_preview1`.
//!
//! Hosts before 0.12 report addresses through 16-byte buffers tagged by an
//! address type out-param, select that layout with the `wasmedge-legacy`
//! feature.

use core::ffi::c_void;
use core::ptr;
use core::task::{Context, Poll};

use super::{
    AddrInfo, AddrInfoHints, Fd, FdFlags, Host, Interest, RiFlags, RoFlags, Shutdown, SiFlags,
    SockOpt, SOL_SOCKET,
};
use crate::addr::{Address, Family, Protocol, RawSockAddr, SocketType};
use crate::Errno;

/// Length of the address data of a `getaddrinfo` result entry.
const ADDRINFO_DATA_LEN: usize = 26;

const EVENTTYPE_CLOCK: u8 = 0;
const EVENTTYPE_FD_READ: u8 = 1;
const EVENTTYPE_FD_WRITE: u8 = 2;
const CLOCKID_MONOTONIC: u32 = 1;

const READY_USERDATA: u64 = 1;

#[repr(C)]
struct Iovec {
    buf: *mut u8,
    len: usize,
}

#[repr(C)]
struct Ciovec {
    buf: *const u8,
    len: usize,
}

#[repr(C)]
#[derive(Default)]
struct FdStat {
    filetype: u8,
    flags: u16,
    rights_base: u64,
    rights_inheriting: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct SockAddr {
    family: u32,
    data_len: u32,
    data: *mut u8,
    _pad: [u8; 4],
}

#[repr(C)]
#[derive(Copy, Clone)]
struct RawAddrInfo {
    flags: u16,
    family: u8,
    socket_type: u8,
    protocol: u32,
    addr_len: u32,
    addr: *mut SockAddr,
    canonname: *mut u8,
    canonname_len: u32,
    next: *mut RawAddrInfo,
}

impl RawAddrInfo {
    fn hints(hints: &AddrInfoHints) -> Self {
        Self {
            flags: hints.flags.bits(),
            family: hints.family as u8,
            socket_type: hints.socket_type as u8,
            protocol: hints.protocol as u32,
            addr_len: 0,
            addr: ptr::null_mut(),
            canonname: ptr::null_mut(),
            canonname_len: 0,
            next: ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
struct SubscriptionClock {
    id: u32,
    timeout: u64,
    precision: u64,
    flags: u16,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct SubscriptionFdReadwrite {
    fd: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
union SubscriptionContents {
    clock: SubscriptionClock,
    fd_readwrite: SubscriptionFdReadwrite,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct Subscription {
    userdata: u64,
    tag: u8,
    contents: SubscriptionContents,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct EventFdReadwrite {
    nbytes: u64,
    flags: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
struct Event {
    userdata: u64,
    error: u16,
    ty: u8,
    fd_readwrite: EventFdReadwrite,
}

#[link(wasm_import_module = "wasi_snapshot_preview1")]
extern "C" {
    fn sock_open(family: u8, socket_type: u8, fd: *mut u32) -> u16;
    fn sock_bind(fd: u32, addr: *mut c_void, port: u32) -> u16;
    fn sock_listen(fd: u32, backlog: u32) -> u16;
    fn sock_connect(fd: u32, addr: *mut c_void, port: u32) -> u16;
    fn sock_accept(fd: u32, flags: u16, fd_new: *mut u32) -> u16;
    fn sock_setsockopt(fd: u32, level: u32, name: u32, value: *const i32, len: u32) -> u16;
    #[cfg(not(feature = "wasmedge-legacy"))]
    fn sock_getsockopt(fd: u32, level: u32, name: u32, value: *mut i32, len: u32) -> u16;
    #[cfg(feature = "wasmedge-legacy")]
    fn sock_getsockopt(fd: u32, level: u32, name: u32, value: *mut i32, len: *mut u32) -> u16;
    #[cfg(not(feature = "wasmedge-legacy"))]
    fn sock_getlocaladdr(fd: u32, addr: *mut c_void, port: *mut u32) -> u16;
    #[cfg(feature = "wasmedge-legacy")]
    fn sock_getlocaladdr(fd: u32, addr: *mut c_void, addr_type: *mut u32, port: *mut u32) -> u16;
    #[cfg(not(feature = "wasmedge-legacy"))]
    fn sock_getpeeraddr(fd: u32, addr: *mut c_void, port: *mut u32) -> u16;
    #[cfg(feature = "wasmedge-legacy")]
    fn sock_getpeeraddr(fd: u32, addr: *mut c_void, addr_type: *mut u32, port: *mut u32) -> u16;
    fn sock_send(
        fd: u32,
        iovs: *const Ciovec,
        iovs_len: u32,
        flags: u16,
        nwritten: *mut usize,
    ) -> u16;
    fn sock_send_to(
        fd: u32,
        iovs: *const Ciovec,
        iovs_len: u32,
        addr: *mut c_void,
        port: u32,
        flags: u16,
        nwritten: *mut usize,
    ) -> u16;
    fn sock_recv(
        fd: u32,
        iovs: *const Iovec,
        iovs_len: u32,
        flags: u16,
        nread: *mut usize,
        oflags: *mut u16,
    ) -> u16;
    #[cfg(not(feature = "wasmedge-legacy"))]
    fn sock_recv_from(
        fd: u32,
        iovs: *const Iovec,
        iovs_len: u32,
        addr: *mut c_void,
        flags: u16,
        port: *mut u32,
        nread: *mut usize,
        oflags: *mut u16,
    ) -> u16;
    #[cfg(feature = "wasmedge-legacy")]
    fn sock_recv_from(
        fd: u32,
        iovs: *const Iovec,
        iovs_len: u32,
        addr: *mut c_void,
        flags: u16,
        nread: *mut usize,
        oflags: *mut u16,
    ) -> u16;
    fn sock_shutdown(fd: u32, how: u8) -> u16;
    fn sock_getaddrinfo(
        node: *const u8,
        node_len: u32,
        service: *const u8,
        service_len: u32,
        hints: *const RawAddrInfo,
        res: *mut *mut RawAddrInfo,
        max_len: u32,
        res_len: *mut u32,
    ) -> u16;
    fn fd_close(fd: u32) -> u16;
    fn fd_fdstat_get(fd: u32, stat: *mut FdStat) -> u16;
    fn fd_fdstat_set_flags(fd: u32, flags: u16) -> u16;
    fn poll_oneoff(
        subscriptions: *const Subscription,
        events: *mut Event,
        nsubscriptions: u32,
        nevents: *mut u32,
    ) -> u16;
}

fn call(ret: u16) -> Result<(), Errno> {
    Errno::from_raw(ret).result()
}

/// Host-imported `wasi_snapshot_preview1` socket extension of WasmEdge.
#[derive(Copy, Clone, Debug, Default)]
pub struct WasmEdge;

impl WasmEdge {
    #[cfg(not(feature = "wasmedge-legacy"))]
    fn addr(
        fd: Fd,
        f: unsafe extern "C" fn(u32, *mut c_void, *mut u32) -> u16,
    ) -> Result<Address, Errno> {
        let mut raw = RawSockAddr::reply();
        let mut port = 0;
        let mut buf = raw.buffer();
        // SAFETY: `buf` points into `raw`, both outlive the call.
        call(unsafe { f(fd, ptr::addr_of_mut!(buf).cast(), &mut port) })?;
        raw.decode(port)
    }

    #[cfg(feature = "wasmedge-legacy")]
    fn addr(
        fd: Fd,
        f: unsafe extern "C" fn(u32, *mut c_void, *mut u32, *mut u32) -> u16,
    ) -> Result<Address, Errno> {
        let mut raw = RawSockAddr::legacy_reply();
        let mut addr_type = 0;
        let mut port = 0;
        let mut buf = raw.buffer();
        // SAFETY: `buf` points into `raw`, both outlive the call.
        call(unsafe { f(fd, ptr::addr_of_mut!(buf).cast(), &mut addr_type, &mut port) })?;
        raw.decode_legacy(addr_type, port)
    }
}

fn decode_addrinfo(info: &RawAddrInfo) -> Option<AddrInfo> {
    let family = Family::from_raw(info.family.into())?;
    let socket_type = match info.socket_type {
        1 => SocketType::Datagram,
        2 => SocketType::Stream,
        _ => SocketType::Any,
    };
    let protocol = match info.protocol {
        1 => Protocol::Tcp,
        2 => Protocol::Udp,
        _ => Protocol::Ip,
    };
    if info.addr.is_null() {
        return None;
    }
    // SAFETY: the host filled `addr` with a pointer into the buffers passed in.
    let sockaddr = unsafe { &*info.addr };
    if sockaddr.data.is_null() {
        return None;
    }
    // SAFETY: `data` points to an `ADDRINFO_DATA_LEN`-byte buffer owned by the caller.
    let data = unsafe { core::slice::from_raw_parts(sockaddr.data, ADDRINFO_DATA_LEN) };
    let port = u16::from_be_bytes([data[0], data[1]]);
    let address = match family {
        Family::Inet4 => {
            let ip = core::net::Ipv4Addr::new(data[2], data[3], data[4], data[5]);
            Address::Inet4(core::net::SocketAddrV4::new(ip, port))
        }
        Family::Inet6 => {
            let mut octets = [0; 16];
            octets.copy_from_slice(&data[2..18]);
            Address::from(core::net::SocketAddrV6::new(octets.into(), port, 0, 0))
        }
        Family::Unix | Family::Unspec => return None,
    };
    Some(AddrInfo {
        family,
        socket_type,
        protocol,
        address,
    })
}

impl Host for WasmEdge {
    fn open(&self, family: Family, socket_type: SocketType) -> Result<Fd, Errno> {
        let mut fd = 0;
        // SAFETY: `fd` is a valid out-param.
        call(unsafe { sock_open(family as u8, socket_type as u8, &mut fd) })?;
        Ok(fd)
    }

    fn bind(&self, fd: Fd, addr: &Address) -> Result<(), Errno> {
        let (mut raw, port) = RawSockAddr::encode(addr)?;
        let mut buf = raw.buffer();
        // SAFETY: `buf` points into `raw`, both outlive the call.
        call(unsafe { sock_bind(fd, ptr::addr_of_mut!(buf).cast(), port.into()) })
    }

    fn listen(&self, fd: Fd, backlog: u32) -> Result<(), Errno> {
        // SAFETY: no pointers are passed.
        call(unsafe { sock_listen(fd, backlog) })
    }

    fn connect(&self, fd: Fd, addr: &Address) -> Result<(), Errno> {
        let (mut raw, port) = RawSockAddr::encode(addr)?;
        let mut buf = raw.buffer();
        // SAFETY: `buf` points into `raw`, both outlive the call.
        call(unsafe { sock_connect(fd, ptr::addr_of_mut!(buf).cast(), port.into()) })
    }

    fn accept(&self, fd: Fd) -> Result<Fd, Errno> {
        let mut new = 0;
        // SAFETY: `new` is a valid out-param.
        call(unsafe { sock_accept(fd, FdFlags::NONBLOCK.bits(), &mut new) })?;
        Ok(new)
    }

    #[cfg(not(feature = "wasmedge-legacy"))]
    fn getsockopt(&self, fd: Fd, opt: SockOpt) -> Result<i32, Errno> {
        let mut value = 0i32;
        // SAFETY: `value` is a valid 4-byte out-param.
        call(unsafe { sock_getsockopt(fd, SOL_SOCKET, opt as u32, &mut value, 4) })?;
        Ok(value)
    }

    #[cfg(feature = "wasmedge-legacy")]
    fn getsockopt(&self, fd: Fd, opt: SockOpt) -> Result<i32, Errno> {
        let mut value = 0i32;
        let mut len = 4u32;
        // SAFETY: `value` and `len` are valid out-params.
        call(unsafe { sock_getsockopt(fd, SOL_SOCKET, opt as u32, &mut value, &mut len) })?;
        Ok(value)
    }

    fn setsockopt(&self, fd: Fd, opt: SockOpt, value: i32) -> Result<(), Errno> {
        // SAFETY: `value` is a valid 4-byte input.
        call(unsafe { sock_setsockopt(fd, SOL_SOCKET, opt as u32, &value, 4) })
    }

    fn local_addr(&self, fd: Fd) -> Result<Address, Errno> {
        Self::addr(fd, sock_getlocaladdr)
    }

    fn peer_addr(&self, fd: Fd) -> Result<Address, Errno> {
        Self::addr(fd, sock_getpeeraddr)
    }

    fn send(&self, fd: Fd, buf: &[u8], flags: SiFlags) -> Result<usize, Errno> {
        let iov = Ciovec {
            buf: buf.as_ptr(),
            len: buf.len(),
        };
        let mut n = 0;
        // SAFETY: `iov` describes `buf`, both outlive the call.
        call(unsafe { sock_send(fd, &iov, 1, flags.bits(), &mut n) })?;
        Ok(n)
    }

    fn send_to(
        &self,
        fd: Fd,
        buf: &[u8],
        addr: &Address,
        flags: SiFlags,
    ) -> Result<usize, Errno> {
        let (mut raw, port) = RawSockAddr::encode(addr)?;
        let mut addr = raw.buffer();
        let iov = Ciovec {
            buf: buf.as_ptr(),
            len: buf.len(),
        };
        let mut n = 0;
        // SAFETY: `iov` and `addr` describe buffers outliving the call.
        call(unsafe {
            sock_send_to(
                fd,
                &iov,
                1,
                ptr::addr_of_mut!(addr).cast(),
                port.into(),
                flags.bits(),
                &mut n,
            )
        })?;
        Ok(n)
    }

    fn recv(&self, fd: Fd, buf: &mut [u8], flags: RiFlags) -> Result<(usize, RoFlags), Errno> {
        let iov = Iovec {
            buf: buf.as_mut_ptr(),
            len: buf.len(),
        };
        let mut n = 0;
        let mut oflags = 0;
        // SAFETY: `iov` describes `buf`, both outlive the call.
        call(unsafe { sock_recv(fd, &iov, 1, flags.bits(), &mut n, &mut oflags) })?;
        Ok((n, RoFlags::from_bits_truncate(oflags)))
    }

    #[cfg(not(feature = "wasmedge-legacy"))]
    fn recv_from(
        &self,
        fd: Fd,
        buf: &mut [u8],
        flags: RiFlags,
    ) -> Result<(usize, Option<Address>, RoFlags), Errno> {
        let mut raw = RawSockAddr::reply();
        let mut addr = raw.buffer();
        let iov = Iovec {
            buf: buf.as_mut_ptr(),
            len: buf.len(),
        };
        let mut port = 0;
        let mut n = 0;
        let mut oflags = 0;
        // SAFETY: `iov` and `addr` describe buffers outliving the call.
        call(unsafe {
            sock_recv_from(
                fd,
                &iov,
                1,
                ptr::addr_of_mut!(addr).cast(),
                flags.bits(),
                &mut port,
                &mut n,
                &mut oflags,
            )
        })?;
        Ok((n, raw.decode(port).ok(), RoFlags::from_bits_truncate(oflags)))
    }

    #[cfg(feature = "wasmedge-legacy")]
    fn recv_from(
        &self,
        fd: Fd,
        buf: &mut [u8],
        flags: RiFlags,
    ) -> Result<(usize, Option<Address>, RoFlags), Errno> {
        let mut raw = RawSockAddr::legacy_reply();
        let mut addr = raw.buffer();
        let iov = Iovec {
            buf: buf.as_mut_ptr(),
            len: buf.len(),
        };
        let mut n = 0;
        let mut oflags = 0;
        // SAFETY: `iov` and `addr` describe buffers outliving the call.
        call(unsafe {
            sock_recv_from(
                fd,
                &iov,
                1,
                ptr::addr_of_mut!(addr).cast(),
                flags.bits(),
                &mut n,
                &mut oflags,
            )
        })?;
        Ok((
            n,
            raw.decode_legacy_source().ok(),
            RoFlags::from_bits_truncate(oflags),
        ))
    }

    fn shutdown(&self, fd: Fd, how: Shutdown) -> Result<(), Errno> {
        // SAFETY: no pointers are passed.
        call(unsafe { sock_shutdown(fd, how as u8) })
    }

    fn close(&self, fd: Fd) -> Result<(), Errno> {
        // SAFETY: no pointers are passed.
        call(unsafe { fd_close(fd) })
    }

    fn fd_flags(&self, fd: Fd) -> Result<FdFlags, Errno> {
        let mut stat = FdStat::default();
        // SAFETY: `stat` is a valid out-param.
        call(unsafe { fd_fdstat_get(fd, &mut stat) })?;
        Ok(FdFlags::from_bits_truncate(stat.flags))
    }

    fn set_fd_flags(&self, fd: Fd, flags: FdFlags) -> Result<(), Errno> {
        // SAFETY: no pointers are passed.
        call(unsafe { fd_fdstat_set_flags(fd, flags.bits()) })
    }

    fn getaddrinfo(
        &self,
        node: &str,
        service: &str,
        hints: &AddrInfoHints,
        capacity: usize,
    ) -> Result<Vec<AddrInfo>, Errno> {
        // the host expects NUL-terminated strings, with lengths including the terminator
        let node = [node.as_bytes(), &[0]].concat();
        let service = [service.as_bytes(), &[0]].concat();
        let node_len = u32::try_from(node.len()).map_err(|_| Errno::NAMETOOLONG)?;
        let service_len = u32::try_from(service.len()).map_err(|_| Errno::NAMETOOLONG)?;
        let max_len = u32::try_from(capacity).map_err(|_| Errno::INVAL)?;

        let mut data = vec![[0u8; ADDRINFO_DATA_LEN]; capacity];
        let mut sockaddrs: Vec<SockAddr> = data
            .iter_mut()
            .map(|data| SockAddr {
                family: 0,
                data_len: ADDRINFO_DATA_LEN as u32,
                data: data.as_mut_ptr(),
                _pad: [0; 4],
            })
            .collect();
        let mut infos: Vec<RawAddrInfo> = sockaddrs
            .iter_mut()
            .map(|addr| RawAddrInfo {
                addr_len: core::mem::size_of::<SockAddr>() as u32,
                addr,
                ..RawAddrInfo::hints(hints)
            })
            .collect();
        for i in 1..infos.len() {
            let next = ptr::addr_of_mut!(infos[i]);
            infos[i - 1].next = next;
        }
        let hints = RawAddrInfo::hints(hints);
        let mut res = infos.as_mut_ptr();
        let mut res_len = 0;
        // SAFETY: the result chain, its sockaddrs and their data buffers are
        // owned by this frame and outlive the call.
        call(unsafe {
            sock_getaddrinfo(
                node.as_ptr(),
                node_len,
                service.as_ptr(),
                service_len,
                &hints,
                &mut res,
                max_len,
                &mut res_len,
            )
        })?;
        let n = usize::try_from(res_len).map_or(capacity, |n| n.min(capacity));
        Ok(infos[..n].iter().filter_map(decode_addrinfo).collect())
    }

    fn poll_ready(
        &self,
        fd: Fd,
        interest: Interest,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Errno>> {
        let tag = match interest {
            Interest::Readable => EVENTTYPE_FD_READ,
            Interest::Writable => EVENTTYPE_FD_WRITE,
        };
        let subscriptions = [
            Subscription {
                userdata: READY_USERDATA,
                tag,
                contents: SubscriptionContents {
                    fd_readwrite: SubscriptionFdReadwrite { fd },
                },
            },
            Subscription {
                userdata: 0,
                tag: EVENTTYPE_CLOCK,
                contents: SubscriptionContents {
                    clock: SubscriptionClock {
                        id: CLOCKID_MONOTONIC,
                        timeout: 0,
                        precision: 0,
                        flags: 0,
                    },
                },
            },
        ];
        let mut events = [Event::default(); 2];
        let mut n = 0;
        // SAFETY: both arrays hold two entries and outlive the call.
        if let Err(err) = call(unsafe {
            poll_oneoff(subscriptions.as_ptr(), events.as_mut_ptr(), 2, &mut n)
        }) {
            return Poll::Ready(Err(err));
        }
        let n = usize::try_from(n).map_or(0, |n| n.min(events.len()));
        if events[..n]
            .iter()
            .any(|event| event.userdata == READY_USERDATA && event.ty == tag)
        {
            return Poll::Ready(Ok(()));
        }
        // no scheduler to register with, yield and poll again
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
