use core::future::poll_fn;
use core::task::{ready, Context, Poll};

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::addr::{check_unix_path, Address, Family, NetworkKind, SocketType};
use crate::host::{Descriptor, Host, Interest, RiFlags, RoFlags, Shutdown, SiFlags, SockOpt};
use crate::stream::poll_ready;
use crate::{connect, unix, Config, Errno, Error, ErrorKind, Op};

/// Datagram socket, optionally bound and optionally connected.
#[derive(Debug)]
pub struct PacketEndpoint {
    fd: Descriptor,
    network: NetworkKind,
    local: Address,
    remote: Option<Address>,
}

impl PacketEndpoint {
    fn new_descriptor(
        host: &Arc<dyn Host>,
        network: NetworkKind,
        family: Family,
    ) -> Result<Descriptor, ErrorKind> {
        if network.socket_type() != SocketType::Datagram {
            return Err(ErrorKind::UnsupportedNetwork(network.as_str().into()));
        }
        let fd = Descriptor::open(Arc::clone(host), family, SocketType::Datagram)
            .map_err(ErrorKind::host("socket"))?;
        fd.set_nonblocking().map_err(ErrorKind::host("setnonblock"))?;
        if !network.is_unix() {
            let raw = fd.fd().ok_or(ErrorKind::Closed)?;
            host.setsockopt(raw, SockOpt::Broadcast, 1)
                .map_err(ErrorKind::host("setsockopt"))?;
        }
        Ok(fd)
    }

    fn local_of(fd: &Descriptor, requested: &Address) -> Result<Address, ErrorKind> {
        let raw = fd.fd().ok_or(ErrorKind::Closed)?;
        match requested {
            Address::Unix(..) => Ok(requested.clone()),
            _ => fd
                .host()
                .local_addr(raw)
                .map_err(ErrorKind::host("getsockname")),
        }
    }

    /// Opens an unbound endpoint of `family`.
    pub(crate) fn open(
        host: &Arc<dyn Host>,
        network: NetworkKind,
        family: Family,
    ) -> Result<Self, ErrorKind> {
        let fd = Self::new_descriptor(host, network, family)?;
        let local = Address::wildcard(family, 0).unwrap_or_else(unix::unnamed);
        Ok(Self {
            fd,
            network,
            local,
            remote: None,
        })
    }

    /// Binds to the first of `addrs` that succeeds.
    pub(crate) fn bind(
        host: &Arc<dyn Host>,
        config: &Config,
        network: NetworkKind,
        addrs: &[Address],
    ) -> Result<Self, ErrorKind> {
        let mut last = ErrorKind::invalid_address("no address to bind");
        for addr in addrs {
            match Self::bind_addr(host, config, network, addr) {
                Ok(endpoint) => return Ok(endpoint),
                Err(e) => {
                    debug!(%addr, ?e, "bind attempt failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn bind_addr(
        host: &Arc<dyn Host>,
        config: &Config,
        network: NetworkKind,
        addr: &Address,
    ) -> Result<Self, ErrorKind> {
        if let Address::Unix(path) = addr {
            check_unix_path(path)?;
        }
        let fd = Self::new_descriptor(host, network, addr.family())?;
        let raw = fd.fd().ok_or(ErrorKind::Closed)?;
        if config.reuse_address {
            if let Err(errno) = host.setsockopt(raw, SockOpt::ReuseAddr, 1) {
                warn!(fd = raw, %errno, "failed to enable address reuse");
            }
        }
        host.bind(raw, addr).map_err(ErrorKind::host("bind"))?;
        let local = Self::local_of(&fd, addr)?;
        debug!(fd = raw, %local, "bound datagram socket");
        Ok(Self {
            fd,
            network,
            local,
            remote: None,
        })
    }

    /// Opens an endpoint connected to `remote`, bound to `local` if given.
    pub(crate) async fn connect(
        host: &Arc<dyn Host>,
        network: NetworkKind,
        local: Option<&Address>,
        remote: &Address,
    ) -> Result<Self, ErrorKind> {
        if let Address::Unix(path) = remote {
            check_unix_path(path)?;
        }
        if let Some(local) = local {
            if local.is_unix() != remote.is_unix() {
                return Err(ErrorKind::AddressFamilyMismatch);
            }
            if let Address::Unix(path) = local {
                check_unix_path(path)?;
            }
        }
        let fd = Self::new_descriptor(host, network, remote.family())?;
        let raw = fd.fd().ok_or(ErrorKind::Closed)?;
        if let Some(local) = local {
            host.bind(raw, local).map_err(ErrorKind::host("bind"))?;
        }
        connect::connect(&fd, remote).await?;
        let local = match remote {
            Address::Unix(path) => match local {
                Some(local) => local.clone(),
                None => unix::dialed(path, host.local_addr(raw)).0,
            },
            _ => host
                .local_addr(raw)
                .map_err(ErrorKind::host("getsockname"))?,
        };
        debug!(fd = raw, %local, %remote, "connected datagram socket");
        Ok(Self {
            fd,
            network,
            local,
            remote: Some(remote.clone()),
        })
    }

    pub fn local_addr(&self) -> &Address {
        &self.local
    }

    /// Address of the connected peer, if any.
    pub fn remote_addr(&self) -> Option<&Address> {
        self.remote.as_ref()
    }

    pub fn network(&self) -> NetworkKind {
        self.network
    }

    fn error(&self, op: Op, kind: ErrorKind) -> Error {
        let addr = self.remote.as_ref().unwrap_or(&self.local);
        Error::new(op, self.network.as_str(), addr.to_string(), kind)
    }

    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<Option<(usize, Option<Address>)>, ErrorKind>> {
        loop {
            let raw = self.fd.fd().ok_or(ErrorKind::Closed)?;
            if self.fd.is_read_shutdown() {
                return Poll::Ready(Ok(None));
            }
            match self.fd.host().recv_from(raw, buf, RiFlags::empty()) {
                Ok((0, ..)) | Err(Errno::INVAL) => return Poll::Ready(Ok(None)),
                Ok((n, addr, flags)) => {
                    if flags.contains(RoFlags::RECV_DATA_TRUNCATED) {
                        trace!(fd = raw, n, "datagram truncated");
                    }
                    return Poll::Ready(Ok(Some((n, addr))));
                }
                Err(Errno::AGAIN) => ready!(poll_ready(&self.fd, Interest::Readable, cx))?,
                Err(errno) => return Poll::Ready(Err(ErrorKind::host("recvfrom")(errno))),
            }
        }
    }

    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        addr: Option<&Address>,
    ) -> Poll<Result<usize, ErrorKind>> {
        loop {
            let raw = self.fd.fd().ok_or(ErrorKind::Closed)?;
            let host = self.fd.host();
            let res = match addr {
                Some(addr) => host.send_to(raw, buf, addr, SiFlags::empty()),
                None => host.send(raw, buf, SiFlags::empty()),
            };
            match res {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(Errno::AGAIN) => ready!(poll_ready(&self.fd, Interest::Writable, cx))?,
                Err(errno) => return Poll::Ready(Err(ErrorKind::host("sendto")(errno))),
            }
        }
    }

    /// Receives a datagram, returning `None` at end of stream.
    ///
    /// Sources the host does not report are filled in with the connected
    /// peer, or an unnamed address on Unix networks.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<Option<(usize, Address)>, Error> {
        let res = poll_fn(|cx| self.poll_recv_from(cx, buf))
            .await
            .map_err(|kind| self.error(Op::Read, kind))?;
        Ok(res.map(|(n, addr)| {
            let addr = addr
                .or_else(|| self.remote.clone())
                .or_else(|| Address::wildcard(self.local.family(), 0))
                .unwrap_or_else(unix::unnamed);
            (n, addr)
        }))
    }

    /// Receives a datagram, returning `0` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let res = poll_fn(|cx| self.poll_recv_from(cx, buf))
            .await
            .map_err(|kind| self.error(Op::Read, kind))?;
        Ok(res.map_or(0, |(n, _)| n))
    }

    /// Sends a datagram to the connected peer.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        poll_fn(|cx| self.poll_send_to(cx, buf, None))
            .await
            .map_err(|kind| self.error(Op::Write, kind))
    }

    /// Sends a datagram to `addr`.
    pub async fn write_to(&self, buf: &[u8], addr: &Address) -> Result<usize, Error> {
        let err = |kind| Error::new(Op::Write, self.network.as_str(), addr.to_string(), kind);
        if addr.is_unix() != self.network.is_unix() {
            return Err(err(ErrorKind::AddressFamilyMismatch));
        }
        poll_fn(|cx| self.poll_send_to(cx, buf, Some(addr)))
            .await
            .map_err(err)
    }

    fn shutdown(&self, how: Shutdown) -> Result<(), Error> {
        if self.fd.is_closed() {
            return Err(self.error(Op::Close, ErrorKind::Closed));
        }
        self.fd.shutdown(how).map_err(|errno| {
            let kind = if self.network.is_unix() {
                unix::shutdown_error(errno)
            } else {
                ErrorKind::host("shutdown")(errno)
            };
            self.error(Op::Close, kind)
        })
    }

    pub fn close_read(&self) -> Result<(), Error> {
        self.shutdown(Shutdown::Read)
    }

    pub fn close_write(&self) -> Result<(), Error> {
        self.shutdown(Shutdown::Write)
    }

    /// Closes the endpoint. Closing more than once is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        self.fd
            .close()
            .map_err(|errno| self.error(Op::Close, ErrorKind::host("close")(errno)))
    }
}

#[cfg(test)]
mod test {
    use core::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::host::scripted::{self, Scripted};
    use crate::{Config, Network};

    fn network() -> (Arc<Scripted>, Network) {
        let host = Arc::new(Scripted::default());
        let network = Network::new(host.clone(), Config::default());
        (host, network)
    }

    fn dns() -> Address {
        Address::Inet4(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 53), 53))
    }

    #[tokio::test]
    async fn read_from() {
        let (host, network) = network();
        let endpoint = network
            .listen_packet("udp", ":0")
            .expect("failed to bind");
        assert!(host.calls().contains(&"setsockopt Broadcast 1".to_string()));
        host.script().recv_from.extend([
            Err(Errno::AGAIN),
            Ok((b"query".to_vec(), Some(dns()))),
        ]);
        let mut buf = [0; 16];
        let (n, src) = endpoint
            .read_from(&mut buf)
            .await
            .expect("failed to read")
            .expect("unexpected end of stream");
        assert_eq!(&buf[..n], b"query");
        assert_eq!(src, dns());
    }

    #[test]
    fn reuse_address() {
        let (host, network) = network();
        host.script()
            .setsockopt
            .insert(SockOpt::ReuseAddr as u32, Errno::NOPROTOOPT);
        network
            .listen_packet("udp4", "127.0.0.1:5353")
            .expect("failed to bind");
        assert_eq!(
            host.calls(),
            [
                "open",
                "setsockopt Broadcast 1",
                "setsockopt ReuseAddr 1",
                "bind 127.0.0.1:5353",
                "local_addr",
            ]
        );

        let host = Arc::new(Scripted::default());
        let config = Config {
            reuse_address: false,
            ..Config::default()
        };
        Network::new(host.clone(), config)
            .listen_packet("udp4", "127.0.0.1:5353")
            .expect("failed to bind");
        assert!(!host.calls().iter().any(|call| call.contains("ReuseAddr")));
    }

    #[tokio::test]
    async fn end_of_stream() {
        let (host, network) = network();
        let endpoint = network
            .listen_packet("udp4", "127.0.0.1:0")
            .expect("failed to bind");
        host.script()
            .recv_from
            .extend([Ok((vec![], None)), Err(Errno::INVAL)]);
        let mut buf = [0; 16];
        assert_eq!(endpoint.read_from(&mut buf).await.expect("failed to read"), None);
        assert_eq!(endpoint.read(&mut buf).await.expect("failed to read"), 0);
    }

    #[tokio::test]
    async fn family_mismatch() {
        let (host, network) = network();
        let endpoint = network
            .listen_packet("udp", ":0")
            .expect("failed to bind");
        let calls = host.calls().len();
        let err = endpoint
            .write_to(b"x", &Address::unix("/tmp/peer.sock"))
            .await
            .expect_err("write should fail");
        assert_eq!(err.kind(), &ErrorKind::AddressFamilyMismatch);
        assert_eq!(err.addr(), "/tmp/peer.sock");
        assert_eq!(host.calls().len(), calls);
    }

    #[tokio::test]
    async fn write_to() {
        let (host, network) = network();
        let endpoint = network
            .open_packet("udp6", Family::Inet6)
            .expect("failed to open");
        let dst = Address::wildcard(Family::Inet6, 53).expect("no wildcard");
        endpoint
            .write_to(b"query", &dst)
            .await
            .expect("failed to write");
        assert_eq!(host.script().sent, [(b"query".to_vec(), Some(dst))]);
    }

    #[tokio::test]
    async fn dial_packet() {
        let (host, network) = network();
        let endpoint = network
            .dial_packet("udp", Some("127.0.0.1:5353"), "192.0.2.1:80")
            .await
            .expect("failed to dial");
        assert_eq!(endpoint.remote_addr(), Some(&scripted::peer()));
        assert_eq!(endpoint.local_addr(), &scripted::local());
        let calls = host.calls();
        assert!(calls.contains(&"bind 127.0.0.1:5353".to_string()));
        assert!(calls.contains(&"connect 192.0.2.1:80".to_string()));

        endpoint.write(b"ping").await.expect("failed to write");
        host.script().recv_from.push_back(Ok((b"pong".to_vec(), None)));
        let mut buf = [0; 8];
        let (n, src) = endpoint
            .read_from(&mut buf)
            .await
            .expect("failed to read")
            .expect("unexpected end of stream");
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(src, scripted::peer());
    }

    #[tokio::test]
    async fn unixgram() {
        let (host, network) = network();
        host.script().local.push_back(Err(Errno::NOTSUP));
        let endpoint = network
            .dial_packet("unixgram", None, "/run/log.sock")
            .await
            .expect("failed to dial");
        assert_eq!(endpoint.local_addr(), &unix::unnamed());
        assert_eq!(endpoint.remote_addr(), Some(&Address::unix("/run/log.sock")));
        assert!(!host.calls().iter().any(|call| call.starts_with("setsockopt")));

        host.script().shutdown.push_back(Errno::NOSYS);
        let err = endpoint.close_write().expect_err("half-close should fail");
        assert_eq!(err.errno(), Some(Errno::NOTSUP));
    }

    #[tokio::test]
    async fn close_read_wakes_reader() {
        let (host, network) = network();
        let endpoint = network
            .dial_packet("udp4", None, "192.0.2.1:80")
            .await
            .expect("failed to dial");
        host.script().stalled = true;
        let mut buf = [0; 8];
        let (res, ()) = tokio::join!(endpoint.read_from(&mut buf), async {
            tokio::task::yield_now().await;
            endpoint.close_read().expect("failed to shut down");
        });
        assert_eq!(res.expect("failed to read"), None);
        host.script().recv_from.push_back(Ok((b"late".to_vec(), None)));
        assert_eq!(endpoint.read(&mut buf).await.expect("failed to read"), 0);
    }

    #[tokio::test]
    async fn close_wakes_reader() {
        let (host, network) = network();
        let endpoint = network
            .listen_packet("udp", ":0")
            .expect("failed to bind");
        host.script().stalled = true;
        let mut buf = [0; 8];
        let (res, ()) = tokio::join!(endpoint.read_from(&mut buf), async {
            tokio::task::yield_now().await;
            endpoint.close().expect("failed to close");
        });
        let err = res.expect_err("read should fail");
        assert_eq!(err.kind(), &ErrorKind::Closed);
    }

    #[test]
    fn stream_network() {
        let (_, network) = network();
        let err = network
            .listen_packet("tcp", ":0")
            .expect_err("bind should fail");
        assert_eq!(err.kind(), &ErrorKind::UnsupportedNetwork("tcp".into()));
    }

    #[test]
    fn close() {
        let (host, network) = network();
        let endpoint = network
            .listen_packet("udp", ":0")
            .expect("failed to bind");
        endpoint.close().expect("failed to close");
        endpoint.close().expect("failed to close twice");
        assert_eq!(host.closed().len(), 1);
    }
}
