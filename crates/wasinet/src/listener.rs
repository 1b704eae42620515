use core::future::poll_fn;
use core::task::{ready, Context, Poll};

use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::addr::{check_unix_path, Address, NetworkKind, SocketType};
use crate::host::{Descriptor, Host, Interest, SockOpt};
use crate::stream::{poll_ready, Connection};
use crate::{unix, Config, Errno, Error, ErrorKind, Op};

/// Passive stream socket.
#[derive(Debug)]
pub struct Listener {
    fd: Descriptor,
    network: NetworkKind,
    local: Address,
}

impl Listener {
    /// Binds to the first of `addrs` that succeeds and starts listening.
    pub(crate) fn bind(
        host: &Arc<dyn Host>,
        config: &Config,
        network: NetworkKind,
        addrs: &[Address],
    ) -> Result<Self, ErrorKind> {
        if network.socket_type() != SocketType::Stream {
            return Err(ErrorKind::UnsupportedNetwork(network.as_str().into()));
        }
        let mut last = ErrorKind::invalid_address("no address to listen on");
        for addr in addrs {
            match Self::bind_addr(host, config, network, addr) {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    debug!(%addr, ?e, "listen attempt failed");
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
        let fd = Descriptor::open(Arc::clone(host), addr.family(), SocketType::Stream)
            .map_err(ErrorKind::host("socket"))?;
        fd.set_nonblocking().map_err(ErrorKind::host("setnonblock"))?;
        let raw = fd.fd().ok_or(ErrorKind::Closed)?;
        if config.reuse_address {
            if let Err(errno) = host.setsockopt(raw, SockOpt::ReuseAddr, 1) {
                warn!(fd = raw, %errno, "failed to enable address reuse");
            }
        }
        host.bind(raw, addr).map_err(ErrorKind::host("bind"))?;
        host.listen(raw, config.listen_backlog)
            .map_err(ErrorKind::host("listen"))?;
        let local = match addr {
            Address::Unix(..) => addr.clone(),
            _ => host
                .local_addr(raw)
                .map_err(ErrorKind::host("getsockname"))?,
        };
        debug!(fd = raw, %local, "listening");
        Ok(Self { fd, network, local })
    }

    pub fn local_addr(&self) -> &Address {
        &self.local
    }

    pub fn network(&self) -> NetworkKind {
        self.network
    }

    fn error(&self, op: Op, kind: ErrorKind) -> Error {
        Error::new(op, self.network.as_str(), self.local.to_string(), kind)
    }

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<Result<Connection, ErrorKind>> {
        loop {
            let raw = self.fd.fd().ok_or(ErrorKind::Closed)?;
            let host = self.fd.host();
            match host.accept(raw) {
                Ok(fd) => {
                    let fd = Descriptor::from_raw(Arc::clone(host), fd);
                    return Poll::Ready(self.accepted(fd));
                }
                Err(Errno::AGAIN) => ready!(poll_ready(&self.fd, Interest::Readable, cx))?,
                Err(errno) => return Poll::Ready(Err(ErrorKind::host("accept")(errno))),
            }
        }
    }

    /// Configures a freshly accepted descriptor. `fd` is closed on failure
    /// when dropped.
    fn accepted(&self, fd: Descriptor) -> Result<Connection, ErrorKind> {
        let raw = fd.fd().ok_or(ErrorKind::Closed)?;
        let host = fd.host();
        fd.set_nonblocking().map_err(ErrorKind::host("setnonblock"))?;
        let peer = host
            .peer_addr(raw)
            .map_err(ErrorKind::host("getpeername"))?;
        let (local, remote) = match &self.local {
            Address::Unix(..) => unix::accepted(&self.local, peer),
            _ => {
                let local = host
                    .local_addr(raw)
                    .map_err(ErrorKind::host("getsockname"))?;
                (local, peer)
            }
        };
        debug!(fd = raw, %remote, "accepted connection");
        Ok(Connection::new(fd, self.network, local, remote))
    }

    /// Waits for the next inbound connection.
    #[instrument(level = "trace", skip_all, fields(local = %self.local))]
    pub async fn accept(&self) -> Result<Connection, Error> {
        poll_fn(|cx| self.poll_accept(cx))
            .await
            .map_err(|kind| self.error(Op::Accept, kind))
    }

    /// Like [`Listener::accept`], but gives up once `token` is cancelled.
    pub async fn accept_with_cancel(
        &self,
        token: &CancellationToken,
    ) -> Result<Connection, Error> {
        tokio::select! {
            biased;
            () = token.cancelled() => Err(self.error(Op::Accept, ErrorKind::Cancelled)),
            res = self.accept() => res,
        }
    }

    /// Stream of inbound connections, ending once the listener is closed.
    pub fn incoming(&self) -> impl Stream<Item = Result<Connection, Error>> + '_ {
        stream::unfold(self, |listener| async move {
            match listener.accept().await {
                Err(err) if err.kind() == &ErrorKind::Closed => None,
                res => Some((res, listener)),
            }
        })
    }

    /// Stops listening. Closing more than once is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        self.fd
            .close()
            .map_err(|errno| self.error(Op::Close, ErrorKind::host("close")(errno)))
    }
}

#[cfg(test)]
mod test {
    use futures::StreamExt as _;

    use super::*;
    use crate::host::scripted::{self, Scripted};
    use crate::Network;

    fn network() -> (Arc<Scripted>, Network) {
        let host = Arc::new(Scripted::default());
        let network = Network::new(host.clone(), Config::default());
        (host, network)
    }

    #[test]
    fn listen() {
        let (host, network) = network();
        let listener = network
            .listen("tcp", "127.0.0.1:0")
            .expect("failed to listen");
        assert_eq!(listener.local_addr(), &scripted::local());
        assert_eq!(
            host.calls(),
            [
                "open",
                "setsockopt ReuseAddr 1",
                "bind 127.0.0.1:0",
                "listen 64",
                "local_addr",
            ]
        );
    }

    #[test]
    fn reuse_address_failure() {
        let (host, network) = network();
        host.script()
            .setsockopt
            .insert(SockOpt::ReuseAddr as u32, Errno::NOPROTOOPT);
        network
            .listen("tcp", ":8080")
            .expect("failed to listen");
        assert!(host.calls().contains(&"bind 0.0.0.0:8080".to_string()));
    }

    #[test]
    fn bind_failure() {
        let (host, network) = network();
        host.script().bind.push_back(Errno::ADDRINUSE);
        let err = network
            .listen("tcp4", "127.0.0.1:8080")
            .expect_err("listen should fail");
        assert_eq!(err.op(), Op::Listen);
        assert_eq!(err.errno(), Some(Errno::ADDRINUSE));
        assert_eq!(host.closed().len(), 1);
    }

    #[test]
    fn datagram_network() {
        let (host, network) = network();
        let err = network
            .listen("udp", "127.0.0.1:53")
            .expect_err("listen should fail");
        assert_eq!(err.kind(), &ErrorKind::UnsupportedNetwork("udp".into()));
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn accept() {
        let (host, network) = network();
        let listener = network
            .listen("tcp", "127.0.0.1:0")
            .expect("failed to listen");
        host.script().accept.extend([Err(Errno::AGAIN), Ok(10)]);
        let conn = listener.accept().await.expect("failed to accept");
        assert_eq!(conn.remote_addr(), &scripted::peer());
        assert_eq!(conn.local_addr(), &scripted::local());
        assert_eq!(host.script().polls, 1);
    }

    #[tokio::test]
    async fn accept_peer_failure() {
        let (host, network) = network();
        let listener = network
            .listen("tcp", "127.0.0.1:0")
            .expect("failed to listen");
        {
            let mut script = host.script();
            script.accept.push_back(Ok(10));
            script.peer.push_back(Err(Errno::NOTCONN));
        }
        let err = listener.accept().await.expect_err("accept should fail");
        assert_eq!(err.op(), Op::Accept);
        assert_eq!(err.errno(), Some(Errno::NOTCONN));
        assert_eq!(host.closed(), [10]);
    }

    #[tokio::test]
    async fn accept_unix() {
        let (host, network) = network();
        let listener = network
            .listen("unix", "/tmp/app.sock")
            .expect("failed to listen");
        assert_eq!(listener.local_addr(), &Address::unix("/tmp/app.sock"));
        {
            let mut script = host.script();
            script.accept.push_back(Ok(10));
            script.peer.push_back(Ok(unix::unnamed()));
        }
        let conn = listener.accept().await.expect("failed to accept");
        assert_eq!(conn.local_addr(), &Address::unix("/tmp/app.sock"));
        assert_eq!(conn.remote_addr().to_string(), "");
    }

    #[tokio::test]
    async fn accept_cancel() {
        let (host, network) = network();
        let listener = network
            .listen("tcp", "127.0.0.1:0")
            .expect("failed to listen");
        host.script().stalled = true;
        let token = CancellationToken::new();
        token.cancel();
        let err = listener
            .accept_with_cancel(&token)
            .await
            .expect_err("accept should be cancelled");
        assert_eq!(err.kind(), &ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn incoming() {
        let (host, network) = network();
        let listener = network
            .listen("tcp", "127.0.0.1:0")
            .expect("failed to listen");
        host.script().accept.extend([Ok(10), Ok(11)]);
        let conns: Vec<_> = listener.incoming().take(2).collect().await;
        assert_eq!(conns.len(), 2);
        assert!(conns.iter().all(Result::is_ok));

        listener.close().expect("failed to close");
        let mut incoming = core::pin::pin!(listener.incoming());
        assert!(incoming.next().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_acceptor() {
        let (host, network) = network();
        let listener = network
            .listen("tcp", "127.0.0.1:0")
            .expect("failed to listen");
        host.script().stalled = true;
        let (res, ()) = tokio::join!(listener.accept(), async {
            tokio::task::yield_now().await;
            listener.close().expect("failed to close");
        });
        let err = res.expect_err("accept should fail");
        assert_eq!(err.kind(), &ErrorKind::Closed);
    }

    #[tokio::test]
    async fn close_ends_incoming() {
        let (host, network) = network();
        let listener = network
            .listen("tcp", "127.0.0.1:0")
            .expect("failed to listen");
        host.script().stalled = true;
        let (conns, ()) = tokio::join!(listener.incoming().collect::<Vec<_>>(), async {
            tokio::task::yield_now().await;
            listener.close().expect("failed to close");
        });
        assert!(conns.is_empty());
    }
}
