use core::future::poll_fn;
use core::pin::Pin;
use core::task::{ready, Context, Poll};

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::instrument;

use crate::addr::{Address, NetworkKind};
use crate::host::{Descriptor, Interest, RiFlags, Shutdown, SiFlags};
use crate::{unix, Errno, Error, ErrorKind, Op};

/// Polls `fd` for `interest`, mapping failures.
///
/// A pending task stays parked on `fd`, so closing it, or shutting down its
/// reading side for [`Interest::Readable`], completes the poll.
pub(crate) fn poll_ready(
    fd: &Descriptor,
    interest: Interest,
    cx: &mut Context<'_>,
) -> Poll<Result<(), ErrorKind>> {
    let raw = fd.fd().ok_or(ErrorKind::Closed)?;
    match fd.host().poll_ready(raw, interest, cx) {
        Poll::Ready(res) => {
            fd.unpark(cx.waker());
            Poll::Ready(res.map_err(ErrorKind::host("poll_oneoff")))
        }
        Poll::Pending => {
            fd.park(cx.waker());
            // the descriptor may have been closed before the waker was parked
            if fd.is_closed() {
                Poll::Ready(Err(ErrorKind::Closed))
            } else if interest == Interest::Readable && fd.is_read_shutdown() {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            }
        }
    }
}

/// Connected stream, or connected datagram socket.
#[derive(Debug)]
pub struct Connection {
    fd: Descriptor,
    network: NetworkKind,
    local: Address,
    remote: Address,
}

impl Connection {
    pub(crate) fn new(fd: Descriptor, network: NetworkKind, local: Address, remote: Address) -> Self {
        Self {
            fd,
            network,
            local,
            remote,
        }
    }

    pub fn local_addr(&self) -> &Address {
        &self.local
    }

    pub fn remote_addr(&self) -> &Address {
        &self.remote
    }

    pub fn network(&self) -> NetworkKind {
        self.network
    }

    fn error(&self, op: Op, kind: ErrorKind) -> Error {
        Error::new(op, self.network.as_str(), self.remote.to_string(), kind)
    }

    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
        flags: RiFlags,
    ) -> Poll<Result<usize, ErrorKind>> {
        loop {
            let raw = self.fd.fd().ok_or(ErrorKind::Closed)?;
            if self.fd.is_read_shutdown() {
                return Poll::Ready(Ok(0));
            }
            match self.fd.host().recv(raw, buf, flags) {
                Ok((n, _)) => return Poll::Ready(Ok(n)),
                // reported by hosts for reads on a shut down socket
                Err(Errno::INVAL) => return Poll::Ready(Ok(0)),
                Err(Errno::AGAIN) => ready!(poll_ready(&self.fd, Interest::Readable, cx))?,
                Err(errno) => return Poll::Ready(Err(ErrorKind::host("recv")(errno))),
            }
        }
    }

    fn poll_send(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, ErrorKind>> {
        loop {
            let raw = self.fd.fd().ok_or(ErrorKind::Closed)?;
            match self.fd.host().send(raw, buf, SiFlags::empty()) {
                Ok(n) => return Poll::Ready(Ok(n)),
                Err(Errno::AGAIN) => ready!(poll_ready(&self.fd, Interest::Writable, cx))?,
                Err(errno) => return Poll::Ready(Err(ErrorKind::host("send")(errno))),
            }
        }
    }

    /// Reads into `buf`, returning `0` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        poll_fn(|cx| self.poll_recv(cx, buf, RiFlags::empty()))
            .await
            .map_err(|kind| self.error(Op::Read, kind))
    }

    /// Reads into `buf` without consuming the data.
    pub async fn peek(&self, buf: &mut [u8]) -> Result<usize, Error> {
        poll_fn(|cx| self.poll_recv(cx, buf, RiFlags::RECV_PEEK))
            .await
            .map_err(|kind| self.error(Op::Read, kind))
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        poll_fn(|cx| self.poll_send(cx, buf))
            .await
            .map_err(|kind| self.error(Op::Write, kind))
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), Error> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(self.error(Op::Write, ErrorKind::ShortWrite));
            }
            buf = &buf[n..];
        }
        Ok(())
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

    /// Shuts down the reading side, subsequent reads return end of stream.
    #[instrument(level = "debug", skip_all)]
    pub fn close_read(&self) -> Result<(), Error> {
        self.shutdown(Shutdown::Read)
    }

    /// Shuts down the writing side, signalling end of stream to the peer.
    #[instrument(level = "debug", skip_all)]
    pub fn close_write(&self) -> Result<(), Error> {
        self.shutdown(Shutdown::Write)
    }

    /// Closes the connection. Closing more than once is a no-op.
    pub fn close(&self) -> Result<(), Error> {
        self.fd
            .close()
            .map_err(|errno| self.error(Op::Close, ErrorKind::host("close")(errno)))
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let n = ready!(self.poll_recv(cx, buf.initialize_unfilled(), RiFlags::empty()))
            .map_err(|kind| self.error(Op::Read, kind))?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = ready!(self.poll_send(cx, buf)).map_err(|kind| self.error(Op::Write, kind))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.close_write().map_err(Into::into))
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::addr::{Family, SocketType};
    use crate::host::scripted::{self, Scripted};

    fn connection(network: NetworkKind) -> (Arc<Scripted>, Connection) {
        let host = Arc::new(Scripted::default());
        let fd = Descriptor::open(host.clone(), Family::Inet4, SocketType::Stream)
            .expect("failed to open");
        let conn = Connection::new(fd, network, scripted::local(), scripted::peer());
        (host, conn)
    }

    #[tokio::test]
    async fn read_retries() {
        let (host, conn) = connection(NetworkKind::Tcp);
        host.script().recv_from.extend([
            Err(Errno::AGAIN),
            Err(Errno::AGAIN),
            Ok((b"hello".to_vec(), None)),
        ]);
        let mut buf = [0; 16];
        let n = conn.read(&mut buf).await.expect("failed to read");
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(host.script().polls, 2);
    }

    #[tokio::test]
    async fn read_error() {
        let (host, conn) = connection(NetworkKind::Tcp);
        host.script().recv_from.push_back(Err(Errno::CONNRESET));
        let err = conn.read(&mut [0; 4]).await.expect_err("read should fail");
        assert_eq!(err.op(), Op::Read);
        assert_eq!(err.errno(), Some(Errno::CONNRESET));
        assert_eq!(err.addr(), "192.0.2.1:80");
    }

    #[tokio::test]
    async fn closed() {
        let (host, conn) = connection(NetworkKind::Tcp);
        conn.close().expect("failed to close");
        conn.close().expect("failed to close twice");
        let err = conn.write(b"x").await.expect_err("write should fail");
        assert_eq!(err.kind(), &ErrorKind::Closed);
        assert!(conn.close_write().is_err());
        assert_eq!(host.closed().len(), 1);
    }

    #[tokio::test]
    async fn write_all() {
        let (host, conn) = connection(NetworkKind::Tcp);
        conn.write_all(b"ping").await.expect("failed to write");
        assert_eq!(host.script().sent, [(b"ping".to_vec(), None)]);
    }

    #[tokio::test]
    async fn write_zero() {
        let (host, conn) = connection(NetworkKind::Tcp);
        host.script().send.extend([2, 0]);
        let err = conn
            .write_all(b"ping")
            .await
            .expect_err("write should fail");
        assert_eq!(err.op(), Op::Write);
        assert_eq!(err.kind(), &ErrorKind::ShortWrite);
        assert_eq!(host.script().sent, [(b"pi".to_vec(), None), (vec![], None)]);
    }

    #[tokio::test]
    async fn shut_down_read() {
        let (host, conn) = connection(NetworkKind::Tcp);
        host.script()
            .recv_from
            .extend([Err(Errno::INVAL), Ok((b"late".to_vec(), None))]);
        let mut buf = [0; 8];
        assert_eq!(conn.read(&mut buf).await.expect("failed to read"), 0);

        conn.close_read().expect("failed to shut down");
        assert_eq!(conn.read(&mut buf).await.expect("failed to read"), 0);
        assert_eq!(host.script().recv_from.len(), 1);
    }

    #[tokio::test]
    async fn close_read_wakes_reader() {
        let (host, conn) = connection(NetworkKind::Udp4);
        host.script().stalled = true;
        let mut buf = [0; 8];
        let (n, ()) = tokio::join!(conn.read(&mut buf), async {
            tokio::task::yield_now().await;
            conn.close_read().expect("failed to shut down");
        });
        assert_eq!(n.expect("failed to read"), 0);
        assert!(host.calls().contains(&"shutdown Read".to_string()));
    }

    #[tokio::test]
    async fn close_wakes_reader() {
        let (host, conn) = connection(NetworkKind::Tcp);
        host.script().stalled = true;
        let mut buf = [0; 8];
        let (res, ()) = tokio::join!(conn.read(&mut buf), async {
            tokio::task::yield_now().await;
            conn.close().expect("failed to close");
        });
        let err = res.expect_err("read should fail");
        assert_eq!(err.kind(), &ErrorKind::Closed);
        assert_eq!(host.closed().len(), 1);
    }

    #[test]
    fn unix_half_close() {
        let (host, conn) = connection(NetworkKind::Unix);
        host.script().shutdown.push_back(Errno::NOSYS);
        let err = conn.close_read().expect_err("half-close should fail");
        assert_eq!(err.op(), Op::Close);
        assert_eq!(err.net(), "unix");
        assert_eq!(err.errno(), Some(Errno::NOTSUP));
        assert_eq!(host.calls().last().map(String::as_str), Some("shutdown Read"));
    }
}
