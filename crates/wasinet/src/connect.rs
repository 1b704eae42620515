use core::future::poll_fn;
use core::time::Duration;

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::addr::{check_unix_path, Address, NetworkKind, SocketType};
use crate::host::{Descriptor, Host, Interest, SockOpt};
use crate::resolve::Purpose;
use crate::stream::{poll_ready, Connection};
use crate::{unix, Errno, Error, ErrorKind, Network, Op};

/// State of a connection attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectState {
    /// Descriptor is open and configured, connect not issued yet.
    Opened,
    /// Host accepted the connect call, completion is pending.
    Connecting,
    Connected,
    Failed(Errno),
}

impl ConnectState {
    /// Transition on the result of the host connect call.
    pub fn on_connect(self, res: Result<(), Errno>) -> Self {
        match (self, res) {
            (Self::Opened, Ok(())) => Self::Connected,
            (Self::Opened, Err(Errno::INPROGRESS)) => Self::Connecting,
            (Self::Opened, Err(errno)) => Self::Failed(errno),
            (state, _) => state,
        }
    }

    /// Transition on the pending socket error read after a writability
    /// wakeup. `has_peer` is only consulted when the host reports no error,
    /// which some hosts do before the connection is established.
    pub fn on_pending_error(self, pending: Errno, has_peer: impl FnOnce() -> bool) -> Self {
        match (self, pending) {
            (Self::Connecting, Errno::INPROGRESS | Errno::INTR) => Self::Connecting,
            (Self::Connecting, Errno::ISCONN) => Self::Connected,
            (Self::Connecting, Errno::SUCCESS) if has_peer() => Self::Connected,
            (Self::Connecting, Errno::SUCCESS) => Self::Connecting,
            (Self::Connecting, errno) => Self::Failed(errno),
            (state, _) => state,
        }
    }
}

/// Drives the connection state machine of `fd` to completion.
pub(crate) async fn connect(fd: &Descriptor, addr: &Address) -> Result<(), ErrorKind> {
    let host = fd.host();
    let raw = fd.fd().ok_or(ErrorKind::Closed)?;
    let mut state = ConnectState::Opened;
    loop {
        let next = match state {
            ConnectState::Opened => state.on_connect(host.connect(raw, addr)),
            ConnectState::Connecting => {
                poll_fn(|cx| poll_ready(fd, Interest::Writable, cx)).await?;
                let pending = host
                    .getsockopt(raw, SockOpt::Error)
                    .map_err(ErrorKind::host("getsockopt"))?;
                state.on_pending_error(Errno::from_option_value(pending), || {
                    host.peer_addr(raw).is_ok()
                })
            }
            ConnectState::Connected => return Ok(()),
            ConnectState::Failed(errno) => {
                return Err(ErrorKind::HostCallFailed {
                    call: "connect",
                    errno,
                })
            }
        };
        if next != state {
            trace!(fd = raw, ?next, "connect state changed");
        }
        state = next;
    }
}

/// Opens a socket for `network` and connects it to `addr`.
async fn dial_addr(
    host: &Arc<dyn Host>,
    network: NetworkKind,
    addr: &Address,
) -> Result<Connection, ErrorKind> {
    if let Address::Unix(path) = addr {
        check_unix_path(path)?;
    }
    let ty = network.socket_type();
    let fd = Descriptor::open(Arc::clone(host), addr.family(), ty)
        .map_err(ErrorKind::host("socket"))?;
    fd.set_nonblocking().map_err(ErrorKind::host("setnonblock"))?;
    let raw = fd.fd().ok_or(ErrorKind::Closed)?;
    if ty == SocketType::Datagram && !network.is_unix() {
        host.setsockopt(raw, SockOpt::Broadcast, 1)
            .map_err(ErrorKind::host("setsockopt"))?;
    }
    connect(&fd, addr).await?;

    let (local, remote) = match addr {
        Address::Unix(path) => unix::dialed(path, host.local_addr(raw)),
        _ => {
            let local = host
                .local_addr(raw)
                .map_err(ErrorKind::host("getsockname"))?;
            let remote = host
                .peer_addr(raw)
                .map_err(ErrorKind::host("getpeername"))?;
            (local, remote)
        }
    };
    debug!(fd = raw, %local, %remote, "connected");
    Ok(Connection::new(fd, network, local, remote))
}

/// Dial options.
///
/// Both limits apply when set, the earlier one wins. Reaching a limit
/// cancels the attempt.
#[derive(Clone)]
pub struct Dialer {
    network: Network,
    pub timeout: Option<Duration>,
    pub deadline: Option<Instant>,
}

impl Dialer {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            timeout: None,
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Effective deadline of an attempt started at `now`.
    pub fn deadline_from(&self, now: Instant) -> Option<Instant> {
        let timeout = self.timeout.and_then(|timeout| now.checked_add(timeout));
        match (timeout, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub async fn dial(&self, network: &str, address: &str) -> Result<Connection, Error> {
        self.dial_with_cancel(network, address, &CancellationToken::new())
            .await
    }

    /// Dials `address`, trying every resolved candidate in order until one
    /// connects. Cancelling `token` aborts the attempt and closes the
    /// descriptor in flight.
    #[instrument(level = "debug", skip(self, token))]
    pub async fn dial_with_cancel(
        &self,
        network: &str,
        address: &str,
        token: &CancellationToken,
    ) -> Result<Connection, Error> {
        let err = |kind| Error::new(Op::Dial, network, address, kind);
        let kind: NetworkKind = network.parse().map_err(err)?;
        if token.is_cancelled() {
            return Err(err(ErrorKind::Cancelled));
        }
        let addrs = self
            .network
            .resolver()
            .resolve(Purpose::Dial, kind, address)
            .map_err(err)?;

        let host = self.network.host();
        let attempt = async {
            let mut last = ErrorKind::NameResolutionFailed(address.into());
            for addr in &addrs {
                match dial_addr(host, kind, addr).await {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        debug!(%addr, ?e, "dial attempt failed");
                        last = e;
                    }
                }
            }
            Err(last)
        };
        let deadline = self
            .deadline_from(Instant::now())
            .map(tokio::time::Instant::from_std);
        let expired = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => core::future::pending().await,
            }
        };
        // dropping `attempt` drops its descriptor, which closes it exactly once
        tokio::select! {
            biased;
            () = token.cancelled() => Err(err(ErrorKind::Cancelled)),
            () = expired => Err(err(ErrorKind::Cancelled)),
            res = attempt => res.map_err(err),
        }
    }
}
