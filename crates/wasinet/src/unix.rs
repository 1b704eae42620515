//! Unix-domain socket emulation.
//!
//! Hosts frequently cannot describe Unix socket endpoints, so connections
//! report the paths they were created with instead of asking the host.

use crate::addr::Address;
use crate::{Errno, ErrorKind};

/// Unnamed Unix address, reported for endpoints without a path.
pub fn unnamed() -> Address {
    Address::unix("")
}

fn named(addr: Result<Address, Errno>) -> Address {
    match addr {
        Ok(addr @ Address::Unix(..)) => addr,
        _ => unnamed(),
    }
}

/// Local and remote addresses of a dialed connection to `path`.
pub(crate) fn dialed(path: &str, local: Result<Address, Errno>) -> (Address, Address) {
    (named(local), Address::unix(path))
}

/// Local and remote addresses of a connection accepted by a listener bound
/// to `listener`.
pub(crate) fn accepted(listener: &Address, peer: Address) -> (Address, Address) {
    (listener.clone(), named(Ok(peer)))
}

/// Maps the failure of a half-close, which some hosts do not implement for
/// Unix sockets.
pub(crate) fn shutdown_error(errno: Errno) -> ErrorKind {
    match errno {
        Errno::NOSYS | Errno::NOTSUP => ErrorKind::HostCallFailed {
            call: "shutdown",
            errno: Errno::NOTSUP,
        },
        errno => ErrorKind::HostCallFailed {
            call: "shutdown",
            errno,
        },
    }
}
