use core::fmt;

use std::io;

use crate::Errno;

/// Operation a [`Error`] was raised by.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Resolve,
    Dial,
    Listen,
    Accept,
    Read,
    Write,
    Close,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolve => "lookup",
            Self::Dial => "dial",
            Self::Listen => "listen",
            Self::Accept => "accept",
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
        })
    }
}

/// Failure category, independent of the operation that failed.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("unknown network `{0}`")]
    UnsupportedNetwork(Box<str>),

    #[error("invalid address: {0}")]
    InvalidAddress(Box<str>),

    #[error("lookup {0}: no such host")]
    NameResolutionFailed(Box<str>),

    #[error("{call}: {errno}")]
    HostCallFailed { call: &'static str, errno: Errno },

    #[error("operation was canceled")]
    Cancelled,

    #[error("use of closed network connection")]
    Closed,

    #[error("address type mismatch")]
    AddressFamilyMismatch,

    /// The host accepted no bytes of a non-empty write.
    #[error("short write")]
    ShortWrite,
}

impl ErrorKind {
    pub(crate) fn invalid_address(msg: impl Into<Box<str>>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    pub(crate) fn host(call: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| Self::HostCallFailed { call, errno }
    }

    /// Returns the host error number, if this is a host call failure.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::HostCallFailed { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

/// Error returned by every public operation, carrying the operation, the
/// network and the address it was attempted on.
#[derive(Debug, thiserror::Error)]
pub struct Error {
    op: Op,
    net: Box<str>,
    addr: Box<str>,
    #[source]
    kind: ErrorKind,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op, self.net)?;
        if !self.addr.is_empty() {
            write!(f, " {}", self.addr)?;
        }
        write!(f, ": {}", self.kind)
    }
}

impl Error {
    pub fn new(
        op: Op,
        net: impl Into<Box<str>>,
        addr: impl Into<Box<str>>,
        kind: ErrorKind,
    ) -> Self {
        Self {
            op,
            net: net.into(),
            addr: addr.into(),
            kind,
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn net(&self) -> &str {
        &self.net
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn errno(&self) -> Option<Errno> {
        self.kind.errno()
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for io::ErrorKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::UnsupportedNetwork(..) => Self::Unsupported,
            ErrorKind::InvalidAddress(..) | ErrorKind::AddressFamilyMismatch => Self::InvalidInput,
            ErrorKind::NameResolutionFailed(..) => Self::NotFound,
            ErrorKind::HostCallFailed { errno, .. } => errno.into(),
            ErrorKind::Cancelled => Self::Interrupted,
            ErrorKind::Closed => Self::NotConnected,
            ErrorKind::ShortWrite => Self::WriteZero,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = err.kind.clone().into();
        Self::new(kind, err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display() {
        let err = Error::new(
            Op::Dial,
            "tcp",
            "127.0.0.1:1",
            ErrorKind::HostCallFailed {
                call: "connect",
                errno: Errno::CONNREFUSED,
            },
        );
        assert_eq!(
            err.to_string(),
            "dial tcp 127.0.0.1:1: connect: connection refused"
        );
        assert_eq!(err.errno(), Some(Errno::CONNREFUSED));

        let err = Error::new(Op::Read, "udp", "", ErrorKind::Closed);
        assert_eq!(err.to_string(), "read udp: use of closed network connection");
    }

    #[test]
    fn into_io() {
        let err = Error::new(Op::Dial, "tcp", "", ErrorKind::Cancelled);
        assert_eq!(io::Error::from(err).kind(), io::ErrorKind::Interrupted);

        let err = Error::new(
            Op::Read,
            "tcp",
            "",
            ErrorKind::HostCallFailed {
                call: "recv",
                errno: Errno::CONNRESET,
            },
        );
        assert_eq!(io::Error::from(err).kind(), io::ErrorKind::ConnectionReset);

        let err = Error::new(Op::Write, "tcp", "", ErrorKind::ShortWrite);
        assert_eq!(err.to_string(), "write tcp: short write");
        assert_eq!(io::Error::from(err).kind(), io::ErrorKind::WriteZero);
    }
}
