use core::fmt;

/// Error number returned by a host socket call, in the WASI preview1 numbering.
///
/// Every backend reports failures in this space, native backends translate
/// their platform error numbers on the way out.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Errno(u16);

impl Errno {
    pub const SUCCESS: Self = Self(0);
    pub const TOOBIG: Self = Self(1);
    pub const ACCES: Self = Self(2);
    pub const ADDRINUSE: Self = Self(3);
    pub const ADDRNOTAVAIL: Self = Self(4);
    pub const AFNOSUPPORT: Self = Self(5);
    pub const AGAIN: Self = Self(6);
    pub const ALREADY: Self = Self(7);
    pub const BADF: Self = Self(8);
    pub const CANCELED: Self = Self(11);
    pub const CONNABORTED: Self = Self(13);
    pub const CONNREFUSED: Self = Self(14);
    pub const CONNRESET: Self = Self(15);
    pub const DESTADDRREQ: Self = Self(17);
    pub const FAULT: Self = Self(21);
    pub const HOSTUNREACH: Self = Self(23);
    pub const INPROGRESS: Self = Self(26);
    pub const INTR: Self = Self(27);
    pub const INVAL: Self = Self(28);
    pub const IO: Self = Self(29);
    pub const ISCONN: Self = Self(30);
    pub const MFILE: Self = Self(33);
    pub const MSGSIZE: Self = Self(35);
    pub const NAMETOOLONG: Self = Self(37);
    pub const NETDOWN: Self = Self(38);
    pub const NETRESET: Self = Self(39);
    pub const NETUNREACH: Self = Self(40);
    pub const NFILE: Self = Self(41);
    pub const NOBUFS: Self = Self(42);
    pub const NOENT: Self = Self(44);
    pub const NOMEM: Self = Self(48);
    pub const NOPROTOOPT: Self = Self(50);
    pub const NOSYS: Self = Self(52);
    pub const NOTCONN: Self = Self(53);
    pub const NOTSOCK: Self = Self(57);
    pub const NOTSUP: Self = Self(58);
    pub const PERM: Self = Self(63);
    pub const PIPE: Self = Self(64);
    pub const PROTONOSUPPORT: Self = Self(66);
    pub const PROTOTYPE: Self = Self(67);
    pub const TIMEDOUT: Self = Self(73);
    pub const NOTCAPABLE: Self = Self(76);

    /// Wraps a raw host error number.
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    /// Converts a host call return value into a `Result`.
    pub fn result(self) -> Result<(), Self> {
        if self == Self::SUCCESS {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Interprets an integer socket option value, such as the pending error
    /// of a connecting socket.
    pub fn from_option_value(v: i32) -> Self {
        u16::try_from(v).map_or(Self::INVAL, Self)
    }

    fn description(self) -> Option<&'static str> {
        let s = match self {
            Self::SUCCESS => "success",
            Self::TOOBIG => "argument list too long",
            Self::ACCES => "permission denied",
            Self::ADDRINUSE => "address already in use",
            Self::ADDRNOTAVAIL => "cannot assign requested address",
            Self::AFNOSUPPORT => "address family not supported by protocol",
            Self::AGAIN => "resource temporarily unavailable",
            Self::ALREADY => "operation already in progress",
            Self::BADF => "bad file descriptor",
            Self::CANCELED => "operation canceled",
            Self::CONNABORTED => "software caused connection abort",
            Self::CONNREFUSED => "connection refused",
            Self::CONNRESET => "connection reset by peer",
            Self::DESTADDRREQ => "destination address required",
            Self::FAULT => "bad address",
            Self::HOSTUNREACH => "no route to host",
            Self::INPROGRESS => "operation now in progress",
            Self::INTR => "interrupted system call",
            Self::INVAL => "invalid argument",
            Self::IO => "input/output error",
            Self::ISCONN => "transport endpoint is already connected",
            Self::MFILE => "too many open files",
            Self::MSGSIZE => "message too long",
            Self::NAMETOOLONG => "file name too long",
            Self::NETDOWN => "network is down",
            Self::NETRESET => "network dropped connection on reset",
            Self::NETUNREACH => "network is unreachable",
            Self::NFILE => "too many open files in system",
            Self::NOBUFS => "no buffer space available",
            Self::NOENT => "no such file or directory",
            Self::NOMEM => "cannot allocate memory",
            Self::NOPROTOOPT => "protocol not available",
            Self::NOSYS => "function not implemented",
            Self::NOTCONN => "transport endpoint is not connected",
            Self::NOTSOCK => "socket operation on non-socket",
            Self::NOTSUP => "operation not supported",
            Self::PERM => "operation not permitted",
            Self::PIPE => "broken pipe",
            Self::PROTONOSUPPORT => "protocol not supported",
            Self::PROTOTYPE => "protocol wrong type for socket",
            Self::TIMEDOUT => "connection timed out",
            Self::NOTCAPABLE => "capabilities insufficient",
            _ => return None,
        };
        Some(s)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(s) => f.write_str(s),
            None => write!(f, "errno {}", self.0),
        }
    }
}

impl std::error::Error for Errno {}

impl From<Errno> for std::io::ErrorKind {
    fn from(errno: Errno) -> Self {
        use std::io::ErrorKind;

        match errno {
            Errno::AGAIN => ErrorKind::WouldBlock,
            Errno::INTR => ErrorKind::Interrupted,
            Errno::ACCES | Errno::PERM | Errno::NOTCAPABLE => ErrorKind::PermissionDenied,
            Errno::ADDRINUSE => ErrorKind::AddrInUse,
            Errno::ADDRNOTAVAIL => ErrorKind::AddrNotAvailable,
            Errno::CONNABORTED => ErrorKind::ConnectionAborted,
            Errno::CONNREFUSED => ErrorKind::ConnectionRefused,
            Errno::CONNRESET => ErrorKind::ConnectionReset,
            Errno::NOTCONN => ErrorKind::NotConnected,
            Errno::PIPE => ErrorKind::BrokenPipe,
            Errno::TIMEDOUT => ErrorKind::TimedOut,
            Errno::INVAL | Errno::NAMETOOLONG => ErrorKind::InvalidInput,
            Errno::NOMEM | Errno::NOBUFS => ErrorKind::OutOfMemory,
            Errno::NOSYS
            | Errno::NOTSUP
            | Errno::NOPROTOOPT
            | Errno::AFNOSUPPORT
            | Errno::PROTONOSUPPORT => ErrorKind::Unsupported,
            _ => ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn option_value() {
        assert_eq!(Errno::from_option_value(0), Errno::SUCCESS);
        assert_eq!(Errno::from_option_value(26), Errno::INPROGRESS);
        assert_eq!(Errno::from_option_value(-1), Errno::INVAL);
        assert_eq!(Errno::from_option_value(1 << 20), Errno::INVAL);
    }

    #[test]
    fn display() {
        assert_eq!(Errno::CONNREFUSED.to_string(), "connection refused");
        assert_eq!(Errno::from_raw(60).to_string(), "errno 60");
        assert!(Errno::SUCCESS.result().is_ok());
        assert_eq!(Errno::AGAIN.result(), Err(Errno::AGAIN));
    }
}
