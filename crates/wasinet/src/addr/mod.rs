use core::fmt;
use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use core::str::FromStr;

use crate::ErrorKind;

mod raw;

pub(crate) use raw::check_unix_path;
pub use raw::{AddressBuffer, RawSockAddr, UNIX_PATH_MAX};

/// Address family, with its host wire value as discriminant.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum Family {
    Unspec = 0,
    Inet4 = 1,
    Inet6 = 2,
    Unix = 3,
}

impl Family {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Unspec),
            1 => Some(Self::Inet4),
            2 => Some(Self::Inet6),
            3 => Some(Self::Unix),
            _ => None,
        }
    }
}

/// Socket type, with its host wire value as discriminant.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum SocketType {
    Any = 0,
    Datagram = 1,
    Stream = 2,
}

/// Transport protocol, with its host wire value as discriminant.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum Protocol {
    Ip = 0,
    Tcp = 1,
    Udp = 2,
}

/// Network name accepted by dial, listen and resolve operations.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum NetworkKind {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
    Unixgram,
}

impl NetworkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
            Self::Udp => "udp",
            Self::Udp4 => "udp4",
            Self::Udp6 => "udp6",
            Self::Unix => "unix",
            Self::Unixgram => "unixgram",
        }
    }

    pub fn socket_type(&self) -> SocketType {
        match self {
            Self::Tcp | Self::Tcp4 | Self::Tcp6 | Self::Unix => SocketType::Stream,
            Self::Udp | Self::Udp4 | Self::Udp6 | Self::Unixgram => SocketType::Datagram,
        }
    }

    /// Family requested by the network suffix, [`Family::Unspec`] for bare
    /// `tcp` and `udp`.
    pub fn family(&self) -> Family {
        match self {
            Self::Tcp | Self::Udp => Family::Unspec,
            Self::Tcp4 | Self::Udp4 => Family::Inet4,
            Self::Tcp6 | Self::Udp6 => Family::Inet6,
            Self::Unix | Self::Unixgram => Family::Unix,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Tcp | Self::Tcp4 | Self::Tcp6 => Protocol::Tcp,
            Self::Udp | Self::Udp4 | Self::Udp6 => Protocol::Udp,
            Self::Unix | Self::Unixgram => Protocol::Ip,
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix | Self::Unixgram)
    }

    /// Whether an address of family `family` may be used on this network.
    pub fn accepts(&self, family: Family) -> bool {
        match self.family() {
            Family::Unspec => matches!(family, Family::Inet4 | Family::Inet6),
            requested => requested == family,
        }
    }
}

impl FromStr for NetworkKind {
    type Err = ErrorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            "udp" => Ok(Self::Udp),
            "udp4" => Ok(Self::Udp4),
            "udp6" => Ok(Self::Udp6),
            "unix" => Ok(Self::Unix),
            "unixgram" => Ok(Self::Unixgram),
            _ => Err(ErrorKind::UnsupportedNetwork(s.into())),
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket address of any family the host can express.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Address {
    Inet4(SocketAddrV4),
    Inet6 {
        addr: SocketAddrV6,
        /// Literal zone identifier, kept for display only.
        zone: Option<Box<str>>,
    },
    /// Filesystem path, empty for unnamed sockets.
    Unix(Box<str>),
}

impl Address {
    /// Wildcard address of `family`, `None` for families without one.
    pub fn wildcard(family: Family, port: u16) -> Option<Self> {
        match family {
            Family::Inet4 => Some(Self::Inet4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))),
            Family::Inet6 => Some(Self::Inet6 {
                addr: SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0),
                zone: None,
            }),
            Family::Unspec | Family::Unix => None,
        }
    }

    pub fn unix(path: impl Into<Box<str>>) -> Self {
        Self::Unix(path.into())
    }

    pub fn family(&self) -> Family {
        match self {
            Self::Inet4(..) => Family::Inet4,
            Self::Inet6 { .. } => Family::Inet6,
            Self::Unix(..) => Family::Unix,
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(..))
    }

    /// Port of an IP address, `None` for Unix addresses.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Inet4(addr) => Some(addr.port()),
            Self::Inet6 { addr, .. } => Some(addr.port()),
            Self::Unix(..) => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Inet4(addr) => Some(IpAddr::V4(*addr.ip())),
            Self::Inet6 { addr, .. } => Some(IpAddr::V6(*addr.ip())),
            Self::Unix(..) => None,
        }
    }

    pub fn with_port(self, port: u16) -> Self {
        match self {
            Self::Inet4(addr) => Self::Inet4(SocketAddrV4::new(*addr.ip(), port)),
            Self::Inet6 { addr, zone } => Self::Inet6 {
                addr: SocketAddrV6::new(*addr.ip(), port, addr.flowinfo(), addr.scope_id()),
                zone,
            },
            addr @ Self::Unix(..) => addr,
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Inet4(addr) => Some(SocketAddr::V4(*addr)),
            Self::Inet6 { addr, .. } => Some(SocketAddr::V6(*addr)),
            Self::Unix(..) => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(addr) => Self::Inet4(addr),
            SocketAddr::V6(addr) => Self::Inet6 { addr, zone: None },
        }
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self::Inet4(addr)
    }
}

impl From<SocketAddrV6> for Address {
    fn from(addr: SocketAddrV6) -> Self {
        Self::Inet6 { addr, zone: None }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet4(addr) => addr.fmt(f),
            Self::Inet6 { addr, zone: None } => write!(f, "[{}]:{}", addr.ip(), addr.port()),
            Self::Inet6 {
                addr,
                zone: Some(zone),
            } => write!(f, "[{}%{zone}]:{}", addr.ip(), addr.port()),
            Self::Unix(path) => f.write_str(path),
        }
    }
}
