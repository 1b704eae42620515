use core::marker::PhantomData;
use core::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use super::{Address, Family};
use crate::{Errno, ErrorKind};

/// Size of the address reply buffer of hosts tagging replies with a family.
const CAPACITY: usize = 128;

/// Size of the address reply buffer of legacy hosts.
const LEGACY_CAPACITY: usize = 16;

/// Offset of the address bytes after the little-endian family prefix.
const DATA_OFFSET: usize = 2;

/// Longest Unix socket path the host address buffer can carry, leaving room
/// for the NUL terminator.
pub const UNIX_PATH_MAX: usize = CAPACITY - DATA_OFFSET - 2;

/// Native `AF_INET` value found in the family prefix of legacy `recv_from`
/// replies.
const LEGACY_AF_INET: u16 = 2;

/// Rejects Unix paths the host address buffer cannot represent.
pub(crate) fn check_unix_path(path: &str) -> Result<(), ErrorKind> {
    if path.len() > UNIX_PATH_MAX {
        return Err(ErrorKind::invalid_address(format!(
            "unix socket path `{path}` exceeds {UNIX_PATH_MAX} bytes"
        )));
    }
    if path.as_bytes().contains(&0) {
        return Err(ErrorKind::invalid_address(format!(
            "unix socket path `{path}` contains a NUL byte"
        )));
    }
    Ok(())
}

/// Host-visible pointer and length pair describing a [`RawSockAddr`].
///
/// Borrows the buffer it points into, so the buffer cannot be dropped or
/// moved while a host call may still access it.
#[repr(C)]
#[cfg_attr(not(target_os = "wasi"), allow(dead_code))]
pub struct AddressBuffer<'a> {
    buf: *mut u8,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

/// Fixed-size staging buffer exchanged with the host for socket addresses.
#[derive(Clone)]
pub struct RawSockAddr {
    buf: [u8; CAPACITY],
    len: usize,
}

impl RawSockAddr {
    /// Empty buffer for the host to write a family-tagged address into.
    pub fn reply() -> Self {
        Self {
            buf: [0; CAPACITY],
            len: CAPACITY,
        }
    }

    /// Empty buffer for a legacy host to write an untagged address into.
    pub fn legacy_reply() -> Self {
        Self {
            buf: [0; CAPACITY],
            len: LEGACY_CAPACITY,
        }
    }

    /// Encodes `addr` for an outgoing host call, returning the buffer and the
    /// port passed alongside it.
    pub fn encode(addr: &Address) -> Result<(Self, u16), Errno> {
        let mut buf = [0; CAPACITY];
        match addr {
            Address::Inet4(addr) => {
                buf[..4].copy_from_slice(&addr.ip().octets());
                Ok((Self { buf, len: 4 }, addr.port()))
            }
            Address::Inet6 { addr, zone } => {
                if addr.scope_id() != 0 || zone.is_some() {
                    return Err(Errno::NOTSUP);
                }
                buf[..16].copy_from_slice(&addr.ip().octets());
                Ok((Self { buf, len: 16 }, addr.port()))
            }
            Address::Unix(path) => {
                if path.len() > UNIX_PATH_MAX || path.as_bytes().contains(&0) {
                    return Err(Errno::INVAL);
                }
                buf[..DATA_OFFSET].copy_from_slice(&(Family::Unix as u16).to_le_bytes());
                buf[DATA_OFFSET..DATA_OFFSET + path.len()].copy_from_slice(path.as_bytes());
                Ok((Self { buf, len: CAPACITY }, 0))
            }
        }
    }

    pub fn buffer(&mut self) -> AddressBuffer<'_> {
        AddressBuffer {
            buf: self.buf.as_mut_ptr(),
            len: self.len,
            _marker: PhantomData,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Decodes a family-tagged reply, with the port reported separately.
    pub fn decode(&self, port: u32) -> Result<Address, Errno> {
        let [a, b, data @ ..] = &self.buf;
        let family = u16::from_le_bytes([*a, *b]);
        match Family::from_raw(family) {
            Some(Family::Inet4) => Ok(Address::Inet4(SocketAddrV4::new(
                ipv4(data),
                decode_port(port)?,
            ))),
            Some(Family::Inet6) => Ok(Address::Inet6 {
                addr: SocketAddrV6::new(ipv6(data), decode_port(port)?, 0, 0),
                zone: None,
            }),
            Some(Family::Unix) => Ok(Address::Unix(unix_path(data)?)),
            Some(Family::Unspec) | None => Err(Errno::AFNOSUPPORT),
        }
    }

    /// Decodes a legacy reply, where the family is reported as an address
    /// type of `4` or `6` and the buffer holds only the address bytes.
    pub fn decode_legacy(&self, addr_type: u32, port: u32) -> Result<Address, Errno> {
        match addr_type {
            4 => Ok(Address::Inet4(SocketAddrV4::new(
                ipv4(&self.buf),
                decode_port(port)?,
            ))),
            6 => Ok(Address::Inet6 {
                addr: SocketAddrV6::new(ipv6(&self.buf), decode_port(port)?, 0, 0),
                zone: None,
            }),
            _ => Err(Errno::AFNOSUPPORT),
        }
    }

    /// Decodes the source address of a legacy `recv_from`, laid out as a
    /// native IPv4 socket address with the port embedded.
    pub fn decode_legacy_source(&self) -> Result<Address, Errno> {
        let family = u16::from_le_bytes([self.buf[0], self.buf[1]]);
        if family != LEGACY_AF_INET {
            return Err(Errno::AFNOSUPPORT);
        }
        let port = u16::from_le_bytes([self.buf[2], self.buf[3]]);
        Ok(Address::Inet4(SocketAddrV4::new(
            ipv4(&self.buf[4..]),
            port,
        )))
    }
}

fn decode_port(port: u32) -> Result<u16, Errno> {
    u16::try_from(port).map_err(|_| Errno::INVAL)
}

fn ipv4(data: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(data[0], data[1], data[2], data[3])
}

fn ipv6(data: &[u8]) -> Ipv6Addr {
    let mut octets = [0; 16];
    octets.copy_from_slice(&data[..16]);
    Ipv6Addr::from(octets)
}

fn unix_path(data: &[u8]) -> Result<Box<str>, Errno> {
    let n = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    core::str::from_utf8(&data[..n])
        .map(Into::into)
        .map_err(|_| Errno::INVAL)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_ip() {
        let addr = Address::Inet4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 8080));
        let (raw, port) = RawSockAddr::encode(&addr).expect("failed to encode");
        assert_eq!(raw.as_bytes(), [10, 0, 0, 1]);
        assert_eq!(port, 8080);

        let addr = Address::Inet6 {
            addr: SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 0, 0),
            zone: None,
        };
        let (raw, port) = RawSockAddr::encode(&addr).expect("failed to encode");
        assert_eq!(raw.as_bytes(), Ipv6Addr::LOCALHOST.octets());
        assert_eq!(port, 443);
    }

    #[test]
    fn encode_zone() {
        let addr = Address::Inet6 {
            addr: SocketAddrV6::new(Ipv6Addr::LOCALHOST, 443, 0, 2),
            zone: None,
        };
        assert_eq!(RawSockAddr::encode(&addr).err(), Some(Errno::NOTSUP));
    }

    #[test]
    fn encode_unix() {
        let (raw, _) = RawSockAddr::encode(&Address::unix("/run/app.sock")).expect("failed to encode");
        let bytes = raw.as_bytes();
        assert_eq!(bytes.len(), 128);
        assert_eq!(&bytes[..2], &[3, 0]);
        assert_eq!(&bytes[2..15], b"/run/app.sock");
        assert_eq!(bytes[15], 0);
        assert_eq!(raw.decode(0), Ok(Address::unix("/run/app.sock")));
    }

    #[test]
    fn unix_path_limit() {
        let path = "a".repeat(UNIX_PATH_MAX);
        assert!(check_unix_path(&path).is_ok());
        assert!(RawSockAddr::encode(&Address::unix(path)).is_ok());

        let path = "a".repeat(UNIX_PATH_MAX + 1);
        assert!(matches!(
            check_unix_path(&path),
            Err(ErrorKind::InvalidAddress(..))
        ));
        assert_eq!(
            RawSockAddr::encode(&Address::unix(path)).err(),
            Some(Errno::INVAL)
        );
        assert!(check_unix_path("a\0b").is_err());
    }

    #[test]
    fn decode() {
        let mut raw = RawSockAddr::reply();
        raw.buf[..6].copy_from_slice(&[1, 0, 127, 0, 0, 1]);
        assert_eq!(
            raw.decode(4242),
            Ok(Address::Inet4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4242)))
        );
        assert_eq!(raw.decode(70000), Err(Errno::INVAL));

        let mut raw = RawSockAddr::reply();
        raw.buf[0] = 2;
        raw.buf[2..18].copy_from_slice(&Ipv6Addr::LOCALHOST.octets());
        assert_eq!(raw.decode(1).map(|addr| addr.to_string()), Ok("[::1]:1".into()));

        let mut raw = RawSockAddr::reply();
        raw.buf[0] = 9;
        assert_eq!(raw.decode(0), Err(Errno::AFNOSUPPORT));
    }

    #[test]
    fn decode_legacy() {
        let mut raw = RawSockAddr::legacy_reply();
        raw.buf[..4].copy_from_slice(&[192, 168, 1, 2]);
        assert_eq!(
            raw.decode_legacy(4, 53),
            Ok(Address::Inet4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 2), 53)))
        );
        assert_eq!(raw.decode_legacy(5, 53), Err(Errno::AFNOSUPPORT));

        let mut raw = RawSockAddr::legacy_reply();
        raw.buf[..8].copy_from_slice(&[2, 0, 0x90, 0x1f, 10, 1, 2, 3]);
        assert_eq!(
            raw.decode_legacy_source(),
            Ok(Address::Inet4(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 8080)))
        );
    }
}
