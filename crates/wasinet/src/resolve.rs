use core::net::{IpAddr, SocketAddrV4, SocketAddrV6};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{instrument, trace};

use crate::addr::{Address, Family, NetworkKind, SocketType};
use crate::host::{AddrInfoHints, AiFlags, Host};
use crate::{Config, ErrorKind};

/// Well-known services resolvable by name.
const SERVICES: &[(&str, u16)] = &[
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("domain", 53),
    ("http", 80),
    ("pop3", 110),
    ("ntp", 123),
    ("imap", 143),
    ("ldap", 389),
    ("https", 443),
    ("submission", 587),
    ("imaps", 993),
    ("pop3s", 995),
];

/// Whether an address is resolved to connect to or to bind on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Purpose {
    Dial,
    Listen,
}

/// Splits `host:port`, `[host]:port` and `[host%zone]:port`.
pub fn split_host_port(address: &str) -> Result<(&str, &str), ErrorKind> {
    if let Some(rest) = address.strip_prefix('[') {
        let Some((host, rest)) = rest.split_once(']') else {
            return Err(ErrorKind::invalid_address(format!(
                "missing ']' in address `{address}`"
            )));
        };
        let Some(port) = rest.strip_prefix(':') else {
            return Err(ErrorKind::invalid_address(format!(
                "missing port in address `{address}`"
            )));
        };
        return Ok((host, port));
    }
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(ErrorKind::invalid_address(format!(
            "missing port in address `{address}`"
        )));
    };
    if host.contains(':') {
        return Err(ErrorKind::invalid_address(format!(
            "too many colons in address `{address}`"
        )));
    }
    Ok((host, port))
}

/// Parses an IP literal with an optional IPv6 zone.
fn parse_literal(host: &str, port: u16) -> Result<Option<Address>, ErrorKind> {
    let (ip, zone) = match host.split_once('%') {
        Some((ip, zone)) => (ip, Some(zone)),
        None => (host, None),
    };
    match (ip.parse::<IpAddr>(), zone) {
        (Ok(IpAddr::V4(ip)), None) => Ok(Some(Address::Inet4(SocketAddrV4::new(ip, port)))),
        (Ok(IpAddr::V4(..)), Some(..)) => Err(ErrorKind::invalid_address(format!(
            "zone on IPv4 address `{host}`"
        ))),
        (Ok(IpAddr::V6(ip)), zone) => Ok(Some(Address::Inet6 {
            addr: SocketAddrV6::new(ip, port, 0, 0),
            zone: zone.filter(|zone| !zone.is_empty()).map(Into::into),
        })),
        (Err(..), _) => Ok(None),
    }
}

/// Wildcard address to listen on when no host is given.
fn wildcard(network: NetworkKind, port: u16) -> Option<Address> {
    match network.family() {
        Family::Unspec | Family::Inet4 => Address::wildcard(Family::Inet4, port),
        Family::Inet6 => Address::wildcard(Family::Inet6, port),
        Family::Unix => None,
    }
}

/// Computes the `getaddrinfo` hints for a lookup of `node` and `service`.
pub fn hints(purpose: Purpose, network: NetworkKind, node: &str, service: &str) -> AddrInfoHints {
    let mut flags = AiFlags::empty();
    if node.parse::<IpAddr>().is_ok() {
        flags |= AiFlags::NUMERICHOST;
    }
    if service.parse::<u16>().is_ok() {
        flags |= AiFlags::NUMERICSERV;
    }
    if purpose == Purpose::Listen && node.is_empty() {
        flags |= AiFlags::PASSIVE;
    }
    AddrInfoHints {
        flags,
        family: network.family(),
        socket_type: network.socket_type(),
        protocol: network.protocol(),
    }
}

/// Maps `host:service` strings to socket addresses.
///
/// Results are never cached, every call consults the host again.
#[derive(Clone)]
pub struct Resolver {
    host: Arc<dyn Host>,
    services: BTreeMap<Box<str>, u16>,
    max_results: usize,
}

impl Resolver {
    pub fn new(host: Arc<dyn Host>, config: &Config) -> Self {
        Self {
            host,
            services: config.services.clone(),
            max_results: config.max_addrinfo_results,
        }
    }

    /// Resolves a port number or service name.
    pub fn lookup_port(&self, service: &str) -> Result<u16, ErrorKind> {
        if !service.is_empty() && service.bytes().all(|b| b.is_ascii_digit()) {
            return service
                .parse()
                .map_err(|_| ErrorKind::invalid_address(format!("invalid port `{service}`")));
        }
        let name = service.to_ascii_lowercase();
        self.services
            .get(name.as_str())
            .copied()
            .or_else(|| {
                SERVICES
                    .iter()
                    .find_map(|(s, port)| (*s == name).then_some(*port))
            })
            .ok_or_else(|| ErrorKind::invalid_address(format!("unknown port `{service}`")))
    }

    /// Resolves `address` on `network`, returning candidates in host order.
    #[instrument(level = "trace", skip(self))]
    pub fn resolve(
        &self,
        purpose: Purpose,
        network: NetworkKind,
        address: &str,
    ) -> Result<Vec<Address>, ErrorKind> {
        if network.is_unix() {
            return Ok(vec![Address::unix(address)]);
        }
        let (host, service) = split_host_port(address)?;
        let port = self.lookup_port(service)?;
        if host.is_empty() {
            return match (purpose, wildcard(network, port)) {
                (Purpose::Listen, Some(addr)) => Ok(vec![addr]),
                _ => Err(ErrorKind::invalid_address(format!(
                    "missing host in address `{address}`"
                ))),
            };
        }
        if let Some(addr) = parse_literal(host, port)? {
            if !network.accepts(addr.family()) {
                return Err(ErrorKind::NameResolutionFailed(host.into()));
            }
            return Ok(vec![addr]);
        }

        let service = port.to_string();
        let hints = hints(purpose, network, host, &service);
        let infos = self
            .host
            .getaddrinfo(host, &service, &hints, self.max_results)
            .map_err(ErrorKind::host("getaddrinfo"))?;
        trace!(?infos, "host lookup finished");
        let addrs: Vec<_> = infos
            .into_iter()
            .filter(|info| network.accepts(info.family))
            .filter(|info| {
                info.socket_type == SocketType::Any || info.socket_type == network.socket_type()
            })
            .map(|info| info.address.with_port(port))
            .collect();
        if addrs.is_empty() {
            return Err(ErrorKind::NameResolutionFailed(host.into()));
        }
        Ok(addrs)
    }
}
