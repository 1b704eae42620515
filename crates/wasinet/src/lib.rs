pub mod addr;
pub mod config;
mod connect;
mod errno;
mod error;
pub mod host;
mod listener;
mod packet;
pub mod resolve;
mod stream;
pub mod unix;

use core::time::Duration;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

pub use self::addr::{Address, Family, NetworkKind};
pub use self::config::Config;
pub use self::connect::{ConnectState, Dialer};
pub use self::errno::Errno;
pub use self::error::{Error, ErrorKind, Op};
pub use self::host::Host;
pub use self::listener::Listener;
pub use self::packet::PacketEndpoint;
pub use self::resolve::{Purpose, Resolver};
pub use self::stream::Connection;

/// Entry point to all socket operations of a [`Host`].
#[derive(Clone)]
pub struct Network {
    host: Arc<dyn Host>,
    config: Arc<Config>,
    resolver: Resolver,
}

impl Network {
    pub fn new(host: Arc<dyn Host>, config: Config) -> Self {
        let resolver = Resolver::new(Arc::clone(&host), &config);
        Self {
            host,
            config: Arc::new(config),
            resolver,
        }
    }

    /// Platform host backend configured from the environment.
    pub fn from_env() -> Self {
        Self::new(host::platform(), Config::from_env())
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    fn resolve_for(
        &self,
        op: Op,
        purpose: Purpose,
        network: &str,
        address: &str,
    ) -> Result<(NetworkKind, Vec<Address>), Error> {
        let err = |kind| Error::new(op, network, address, kind);
        let kind: NetworkKind = network.parse().map_err(err)?;
        let addrs = self.resolver.resolve(purpose, kind, address).map_err(err)?;
        Ok((kind, addrs))
    }

    /// Resolves `address` on `network` to the addresses a dial or listen
    /// for `purpose` would try.
    pub fn resolve(
        &self,
        purpose: Purpose,
        network: &str,
        address: &str,
    ) -> Result<Vec<Address>, Error> {
        let (_, addrs) = self.resolve_for(Op::Resolve, purpose, network, address)?;
        Ok(addrs)
    }

    pub async fn dial(&self, network: &str, address: &str) -> Result<Connection, Error> {
        Dialer::new(self.clone()).dial(network, address).await
    }

    pub async fn dial_with_cancel(
        &self,
        network: &str,
        address: &str,
        token: &CancellationToken,
    ) -> Result<Connection, Error> {
        Dialer::new(self.clone())
            .dial_with_cancel(network, address, token)
            .await
    }

    pub async fn dial_timeout(
        &self,
        network: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<Connection, Error> {
        Dialer::new(self.clone())
            .with_timeout(timeout)
            .dial(network, address)
            .await
    }

    /// Listens for stream connections on `address`.
    #[instrument(level = "debug", skip(self))]
    pub fn listen(&self, network: &str, address: &str) -> Result<Listener, Error> {
        let (kind, addrs) = self.resolve_for(Op::Listen, Purpose::Listen, network, address)?;
        Listener::bind(&self.host, &self.config, kind, &addrs)
            .map_err(|e| Error::new(Op::Listen, network, address, e))
    }

    /// Opens a datagram endpoint bound to `address`.
    #[instrument(level = "debug", skip(self))]
    pub fn listen_packet(&self, network: &str, address: &str) -> Result<PacketEndpoint, Error> {
        let (kind, addrs) = self.resolve_for(Op::Listen, Purpose::Listen, network, address)?;
        PacketEndpoint::bind(&self.host, &self.config, kind, &addrs)
            .map_err(|e| Error::new(Op::Listen, network, address, e))
    }

    /// Opens a datagram endpoint connected to `remote`, optionally bound to
    /// `local` first.
    #[instrument(level = "debug", skip(self))]
    pub async fn dial_packet(
        &self,
        network: &str,
        local: Option<&str>,
        remote: &str,
    ) -> Result<PacketEndpoint, Error> {
        let (kind, remotes) = self.resolve_for(Op::Dial, Purpose::Dial, network, remote)?;
        let local = match local {
            Some(local) => {
                let (_, addrs) = self.resolve_for(Op::Dial, Purpose::Listen, network, local)?;
                addrs.into_iter().next()
            }
            None => None,
        };
        let mut last = ErrorKind::NameResolutionFailed(remote.into());
        for addr in &remotes {
            match PacketEndpoint::connect(&self.host, kind, local.as_ref(), addr).await {
                Ok(endpoint) => return Ok(endpoint),
                Err(e) => last = e,
            }
        }
        Err(Error::new(Op::Dial, network, remote, last))
    }

    /// Opens an unbound datagram endpoint of `family`.
    pub fn open_packet(&self, network: &str, family: Family) -> Result<PacketEndpoint, Error> {
        let err = |kind| Error::new(Op::Dial, network, "", kind);
        let kind: NetworkKind = network.parse().map_err(err)?;
        PacketEndpoint::open(&self.host, kind, family).map_err(err)
    }
}
