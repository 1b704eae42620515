use core::fmt::Debug;
use core::str::FromStr;

use std::collections::BTreeMap;
use std::env::{self, VarError};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default listen backlog
pub const DEFAULT_LISTEN_BACKLOG: u32 = 64;

/// Default capacity of the `getaddrinfo` result buffer
pub const DEFAULT_MAX_ADDRINFO_RESULTS: usize = 8;

fn getenv<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Debug,
{
    match env::var(key).as_deref().map(FromStr::from_str) {
        Ok(Ok(v)) => Some(v),
        Ok(Err(err)) => {
            warn!(?err, "failed to parse `{key}` value, ignoring");
            None
        }
        Err(VarError::NotPresent) => None,
        Err(VarError::NotUnicode(..)) => {
            warn!("`{key}` value is not valid UTF-8, ignoring");
            None
        }
    }
}

fn default_listen_backlog() -> u32 {
    DEFAULT_LISTEN_BACKLOG
}

fn default_max_addrinfo_results() -> usize {
    DEFAULT_MAX_ADDRINFO_RESULTS
}

fn default_reuse_address() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[cfg_attr(feature = "schemars", derive(schemars::JsonSchema))]
pub struct Config {
    /// Backlog passed to the host when listening
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,

    /// Maximum number of entries requested from the host resolver
    #[serde(default = "default_max_addrinfo_results")]
    pub max_addrinfo_results: usize,

    /// Whether listeners and bound packet endpoints request address reuse
    #[serde(default = "default_reuse_address")]
    pub reuse_address: bool,

    /// Service names resolvable in addition to the built-in ones
    #[serde(default)]
    pub services: BTreeMap<Box<str>, u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            max_addrinfo_results: DEFAULT_MAX_ADDRINFO_RESULTS,
            reuse_address: true,
            services: BTreeMap::default(),
        }
    }
}

impl Config {
    /// Parses a TOML configuration.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Applies overrides set in the `WASINET_*` environment variables.
    pub fn with_env(mut self) -> Self {
        if let Some(v) = getenv("WASINET_LISTEN_BACKLOG") {
            self.listen_backlog = v;
        }
        if let Some(v) = getenv("WASINET_MAX_ADDRINFO_RESULTS") {
            self.max_addrinfo_results = v;
        }
        if let Some(v) = getenv("WASINET_REUSE_ADDRESS") {
            self.reuse_address = v;
        }
        self
    }

    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }
}
