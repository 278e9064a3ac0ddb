//! Runtime configuration. Parsing/validation only — no network or file I/O
//! beyond the `toml` deserialization itself; the binary crate owns loading
//! the file and turning it into a running [`crate::ForwardingEngine`].

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;

use crate::upstream::UpstreamFlags;

/// One `server=` line worth of configuration: an upstream address plus the
/// optional domain/nodots/no-addr/literal restrictions.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    pub address: SocketAddr,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub for_nodots: bool,
    #[serde(default)]
    pub no_addr: bool,
    #[serde(default)]
    pub literal_address: Option<std::net::IpAddr>,
}

impl ServerSpec {
    pub fn flags(&self) -> UpstreamFlags {
        let mut flags = UpstreamFlags::empty();
        if self.for_nodots {
            flags |= UpstreamFlags::FOR_NODOTS;
        }
        if self.domain.is_some() {
            flags |= UpstreamFlags::HAS_DOMAIN;
        }
        if self.no_addr {
            flags |= UpstreamFlags::NO_ADDR;
        }
        if self.literal_address.is_some() {
            flags |= UpstreamFlags::LITERAL_ADDRESS;
        }
        flags
    }
}

/// Tunables, mirroring the original's `#define`d constants so the bounds
/// in the rest of the engine stay obviously traceable to a single place.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    pub listen: Vec<SocketAddr>,
    pub servers: Vec<ServerSpec>,

    /// Answer single-label queries with NXDOMAIN when no server entry
    /// claims them, instead of forwarding to every plain upstream.
    pub nodots_local: bool,

    /// Maximum number of in-flight forwarded queries (`FTABSIZ`).
    pub max_in_flight: usize,
    /// How long a forwarding-table entry may sit unanswered before it is
    /// eligible for reuse (`TIMEOUT`).
    pub forward_timeout: Duration,
    /// How long to wait for a reply from one upstream before trying the
    /// next one in the ring walk.
    pub retry_interval: Duration,
    /// Idle shutdown deadline for a TCP client connection.
    pub tcp_idle_timeout: Duration,
    /// Advertised EDNS UDP payload size ceiling; an upstream reply's OPT
    /// record advertising more than this is clamped down to it before the
    /// reply is relayed to the client, so the client never sees an
    /// upstream promising more than we're prepared to receive for it.
    pub edns_packet_max: u16,
    /// How many times `allocate_id` may retry before giving up on a
    /// forwarding attempt (`COUNT_ID_RETRIES` in spirit).
    pub id_retries: u16,
    /// TTL applied to answers this engine synthesizes itself (a literal
    /// address, an empty NOERROR, or an NXDOMAIN) rather than one read
    /// off an upstream reply.
    pub local_ttl: u32,
    /// `ORDER`: when set, a plain (unrestricted) query's ring walk always
    /// starts at the head of the upstream list rather than at the sticky
    /// server, trading "fastest server wins" for "first server always
    /// tried first".
    pub strict_order: bool,
    /// `LOGRATE`: minimum interval between "forwarding table overflow"
    /// warnings, so a sustained flood logs at most once per interval.
    pub log_rate: Duration,

    /// `--interface`: when non-empty, only serve queries that arrived on
    /// one of these interfaces.
    pub interface_names: Vec<String>,
    /// Destination addresses a query is also accepted on, independent of
    /// which interface it arrived on (matched by address family).
    pub interface_addrs: Vec<IpAddr>,
    /// `--except-interface`: never serve queries that arrived on one of
    /// these interfaces, even if `interface_names`/`interface_addrs`
    /// would otherwise accept them.
    pub interface_except: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            servers: Vec::new(),
            nodots_local: false,
            max_in_flight: 1000,
            forward_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
            tcp_idle_timeout: Duration::from_secs(2),
            edns_packet_max: 1232,
            id_retries: 20,
            local_ttl: 0,
            strict_order: false,
            log_rate: Duration::from_secs(60),
            interface_names: Vec::new(),
            interface_addrs: Vec::new(),
            interface_except: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("no listen addresses configured")]
    NoListeners,
}

impl Options {
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let options = Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        if options.listen.is_empty() {
            return Err(ConfigError::NoListeners);
        }
        Ok(options)
    }
}
