//! Adapter configuration. The embedding application owns these values; the
//! defaults match the stock server and LAN ports.

use crate::error::NetError;
use shared::{
    DEFAULT_DISCOVERY_PORT, DEFAULT_HOST_TIMEOUT_SECS, DEFAULT_RENDEZVOUS_PORT, IO_TIMEOUT_SECS,
    QUEUE_CAPACITY,
};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::lookup_host;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    pub server_host: String,
    pub port: u16,
    /// Applies to connect, every read and every write of one operation
    pub io_timeout: Duration,
    /// Minimum gap between two status polls, and between two host listings
    pub status_interval: Duration,
    pub queue_capacity: usize,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            port: DEFAULT_RENDEZVOUS_PORT,
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
            status_interval: Duration::from_secs(1),
            queue_capacity: QUEUE_CAPACITY,
        }
    }
}

impl RendezvousConfig {
    pub fn new(server_host: &str, port: u16) -> Self {
        Self {
            server_host: server_host.to_string(),
            port,
            ..Self::default()
        }
    }

    pub fn server_addr(&self) -> ServerAddr {
        ServerAddr::new(&self.server_host, self.port)
    }
}

/// Where the rendezvous server listens. Host names are resolved on the
/// network runtime, so the game loop never waits on a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    host: String,
    port: u16,
}

impl ServerAddr {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    /// The address when the host is a literal IP.
    pub fn literal(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Failure means no session can start.
    pub async fn resolve(&self, io_timeout: Duration) -> Result<SocketAddr, NetError> {
        if let Some(addr) = self.literal() {
            return Ok(addr);
        }

        let unresolved = || NetError::Unavailable(format!("rendezvous server {} cannot be resolved", self));
        let mut addrs = timeout(io_timeout, lookup_host((self.host.as_str(), self.port)))
            .await
            .map_err(|_| NetError::Timeout("server address"))?
            .map_err(|_| unresolved())?;
        addrs.next().ok_or_else(unresolved)
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Port guests listen on for service announcements
    pub discovery_port: u16,
    /// Where hosts send announcements; the limited broadcast address on a LAN
    pub announce_addr: IpAddr,
    pub announce_interval: Duration,
    pub io_timeout: Duration,
    pub queue_capacity: usize,
    /// Advertised when a host registers without a timeout
    pub default_timeout: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            announce_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_interval: Duration::from_secs(1),
            io_timeout: Duration::from_secs(IO_TIMEOUT_SECS),
            queue_capacity: QUEUE_CAPACITY,
            default_timeout: Duration::from_secs(u64::from(DEFAULT_HOST_TIMEOUT_SECS)),
        }
    }
}

impl LocalConfig {
    pub fn announce_target(&self) -> SocketAddr {
        SocketAddr::new(self.announce_addr, self.discovery_port)
    }

    /// The timeout a host advertises, in whole seconds.
    pub fn advertised_timeout(&self, requested_secs: u32) -> u32 {
        if requested_secs == 0 {
            u32::try_from(self.default_timeout.as_secs()).unwrap_or(u32::MAX)
        } else {
            requested_secs
        }
    }
}
