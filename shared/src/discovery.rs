//! LAN service discovery datagrams.
//!
//! A host announces a [`ServiceRecord`]; a guest that hears it probes the
//! announcing address and only trusts the record once the `Available` reply
//! comes back. Link setup is a request/accept pair over the same sockets.

use crate::{Host, DEFAULT_HOST_TIMEOUT_SECS};
use bincode::{deserialize, serialize};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Records carrying any other identifier belong to someone else's game.
pub const APPLICATION_ID: &str = "matchlink";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub application: String,
    pub cookie: String,
    pub nickname: String,
    /// Seconds a guest keeps the record without hearing it again. Zero means
    /// the advertiser left it unset.
    pub timeout_secs: u32,
    pub data: String,
}

impl ServiceRecord {
    pub fn new(cookie: &str, nickname: &str, timeout_secs: u32, data: &str) -> Self {
        Self {
            application: APPLICATION_ID.to_string(),
            cookie: cookie.to_string(),
            nickname: nickname.to_string(),
            timeout_secs,
            data: data.to_string(),
        }
    }

    pub fn is_candidate(&self) -> bool {
        self.application == APPLICATION_ID && !self.cookie.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_or(Duration::from_secs(u64::from(DEFAULT_HOST_TIMEOUT_SECS)))
    }

    /// The advertised timeout, or `default` when the advertiser left it unset.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        if self.timeout_secs == 0 {
            default
        } else {
            Duration::from_secs(u64::from(self.timeout_secs))
        }
    }

    pub fn to_host(&self) -> Host {
        Host::new(&self.nickname, &self.cookie, &self.data)
    }
}

/// Link-level failures, reported by the peer or detected locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkError {
    Busy,
    Unsupported,
    Lost,
    Error,
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            LinkError::Busy => "peer is busy with another session",
            LinkError::Unsupported => "peer does not offer the requested session",
            LinkError::Lost => "link to peer was lost",
            LinkError::Error => "internal link error",
        };
        write!(f, "{}", reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Datagram {
    Announce(ServiceRecord),
    Probe,
    Available { port: u16 },
    LinkRequest { cookie: String },
    LinkAccepted,
    LinkRejected(LinkError),
    Withdraw,
}

impl Datagram {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Datagram, bincode::Error> {
        deserialize(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_candidate() {
        let record = ServiceRecord::new("cafe", "alice", 20, "LEVEL_1 arena.map");
        assert!(record.is_candidate());

        let mut foreign = record.clone();
        foreign.application = "othergame".to_string();
        assert!(!foreign.is_candidate());

        let mut anonymous = record;
        anonymous.cookie.clear();
        assert!(!anonymous.is_candidate());
    }

    #[test]
    fn test_record_timeout_default() {
        let record = ServiceRecord::new("cafe", "alice", 0, "");
        assert_eq!(
            record.timeout(),
            Duration::from_secs(DEFAULT_HOST_TIMEOUT_SECS as u64)
        );
        let record = ServiceRecord::new("cafe", "alice", 5, "");
        assert_eq!(record.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_record_timeout_or() {
        let unset = ServiceRecord::new("cafe", "alice", 0, "");
        assert_eq!(unset.timeout_or(Duration::from_secs(7)), Duration::from_secs(7));
        let set = ServiceRecord::new("cafe", "alice", 3, "");
        assert_eq!(set.timeout_or(Duration::from_secs(7)), Duration::from_secs(3));
    }

    #[test]
    fn test_record_to_host() {
        let host = ServiceRecord::new("cafe", "alice", 5, "LEVEL_2 maze.map").to_host();
        assert_eq!(host.nickname(), "alice");
        assert_eq!(host.connection_cookie(), "cafe");
        assert_eq!(host.data(), "LEVEL_2 maze.map");
    }

    #[test]
    fn test_announce_datagram() {
        let datagram = Datagram::Announce(ServiceRecord::new("cafe", "alice", 5, "x"));
        let bytes = datagram.encode().unwrap();
        assert_eq!(Datagram::decode(&bytes).unwrap(), datagram);
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        let bytes = Datagram::LinkRequest {
            cookie: "cafe".to_string(),
        }
        .encode()
        .unwrap();
        assert!(Datagram::decode(&bytes[..bytes.len() / 2]).is_err());
        assert!(Datagram::decode(&[]).is_err());
    }

    #[test]
    fn test_link_error_reasons() {
        assert_eq!(LinkError::Busy.to_string(), "peer is busy with another session");
        assert_eq!(LinkError::Lost.to_string(), "link to peer was lost");
    }
}
