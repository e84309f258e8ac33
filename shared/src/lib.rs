//! Vocabulary shared by the matchmaking client and the rendezvous server.
//!
//! Everything that crosses a socket lives here: the rendezvous line grammar,
//! the in-game line protocol, the LAN discovery datagrams and the constants
//! both ends have to agree on.

pub mod discovery;
pub mod message;
pub mod protocol;

pub use discovery::{Datagram, LinkError, ServiceRecord, APPLICATION_ID};
pub use message::{GameMessage, MessageError, CLOSE_LINE, CONNECTION_LOST_LINE};
pub use protocol::{Request, Response};

pub const DEFAULT_RENDEZVOUS_PORT: u16 = 2525;
pub const DEFAULT_DISCOVERY_PORT: u16 = 2526;
pub const QUEUE_CAPACITY: usize = 1000;
pub const IO_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HOST_TIMEOUT_SECS: u32 = 30;

/// Line both ends of a fresh peer socket exchange before any game traffic.
pub const HANDSHAKE_TOKEN: &str = "MATCHLINK_READY";

/// A session advertised by a host, as seen by a prospective guest.
///
/// The cookie is opaque: it is whatever the rendezvous server or the local
/// advertiser handed out, and is only ever echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    nickname: String,
    cookie: String,
    data: String,
}

impl Host {
    pub fn new(nickname: &str, cookie: &str, data: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            cookie: cookie.to_string(),
            data: data.to_string(),
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn connection_cookie(&self) -> &str {
        &self.cookie
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// Parses one `NICKNAME COOKIE DATA` line of a host listing.
    ///
    /// The data part may itself contain spaces (`"LEVEL_NAME MAP_FILE"`) and
    /// may be absent.
    pub fn parse_entry(line: &str) -> Option<Host> {
        let mut parts = line.trim().splitn(3, ' ');
        let nickname = parts.next().filter(|s| !s.is_empty())?;
        let cookie = parts.next().filter(|s| !s.is_empty())?;
        let data = parts.next().unwrap_or("").trim();
        Some(Host::new(nickname, cookie, data))
    }

    pub fn to_entry(&self) -> String {
        if self.data.is_empty() {
            format!("{} {}", self.nickname, self.cookie)
        } else {
            format!("{} {} {}", self.nickname, self.cookie, self.data)
        }
    }
}

/// Makes a value safe to embed as a single whitespace-free token.
pub fn sanitize_token(value: &str) -> String {
    let token: String = value
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    if token.is_empty() {
        "_".to_string()
    } else {
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_entry_with_spaced_data() {
        let host = Host::parse_entry("alice 0badc0ffee LEVEL_1 maps/arena.map").unwrap();
        assert_eq!(host.nickname(), "alice");
        assert_eq!(host.connection_cookie(), "0badc0ffee");
        assert_eq!(host.data(), "LEVEL_1 maps/arena.map");
        assert_eq!(host.to_entry(), "alice 0badc0ffee LEVEL_1 maps/arena.map");
    }

    #[test]
    fn test_host_entry_without_data() {
        let host = Host::parse_entry("bob 42").unwrap();
        assert_eq!(host.data(), "");
        assert_eq!(host.to_entry(), "bob 42");
    }

    #[test]
    fn test_host_entry_malformed() {
        assert!(Host::parse_entry("").is_none());
        assert!(Host::parse_entry("lonely").is_none());
        assert!(Host::parse_entry("   ").is_none());
    }

    #[test]
    fn test_sanitize_token() {
        assert_eq!(sanitize_token("Big Al"), "Big_Al");
        assert_eq!(sanitize_token("  x\ty "), "x_y");
        assert_eq!(sanitize_token(""), "_");
    }
}
