//! LAN discovery: the host cache and the datagram tasks that fill it.
//!
//! A host announces its [`ServiceRecord`] to the discovery port. A guest
//! that hears it probes the announcing address, and the host answers with
//! the port it accepts peer links on. Only a peer that produced both the
//! record and the port is offered as a joinable host.
//!
//! Cached hosts expire after their advertised timeout unless re-announced,
//! and vanish as soon as their peer withdraws.

use crate::error::NetError;
use log::{debug, info};
use shared::{Datagram, Host, LinkError, ServiceRecord, DEFAULT_HOST_TIMEOUT_SECS};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout_at;

const MAX_DATAGRAM: usize = 2048;
const LINK_ATTEMPTS: u32 = 3;

/// A reachable host as seen by a guest
#[derive(Debug, Clone)]
pub struct HostRecord {
    pub host: Host,
    pub peer: SocketAddr,
    pub service_port: u16,
    pub discovered_at: Instant,
    pub timeout: Duration,
}

impl HostRecord {
    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.discovered_at) > self.timeout
    }

    /// Where the host accepts the direct link
    pub fn service_addr(&self) -> SocketAddr {
        SocketAddr::new(self.peer.ip(), self.service_port)
    }
}

#[derive(Debug, Default)]
pub struct HostCache {
    by_cookie: HashMap<String, HostRecord>,
}

impl HostCache {
    /// Inserts or refreshes a host. Returns true for a host not seen before.
    pub fn insert(&mut self, record: HostRecord) -> bool {
        let cookie = record.host.connection_cookie().to_string();
        self.by_cookie.insert(cookie, record).is_none()
    }

    pub fn get(&self, cookie: &str) -> Option<&HostRecord> {
        self.by_cookie.get(cookie)
    }

    /// Evicts stale hosts and hosts whose peer no longer offers them.
    pub fn sweep<F>(&mut self, now: Instant, offered: F) -> Vec<HostRecord>
    where
        F: Fn(&HostRecord) -> bool,
    {
        let evicted: Vec<String> = self
            .by_cookie
            .iter()
            .filter(|(_, record)| record.is_stale(now) || !offered(record))
            .map(|(cookie, _)| cookie.clone())
            .collect();

        evicted
            .iter()
            .filter_map(|cookie| self.by_cookie.remove(cookie))
            .collect()
    }

    /// Known hosts ordered by nickname
    pub fn hosts(&self) -> Vec<Host> {
        let mut hosts: Vec<Host> = self.by_cookie.values().map(|r| r.host.clone()).collect();
        hosts.sort_by(|a, b| a.nickname().cmp(b.nickname()));
        hosts
    }

    pub fn len(&self) -> usize {
        self.by_cookie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cookie.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_cookie.clear();
    }
}

/// Pairs up the two discovery signals per announcing peer
#[derive(Debug, Default)]
pub struct PeerTracker {
    records: HashMap<SocketAddr, ServiceRecord>,
    available: HashMap<SocketAddr, u16>,
}

impl PeerTracker {
    /// Both signals, once present
    fn complete(&self, peer: &SocketAddr) -> Option<(ServiceRecord, u16)> {
        let record = self.records.get(peer)?;
        let port = self.available.get(peer)?;
        Some((record.clone(), *port))
    }

    pub fn on_record(&mut self, peer: SocketAddr, record: ServiceRecord) -> Option<(ServiceRecord, u16)> {
        self.records.insert(peer, record);
        self.complete(&peer)
    }

    pub fn on_available(&mut self, peer: SocketAddr, port: u16) -> Option<(ServiceRecord, u16)> {
        self.available.insert(peer, port);
        self.complete(&peer)
    }

    pub fn is_available(&self, peer: &SocketAddr) -> bool {
        self.available.contains_key(peer)
    }

    /// Both signals are present for `peer`
    pub fn is_complete(&self, peer: &SocketAddr) -> bool {
        self.records.contains_key(peer) && self.available.contains_key(peer)
    }

    /// `peer` is complete and its latest record still carries `cookie`.
    pub fn offers(&self, peer: &SocketAddr, cookie: &str) -> bool {
        self.is_complete(peer)
            && self
                .records
                .get(peer)
                .map_or(false, |record| record.cookie == cookie)
    }

    pub fn forget(&mut self, peer: &SocketAddr) {
        self.records.remove(peer);
        self.available.remove(peer);
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.available.clear();
    }
}

/// Everything the browser task and the game loop share
#[derive(Debug)]
pub struct Discovery {
    tracker: PeerTracker,
    cache: HostCache,
    /// Applied to records announced without a timeout
    default_timeout: Duration,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new(Duration::from_secs(u64::from(DEFAULT_HOST_TIMEOUT_SECS)))
    }
}

impl Discovery {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            tracker: PeerTracker::default(),
            cache: HostCache::default(),
            default_timeout,
        }
    }

    /// Processes one datagram heard on the discovery port and returns the
    /// reply to send back, if any.
    pub fn on_datagram(&mut self, peer: SocketAddr, datagram: Datagram, now: Instant) -> Option<Datagram> {
        match datagram {
            Datagram::Announce(record) if record.is_candidate() => {
                let complete = self.tracker.on_record(peer, record);
                if let Some((record, port)) = complete {
                    self.promote(peer, record, port, now);
                    None
                } else if self.tracker.is_available(&peer) {
                    None
                } else {
                    Some(Datagram::Probe)
                }
            }
            Datagram::Announce(record) => {
                debug!("Ignoring {} record from {}", record.application, peer);
                None
            }
            Datagram::Available { port } => {
                if let Some((record, port)) = self.tracker.on_available(peer, port) {
                    self.promote(peer, record, port, now);
                }
                None
            }
            Datagram::Withdraw => {
                debug!("Peer {} withdrew", peer);
                self.tracker.forget(&peer);
                None
            }
            _ => None,
        }
    }

    fn promote(&mut self, peer: SocketAddr, record: ServiceRecord, service_port: u16, now: Instant) {
        let timeout = record.timeout_or(self.default_timeout);
        let host = record.to_host();
        let fresh = self.cache.insert(HostRecord {
            host,
            peer,
            service_port,
            discovered_at: now,
            timeout,
        });
        if fresh {
            info!("Found host {} at {}", record.nickname, peer);
        }
    }

    pub fn sweep(&mut self, now: Instant) {
        let tracker = &self.tracker;
        let evicted = self.cache.sweep(now, |record| {
            tracker.offers(&record.peer, record.host.connection_cookie())
        });
        for record in evicted {
            debug!("Dropping host {}", record.host.nickname());
            // a host that went quiet has to be discovered from scratch,
            // unless its peer already moved on to another session
            if self.tracker.offers(&record.peer, record.host.connection_cookie()) {
                self.tracker.forget(&record.peer);
            }
        }
    }

    pub fn hosts(&mut self, now: Instant) -> Vec<Host> {
        self.sweep(now);
        self.cache.hosts()
    }

    pub fn lookup(&self, cookie: &str) -> Option<HostRecord> {
        self.cache.get(cookie).cloned()
    }

    pub fn clear(&mut self) {
        self.tracker.clear();
        self.cache.clear();
    }
}

pub fn lock(discovery: &Mutex<Discovery>) -> MutexGuard<'_, Discovery> {
    discovery.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn encode(datagram: &Datagram) -> Result<Vec<u8>, NetError> {
    datagram
        .encode()
        .map_err(|e| NetError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Host side reply policy. `linked` remembers the one guest this host
/// accepted.
pub fn host_reply(
    cookie: &str,
    service_port: u16,
    linked: &mut Option<SocketAddr>,
    peer: SocketAddr,
    datagram: Datagram,
) -> Option<Datagram> {
    match datagram {
        Datagram::Probe if linked.is_none() => Some(Datagram::Available { port: service_port }),
        Datagram::LinkRequest { cookie: requested } => {
            if requested != cookie {
                return Some(Datagram::LinkRejected(LinkError::Unsupported));
            }
            match linked {
                None => {
                    *linked = Some(peer);
                    Some(Datagram::LinkAccepted)
                }
                // a retransmitted request from the accepted guest
                Some(accepted) if *accepted == peer => Some(Datagram::LinkAccepted),
                Some(_) => Some(Datagram::LinkRejected(LinkError::Busy)),
            }
        }
        _ => None,
    }
}

fn into_tokio(socket: std::net::UdpSocket) -> io::Result<UdpSocket> {
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket)
}

/// Listens on the discovery port until cancelled.
pub async fn browse(socket: std::net::UdpSocket, discovery: Arc<Mutex<Discovery>>) -> Result<(), NetError> {
    let socket = into_tokio(socket)?;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let datagram = match Datagram::decode(&buf[..len]) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("Undecodable datagram from {}: {}", peer, e);
                continue;
            }
        };

        let reply = lock(&discovery).on_datagram(peer, datagram, Instant::now());
        if let Some(reply) = reply {
            socket.send_to(&encode(&reply)?, peer).await?;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertiserEvent {
    /// The first announcement went out
    Announced,
    /// A guest was accepted; the host stops announcing
    Linked(SocketAddr),
}

pub struct Advertisement {
    pub record: ServiceRecord,
    pub service_port: u16,
    pub target: SocketAddr,
    pub interval: Duration,
}

/// Announces the host and answers guests until cancelled.
pub async fn advertise(
    socket: std::net::UdpSocket,
    ad: Advertisement,
    events: mpsc::UnboundedSender<AdvertiserEvent>,
) -> Result<(), NetError> {
    let socket = into_tokio(socket)?;
    let announce = encode(&Datagram::Announce(ad.record.clone()))?;
    let mut ticker = tokio::time::interval(ad.interval);
    let mut linked: Option<SocketAddr> = None;
    let mut announced = false;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = ticker.tick(), if linked.is_none() => {
                socket.send_to(&announce, ad.target).await?;
                if !announced {
                    announced = true;
                    let _ = events.send(AdvertiserEvent::Announced);
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = received?;
                let Ok(datagram) = Datagram::decode(&buf[..len]) else {
                    continue;
                };

                let was_linked = linked.is_some();
                let Some(reply) = host_reply(&ad.record.cookie, ad.service_port, &mut linked, peer, datagram) else {
                    continue;
                };
                socket.send_to(&encode(&reply)?, peer).await?;

                if !was_linked && linked.is_some() {
                    info!("Guest {} accepted", peer);
                    socket.send_to(&encode(&Datagram::Withdraw)?, ad.target).await?;
                    let _ = events.send(AdvertiserEvent::Linked(peer));
                }
            }
        }
    }
}

/// Asks a discovered host for the link, retransmitting on silence.
pub async fn request_link(
    socket: std::net::UdpSocket,
    peer: SocketAddr,
    cookie: String,
    io_timeout: Duration,
) -> Result<(), NetError> {
    let socket = into_tokio(socket)?;
    let request = encode(&Datagram::LinkRequest { cookie })?;
    let per_attempt = io_timeout / LINK_ATTEMPTS;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    for attempt in 1..=LINK_ATTEMPTS {
        socket.send_to(&request, peer).await?;
        let deadline = tokio::time::Instant::now() + per_attempt;

        loop {
            let Ok(received) = timeout_at(deadline, socket.recv_from(&mut buf)).await else {
                debug!("No link reply from {} (attempt {})", peer, attempt);
                break;
            };
            let (len, from) = received?;
            if from != peer {
                continue;
            }
            match Datagram::decode(&buf[..len]) {
                Ok(Datagram::LinkAccepted) => return Ok(()),
                Ok(Datagram::LinkRejected(reason)) => return Err(NetError::Link(reason)),
                _ => continue,
            }
        }
    }

    Err(NetError::Link(LinkError::Lost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Runtime;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], port))
    }

    fn record(cookie: &str, nickname: &str, timeout_secs: u32) -> ServiceRecord {
        ServiceRecord::new(cookie, nickname, timeout_secs, "LEVEL_1 arena.map")
    }

    #[test]
    fn test_host_needs_both_signals() {
        let mut discovery = Discovery::default();
        let now = Instant::now();

        let reply = discovery.on_datagram(peer(1), Datagram::Announce(record("c1", "alice", 30)), now);
        assert_eq!(reply, Some(Datagram::Probe));
        assert!(discovery.hosts(now).is_empty());

        discovery.on_datagram(peer(1), Datagram::Available { port: 7000 }, now);
        let hosts = discovery.hosts(now);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].nickname(), "alice");
        assert_eq!(hosts[0].data(), "LEVEL_1 arena.map");

        let found = discovery.lookup("c1").unwrap();
        assert_eq!(found.service_addr(), SocketAddr::from(([192, 168, 1, 20], 7000)));
    }

    #[test]
    fn test_signals_in_either_order() {
        let mut discovery = Discovery::default();
        let now = Instant::now();

        discovery.on_datagram(peer(2), Datagram::Available { port: 7001 }, now);
        assert!(discovery.hosts(now).is_empty());

        let reply = discovery.on_datagram(peer(2), Datagram::Announce(record("c2", "bob", 30)), now);
        assert_eq!(reply, None);
        assert_eq!(discovery.hosts(now).len(), 1);
    }

    #[test]
    fn test_signals_from_different_peers_do_not_pair() {
        let mut discovery = Discovery::default();
        let now = Instant::now();

        discovery.on_datagram(peer(3), Datagram::Announce(record("c3", "carol", 30)), now);
        discovery.on_datagram(peer(4), Datagram::Available { port: 7002 }, now);
        assert!(discovery.hosts(now).is_empty());
    }

    #[test]
    fn test_foreign_records_are_ignored() {
        let mut discovery = Discovery::default();
        let now = Instant::now();
        let mut foreign = record("c5", "mallory", 30);
        foreign.application = "other-game".to_string();

        assert_eq!(discovery.on_datagram(peer(5), Datagram::Announce(foreign), now), None);
        discovery.on_datagram(peer(5), Datagram::Available { port: 7003 }, now);
        assert!(discovery.hosts(now).is_empty());
    }

    #[test]
    fn test_stale_hosts_are_evicted() {
        let mut discovery = Discovery::default();
        let now = Instant::now();

        discovery.on_datagram(peer(6), Datagram::Announce(record("c6", "dave", 2)), now);
        discovery.on_datagram(peer(6), Datagram::Available { port: 7004 }, now);
        assert_eq!(discovery.hosts(now + Duration::from_secs(1)).len(), 1);

        assert!(discovery.hosts(now + Duration::from_secs(3)).is_empty());
        // rediscovery needs both signals again
        let reply = discovery.on_datagram(peer(6), Datagram::Announce(record("c6", "dave", 2)), now);
        assert_eq!(reply, Some(Datagram::Probe));
    }

    #[test]
    fn test_reannouncement_refreshes_host() {
        let mut discovery = Discovery::default();
        let start = Instant::now();

        discovery.on_datagram(peer(7), Datagram::Announce(record("c7", "erin", 2)), start);
        discovery.on_datagram(peer(7), Datagram::Available { port: 7005 }, start);

        let later = start + Duration::from_secs(2);
        discovery.on_datagram(peer(7), Datagram::Announce(record("c7", "erin", 2)), later);
        assert_eq!(discovery.hosts(start + Duration::from_secs(3)).len(), 1);
    }

    #[test]
    fn test_zero_timeout_uses_default() {
        let mut discovery = Discovery::default();
        let now = Instant::now();

        discovery.on_datagram(peer(8), Datagram::Announce(record("c8", "frank", 0)), now);
        discovery.on_datagram(peer(8), Datagram::Available { port: 7006 }, now);
        assert_eq!(discovery.hosts(now + Duration::from_secs(29)).len(), 1);
        assert!(discovery.hosts(now + Duration::from_secs(31)).is_empty());
    }

    #[test]
    fn test_configured_default_timeout() {
        let mut discovery = Discovery::new(Duration::from_secs(5));
        let now = Instant::now();

        discovery.on_datagram(peer(11), Datagram::Announce(record("c11", "ivan", 0)), now);
        discovery.on_datagram(peer(11), Datagram::Available { port: 7009 }, now);
        assert_eq!(discovery.hosts(now + Duration::from_secs(4)).len(), 1);
        assert!(discovery.hosts(now + Duration::from_secs(6)).is_empty());
    }

    #[test]
    fn test_new_session_from_same_peer_replaces_old() {
        let mut discovery = Discovery::default();
        let now = Instant::now();

        discovery.on_datagram(peer(12), Datagram::Announce(record("old", "judy", 30)), now);
        discovery.on_datagram(peer(12), Datagram::Available { port: 7010 }, now);
        discovery.on_datagram(peer(12), Datagram::Announce(record("new", "judy", 30)), now);

        let cookies: Vec<String> = discovery
            .hosts(now)
            .iter()
            .map(|host| host.connection_cookie().to_string())
            .collect();
        assert_eq!(cookies, vec!["new"]);
        assert!(discovery.lookup("old").is_none());

        // the replacement survives later sweeps
        assert_eq!(discovery.hosts(now + Duration::from_secs(1)).len(), 1);
        assert!(discovery.lookup("new").is_some());
    }

    #[test]
    fn test_withdrawn_peer_is_evicted() {
        let mut discovery = Discovery::default();
        let now = Instant::now();

        discovery.on_datagram(peer(9), Datagram::Announce(record("c9", "grace", 30)), now);
        discovery.on_datagram(peer(9), Datagram::Available { port: 7007 }, now);
        discovery.on_datagram(peer(9), Datagram::Withdraw, now);

        assert!(discovery.hosts(now).is_empty());
        assert!(discovery.lookup("c9").is_none());
    }

    #[test]
    fn test_late_announcement_after_withdraw_is_not_listed() {
        let mut discovery = Discovery::default();
        let now = Instant::now();

        discovery.on_datagram(peer(10), Datagram::Announce(record("c10", "heidi", 30)), now);
        discovery.on_datagram(peer(10), Datagram::Available { port: 7008 }, now);
        discovery.on_datagram(peer(10), Datagram::Withdraw, now);
        let reply = discovery.on_datagram(peer(10), Datagram::Announce(record("c10", "heidi", 30)), now);

        assert_eq!(reply, Some(Datagram::Probe));
        assert!(discovery.hosts(now).is_empty());
    }

    #[test]
    fn test_hosts_sorted_by_nickname() {
        let mut cache = HostCache::default();
        let now = Instant::now();
        for (i, name) in ["zed", "amy", "kim"].iter().enumerate() {
            cache.insert(HostRecord {
                host: Host::new(name, &format!("cookie{}", i), ""),
                peer: peer(100 + i as u16),
                service_port: 1,
                discovered_at: now,
                timeout: Duration::from_secs(30),
            });
        }

        let names: Vec<String> = cache.hosts().iter().map(|h| h.nickname().to_string()).collect();
        assert_eq!(names, vec!["amy", "kim", "zed"]);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_host_reply_policy() {
        let mut linked = None;

        assert_eq!(
            host_reply("c1", 7000, &mut linked, peer(1), Datagram::Probe),
            Some(Datagram::Available { port: 7000 })
        );
        assert_eq!(
            host_reply("c1", 7000, &mut linked, peer(1), Datagram::LinkRequest { cookie: "other".into() }),
            Some(Datagram::LinkRejected(LinkError::Unsupported))
        );
        assert_eq!(
            host_reply("c1", 7000, &mut linked, peer(1), Datagram::LinkRequest { cookie: "c1".into() }),
            Some(Datagram::LinkAccepted)
        );
        assert_eq!(linked, Some(peer(1)));

        assert_eq!(
            host_reply("c1", 7000, &mut linked, peer(1), Datagram::LinkRequest { cookie: "c1".into() }),
            Some(Datagram::LinkAccepted)
        );
        assert_eq!(
            host_reply("c1", 7000, &mut linked, peer(2), Datagram::LinkRequest { cookie: "c1".into() }),
            Some(Datagram::LinkRejected(LinkError::Busy))
        );
        assert_eq!(host_reply("c1", 7000, &mut linked, peer(2), Datagram::Probe), None);
    }

    #[test]
    fn test_link_request_rejected() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async {
            let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let host_addr = host.local_addr().unwrap();

            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                let (_, from) = host.recv_from(&mut buf).await.unwrap();
                let reply = encode(&Datagram::LinkRejected(LinkError::Busy)).unwrap();
                host.send_to(&reply, from).await.unwrap();
            });

            let guest = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let result = request_link(guest, host_addr, "c1".into(), Duration::from_secs(1)).await;
            assert!(matches!(result, Err(NetError::Link(LinkError::Busy))));
        });
    }

    #[test]
    fn test_link_request_to_silent_host_is_lost() {
        let runtime = Runtime::new().unwrap();
        runtime.block_on(async {
            let host = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let host_addr = host.local_addr().unwrap();

            let guest = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let result = request_link(guest, host_addr, "c1".into(), Duration::from_millis(150)).await;
            assert!(matches!(result, Err(NetError::Link(LinkError::Lost))));
            drop(host);
        });
    }
}
