//! Matchmaking on the local network, without a server.
//!
//! Hosts advertise over UDP and accept the peer link on a TCP listener bound
//! up front. Guests browse the discovery port, request the link from the
//! host they picked, then dial it.

use crate::adapter::{AdapterState, NetworkAdapter};
use crate::config::LocalConfig;
use crate::discovery::{
    advertise, browse, encode, lock, request_link, Advertisement, AdvertiserEvent, Discovery,
};
use crate::error::NetError;
use crate::handshake::{ConnectionState, Handshake, LinkRole};
use crate::task::{network_runtime, poll_slot, PendingOp};
use crate::transport::{Transport, TransportEnd};
use log::{debug, info, warn};
use shared::{sanitize_token, Datagram, Host, ServiceRecord};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

/// Which end of the peer link this side takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    /// Advertises and accepts the link
    Host,
    /// Requests the link and dials it
    Guest,
}

pub struct LocalAdapter {
    config: LocalConfig,
    state: AdapterState,
    failure: Option<String>,
    side: Option<Side>,
    session_data: Option<String>,
    discovery: Arc<Mutex<Discovery>>,

    browse_op: Option<PendingOp<()>>,
    advertise_op: Option<PendingOp<()>>,
    advertiser_events: Option<mpsc::UnboundedReceiver<AdvertiserEvent>>,
    /// Copy of the advertiser socket, for the withdrawal on reset
    withdraw_socket: Option<UdpSocket>,
    listener: Option<TcpListener>,
    link_op: Option<PendingOp<()>>,
    link_target: Option<SocketAddr>,
    handshake: Option<Handshake>,
    transport: Option<Transport>,

    runtime: Runtime,
}

impl LocalAdapter {
    pub fn new(config: LocalConfig) -> io::Result<Self> {
        let discovery = Discovery::new(config.default_timeout);
        Ok(Self {
            config,
            state: AdapterState::Idle,
            failure: None,
            side: None,
            session_data: None,
            discovery: Arc::new(Mutex::new(discovery)),
            browse_op: None,
            advertise_op: None,
            advertiser_events: None,
            withdraw_socket: None,
            listener: None,
            link_op: None,
            link_target: None,
            handshake: None,
            transport: None,
            runtime: network_runtime("local-net")?,
        })
    }

    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    fn set_state(&mut self, next: AdapterState) {
        if self.state != next {
            info!("Local: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn release(&mut self) {
        self.browse_op = None;
        self.advertise_op = None;
        self.advertiser_events = None;
        self.withdraw_socket = None;
        self.listener = None;
        self.link_op = None;
        self.link_target = None;
        self.handshake = None;
        self.transport = None;
    }

    fn fail(&mut self, error: NetError) {
        if error.is_cancelled() {
            return;
        }
        self.fail_with(error.to_string());
    }

    fn fail_with(&mut self, reason: String) {
        warn!("Local session failed in {}: {}", self.state, reason);
        self.withdraw();
        self.release();
        self.failure = Some(reason);
        self.set_state(AdapterState::Failure);
    }

    fn unavailable(&mut self, e: io::Error) {
        self.fail(NetError::Unavailable(format!(
            "local network unavailable: {}",
            e
        )));
    }

    /// Tells browsing guests this host is gone, while it is still listed.
    fn withdraw(&self) {
        let advertising = matches!(
            self.state,
            AdapterState::Connecting | AdapterState::Waiting
        );
        let Some(socket) = self.withdraw_socket.as_ref() else {
            return;
        };
        if !advertising {
            return;
        }

        let sent = encode(&Datagram::Withdraw)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                socket
                    .send_to(&bytes, self.config.announce_target())
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = sent {
            debug!("Withdrawal not sent: {}", e);
        }
    }

    fn poll_browsing(&mut self) {
        if let Some(Err(e)) = poll_slot(&mut self.browse_op) {
            self.fail(e);
        }
    }

    fn poll_advertiser(&mut self) {
        if let Some(Err(e)) = poll_slot(&mut self.advertise_op) {
            return self.fail(e);
        }

        let events: Vec<AdvertiserEvent> = match self.advertiser_events.as_mut() {
            Some(events) => std::iter::from_fn(|| events.try_recv().ok()).collect(),
            None => Vec::new(),
        };

        for event in events {
            match event {
                AdvertiserEvent::Announced if self.state == AdapterState::Connecting => {
                    self.set_state(AdapterState::Waiting);
                }
                AdvertiserEvent::Announced => {}
                AdvertiserEvent::Linked(peer) => return self.accept_link(peer),
            }
        }
    }

    fn accept_link(&mut self, peer: SocketAddr) {
        let Some(listener) = self.listener.take() else {
            return self.fail_with("peer listener is gone".to_string());
        };
        info!("Guest {} linked, waiting for its connection", peer);
        self.handshake = Some(Handshake::open(
            self.runtime.handle(),
            LinkRole::Accept(listener),
            self.config.io_timeout,
            self.config.queue_capacity,
        ));
        self.set_state(AdapterState::Finalizing);
    }

    fn poll_link_request(&mut self) {
        let Some(result) = poll_slot(&mut self.link_op) else {
            return;
        };
        if let Err(e) = result {
            return self.fail(e);
        }

        let Some(target) = self.link_target else {
            return self.fail_with("host address is gone".to_string());
        };
        info!("Host accepted, dialing {}", target);
        self.handshake = Some(Handshake::open(
            self.runtime.handle(),
            LinkRole::Dial(target),
            self.config.io_timeout,
            self.config.queue_capacity,
        ));
        self.set_state(AdapterState::Finalizing);
    }

    fn poll_finalizing(&mut self) {
        // the advertiser keeps turning other guests away
        if let Some(Err(e)) = poll_slot(&mut self.advertise_op) {
            return self.fail(e);
        }

        let Some(handshake) = self.handshake.as_mut() else {
            return;
        };
        match handshake.poll().clone() {
            ConnectionState::Running => {}
            ConnectionState::Success => {
                self.transport = handshake.take_transport();
                self.handshake = None;
                self.set_state(AdapterState::Game);
            }
            ConnectionState::Failed(reason) => self.fail_with(reason),
        }
    }

    fn poll_game(&mut self) {
        match self.transport.as_ref().and_then(Transport::end) {
            None => {}
            Some(TransportEnd::Closed) => {
                info!("Session closed");
                self.reset();
            }
            Some(TransportEnd::Failed(reason)) => self.fail_with(reason),
        }
    }
}

impl NetworkAdapter for LocalAdapter {
    fn update_state(&mut self, _dt: f32) {
        match (self.state, self.side) {
            (AdapterState::Updating, _) => self.poll_browsing(),
            (AdapterState::Connecting, Some(Side::Host)) | (AdapterState::Waiting, Some(Side::Host)) => {
                self.poll_advertiser()
            }
            (AdapterState::Connecting, Some(Side::Guest)) => self.poll_link_request(),
            (AdapterState::Finalizing, _) => self.poll_finalizing(),
            (AdapterState::Game, _) => self.poll_game(),
            _ => {}
        }
    }

    fn update_hosts(&mut self) {
        if self.state != AdapterState::Idle {
            warn!("Host update ignored in {}", self.state);
            return;
        }

        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.discovery_port)) {
            Ok(socket) => socket,
            Err(e) => return self.unavailable(e),
        };

        lock(&self.discovery).clear();
        self.browse_op = Some(PendingOp::spawn(
            self.runtime.handle(),
            "browse",
            browse(socket, self.discovery.clone()),
        ));
        self.set_state(AdapterState::Updating);
    }

    fn stop_host_update(&mut self) {
        if self.state == AdapterState::Updating {
            self.browse_op = None;
            self.set_state(AdapterState::Idle);
        }
    }

    fn get_hosts(&mut self, out: &mut Vec<Host>) {
        out.clear();
        out.extend(lock(&self.discovery).hosts(Instant::now()));
    }

    fn register(&mut self, nickname: &str, timeout_secs: u32, data: &str) {
        self.reset();

        let bound = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).and_then(|socket| {
            socket.set_broadcast(true)?;
            let withdraw = socket.try_clone()?;
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
            Ok((socket, withdraw, listener))
        });
        let (socket, withdraw_socket, listener) = match bound {
            Ok(bound) => bound,
            Err(e) => return self.unavailable(e),
        };
        let service_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => return self.unavailable(e),
        };

        let cookie = format!("{:016x}", rand::random::<u64>());
        let record = ServiceRecord::new(
            &cookie,
            &sanitize_token(nickname),
            self.config.advertised_timeout(timeout_secs),
            data,
        );
        let ad = Advertisement {
            record,
            service_port,
            target: self.config.announce_target(),
            interval: self.config.announce_interval,
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!("Hosting session {} on port {}", cookie, service_port);
        self.side = Some(Side::Host);
        self.session_data = Some(data.to_string());
        self.listener = Some(listener);
        self.withdraw_socket = Some(withdraw_socket);
        self.advertiser_events = Some(events_rx);
        self.advertise_op = Some(PendingOp::spawn(
            self.runtime.handle(),
            "advertise",
            advertise(socket, ad, events_tx),
        ));
        self.set_state(AdapterState::Connecting);
    }

    fn connect(&mut self, host: &Host) {
        // the cache is cleared by the reset, so resolve the host first
        let found = lock(&self.discovery).lookup(host.connection_cookie());
        self.reset();

        let Some(found) = found else {
            return self.fail_with(format!("host {} is no longer available", host.nickname()));
        };
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
            Ok(socket) => socket,
            Err(e) => return self.unavailable(e),
        };

        self.side = Some(Side::Guest);
        self.session_data = Some(host.data().to_string());
        self.link_target = Some(found.service_addr());
        self.link_op = Some(PendingOp::spawn(
            self.runtime.handle(),
            "link",
            request_link(
                socket,
                found.peer,
                host.connection_cookie().to_string(),
                self.config.io_timeout,
            ),
        ));
        self.set_state(AdapterState::Connecting);
    }

    fn reset(&mut self) {
        self.withdraw();
        self.release();
        lock(&self.discovery).clear();
        self.side = None;
        self.session_data = None;
        self.failure = None;
        self.set_state(AdapterState::Idle);
    }

    fn send(&mut self, line: &str) -> bool {
        if self.state != AdapterState::Game {
            debug!("Send ignored in {}", self.state);
            return false;
        }
        self.transport
            .as_ref()
            .map_or(false, |transport| transport.send(line))
    }

    fn receive(&mut self) -> Option<String> {
        self.transport.as_mut()?.receive()
    }

    fn state(&self) -> AdapterState {
        self.state
    }

    fn data(&self) -> Option<&str> {
        self.session_data.as_deref()
    }

    fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_to_unknown_host_fails() {
        let mut adapter = LocalAdapter::new(LocalConfig::default()).unwrap();
        adapter.connect(&Host::new("ghost", "0000", ""));

        assert_eq!(adapter.state(), AdapterState::Failure);
        assert!(adapter.failure_reason().unwrap().contains("no longer available"));

        adapter.reset();
        assert_eq!(adapter.state(), AdapterState::Idle);
        assert_eq!(adapter.failure_reason(), None);
    }

    #[test]
    fn test_discovery_port_in_use_fails() {
        let taken = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let config = LocalConfig {
            discovery_port: taken.local_addr().unwrap().port(),
            ..LocalConfig::default()
        };
        let mut adapter = LocalAdapter::new(config).unwrap();

        adapter.update_hosts();
        assert_eq!(adapter.state(), AdapterState::Failure);
        assert!(adapter
            .failure_reason()
            .unwrap()
            .starts_with("local network unavailable"));
    }

    #[test]
    fn test_register_moves_to_connecting() {
        let config = LocalConfig {
            announce_addr: Ipv4Addr::LOCALHOST.into(),
            discovery_port: 9,
            ..LocalConfig::default()
        };
        let mut adapter = LocalAdapter::new(config).unwrap();

        adapter.register("alice", 30, "LEVEL_1 arena.map");
        assert_eq!(adapter.state(), AdapterState::Connecting);
        assert_eq!(adapter.data(), Some("LEVEL_1 arena.map"));
        assert!(!adapter.send("PLAYER_SHOT"));

        adapter.reset();
        adapter.reset();
        assert_eq!(adapter.state(), AdapterState::Idle);
        assert_eq!(adapter.data(), None);
    }
}
