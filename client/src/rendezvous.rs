//! Matchmaking through the rendezvous server.
//!
//! Host: `REGISTER`, then a fresh `STATUS <cookie>` connection per poll until
//! the server answers `MATCHED`. Guest: `CONNECT` on a connection it keeps,
//! then `STATUS` on that same connection. Both finish with `READY` on the
//! connection that saw `MATCHED`; after `GAME_READY` the server relays it to
//! the peer and the handshake runs over it.
//!
//! A connection is dropped after any reply other than the expected ones.

use crate::adapter::{AdapterState, NetworkAdapter};
use crate::config::{RendezvousConfig, ServerAddr};
use crate::error::NetError;
use crate::handshake::{ConnectionState, Handshake};
use crate::task::{network_runtime, poll_slot, PendingOp};
use crate::transport::{Transport, TransportEnd};
use crate::wire::LineStream;
use log::{debug, info, warn};
use shared::{sanitize_token, Host, Request, Response};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::runtime::Runtime;

pub enum StatusReply {
    /// Guests get their connection back for the next poll
    Waiting(Option<LineStream>),
    Matched(LineStream),
}

/// Refuses a request that would not travel as one line.
fn one_line(request: Request) -> Result<Request, NetError> {
    if request.is_single_line() {
        Ok(request)
    } else {
        Err(NetError::InvalidRequest("fields must not contain line breaks"))
    }
}

async fn exchange(
    link: &mut LineStream,
    request: &Request,
    waiting_for: &'static str,
) -> Result<Response, NetError> {
    link.write_line(&request.to_string()).await?;
    let line = link.read_line(waiting_for).await?;
    match Response::parse(&line) {
        Some(Response::Error(reason)) => Err(NetError::Refused(reason)),
        Some(response) => Ok(response),
        None => Err(NetError::UnexpectedResponse(line)),
    }
}

pub async fn list_hosts(server: SocketAddr, io_timeout: Duration) -> Result<Vec<Host>, NetError> {
    let mut link = LineStream::connect(server, io_timeout).await?;
    match exchange(&mut link, &Request::List, "host list").await? {
        Response::ListBegin => {}
        other => return Err(NetError::UnexpectedResponse(other.to_string())),
    }

    let mut hosts = Vec::new();
    loop {
        let line = link.read_line("host list").await?;
        if Response::parse(&line) == Some(Response::ListEnd) {
            break;
        }
        match Host::parse_entry(&line) {
            Some(host) => hosts.push(host),
            None => debug!("Skipping malformed host entry {:?}", line),
        }
    }
    Ok(hosts)
}

/// Returns the session cookie.
pub async fn register_session(
    server: SocketAddr,
    io_timeout: Duration,
    nickname: &str,
    timeout_ms: u64,
    data: &str,
) -> Result<String, NetError> {
    let request = one_line(Request::Register {
        nickname: sanitize_token(nickname),
        timeout_ms,
        data: data.to_string(),
    })?;
    let mut link = LineStream::connect(server, io_timeout).await?;

    match exchange(&mut link, &request, "registration").await? {
        Response::Ok(Some(cookie)) => Ok(cookie),
        other => Err(NetError::UnexpectedResponse(other.to_string())),
    }
}

/// Attaches to a session and returns the connection the guest keeps.
pub async fn join_session(
    server: SocketAddr,
    io_timeout: Duration,
    cookie: &str,
) -> Result<LineStream, NetError> {
    let request = one_line(Request::Connect {
        cookie: cookie.to_string(),
    })?;
    let mut link = LineStream::connect(server, io_timeout).await?;

    match exchange(&mut link, &request, "join reply").await? {
        Response::Ok(None) => Ok(link),
        other => Err(NetError::UnexpectedResponse(other.to_string())),
    }
}

pub async fn host_status(
    server: SocketAddr,
    io_timeout: Duration,
    cookie: &str,
) -> Result<StatusReply, NetError> {
    let request = one_line(Request::Status {
        cookie: Some(cookie.to_string()),
    })?;
    let mut link = LineStream::connect(server, io_timeout).await?;

    match exchange(&mut link, &request, "session status").await? {
        Response::Waiting => Ok(StatusReply::Waiting(None)),
        Response::Matched => Ok(StatusReply::Matched(link)),
        other => Err(NetError::UnexpectedResponse(other.to_string())),
    }
}

pub async fn guest_status(mut link: LineStream) -> Result<StatusReply, NetError> {
    match exchange(&mut link, &Request::Status { cookie: None }, "session status").await? {
        Response::Waiting => Ok(StatusReply::Waiting(Some(link))),
        Response::Matched => Ok(StatusReply::Matched(link)),
        other => Err(NetError::UnexpectedResponse(other.to_string())),
    }
}

/// Announces readiness and waits for the partner. The returned connection
/// now leads to the peer.
pub async fn finalize(mut link: LineStream) -> Result<LineStream, NetError> {
    match exchange(&mut link, &Request::Ready, "partner readiness").await? {
        Response::GameReady => Ok(link),
        other => Err(NetError::UnexpectedResponse(other.to_string())),
    }
}

pub async fn close_session(
    server: SocketAddr,
    io_timeout: Duration,
    cookie: &str,
) -> Result<(), NetError> {
    let request = one_line(Request::Close {
        cookie: cookie.to_string(),
    })?;
    let mut link = LineStream::connect(server, io_timeout).await?;
    link.write_line(&request.to_string()).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    Host { cookie: Option<String> },
    Guest,
}

pub struct RendezvousAdapter {
    config: RendezvousConfig,
    state: AdapterState,
    failure: Option<String>,
    server: ServerAddr,
    role: Option<Role>,
    session_data: Option<String>,
    hosts: Vec<Host>,
    since_poll: f32,

    list_op: Option<PendingOp<Vec<Host>>>,
    register_op: Option<PendingOp<String>>,
    join_op: Option<PendingOp<LineStream>>,
    status_op: Option<PendingOp<StatusReply>>,
    finalize_op: Option<PendingOp<LineStream>>,
    handshake: Option<Handshake>,
    guest_link: Option<LineStream>,
    transport: Option<Transport>,

    // dropped last so every task above is cancelled first
    runtime: Runtime,
}

impl RendezvousAdapter {
    pub fn new(config: RendezvousConfig) -> io::Result<Self> {
        let server = config.server_addr();
        Ok(Self {
            config,
            state: AdapterState::Idle,
            failure: None,
            server,
            role: None,
            session_data: None,
            hosts: Vec::new(),
            since_poll: 0.0,
            list_op: None,
            register_op: None,
            join_op: None,
            status_op: None,
            finalize_op: None,
            handshake: None,
            guest_link: None,
            transport: None,
            runtime: network_runtime("rendezvous-net")?,
        })
    }

    pub fn config(&self) -> &RendezvousConfig {
        &self.config
    }

    fn set_state(&mut self, next: AdapterState) {
        if self.state != next {
            info!("Rendezvous: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Cancels every operation and drops every connection.
    fn release(&mut self) {
        self.list_op = None;
        self.register_op = None;
        self.join_op = None;
        self.status_op = None;
        self.finalize_op = None;
        self.handshake = None;
        self.guest_link = None;
        self.transport = None;
    }

    fn fail(&mut self, error: NetError) {
        if error.is_cancelled() {
            return;
        }
        self.fail_with(error.to_string());
    }

    fn fail_with(&mut self, reason: String) {
        warn!("Rendezvous failed in {}: {}", self.state, reason);
        self.release();
        self.failure = Some(reason);
        self.set_state(AdapterState::Failure);
    }

    fn poll_interval_elapsed(&self) -> bool {
        self.since_poll >= self.config.status_interval.as_secs_f32()
    }

    fn spawn_listing(&mut self) {
        let server = self.server.clone();
        let io_timeout = self.config.io_timeout;
        self.list_op = Some(PendingOp::spawn(
            self.runtime.handle(),
            "list",
            async move { list_hosts(server.resolve(io_timeout).await?, io_timeout).await },
        ));
    }

    fn poll_listing(&mut self) {
        if let Some(result) = poll_slot(&mut self.list_op) {
            match result {
                Ok(hosts) => {
                    debug!("{} joinable hosts", hosts.len());
                    self.hosts = hosts;
                    self.since_poll = 0.0;
                }
                Err(e) => return self.fail(e),
            }
        }

        if self.list_op.is_none() && self.poll_interval_elapsed() {
            self.spawn_listing();
        }
    }

    fn poll_connecting(&mut self) {
        if let Some(result) = poll_slot(&mut self.register_op) {
            match result {
                Ok(cookie) => {
                    info!("Registered session {}", cookie);
                    self.role = Some(Role::Host {
                        cookie: Some(cookie),
                    });
                    self.since_poll = 0.0;
                    self.set_state(AdapterState::Waiting);
                }
                Err(e) => self.fail(e),
            }
            return;
        }

        if let Some(result) = poll_slot(&mut self.join_op) {
            match result {
                Ok(link) => {
                    self.guest_link = Some(link);
                    self.since_poll = 0.0;
                    self.set_state(AdapterState::Waiting);
                }
                Err(e) => self.fail(e),
            }
        }
    }

    fn poll_waiting(&mut self) {
        if let Some(result) = poll_slot(&mut self.status_op) {
            match result {
                Ok(StatusReply::Waiting(link)) => {
                    self.guest_link = link;
                    self.since_poll = 0.0;
                }
                Ok(StatusReply::Matched(link)) => {
                    info!("Matched with a peer");
                    self.set_state(AdapterState::Finalizing);
                    self.finalize_op = Some(PendingOp::spawn(
                        self.runtime.handle(),
                        "finalize",
                        finalize(link),
                    ));
                }
                Err(e) => self.fail(e),
            }
            return;
        }

        // one status check at a time, spaced by the poll interval
        if self.status_op.is_some() || !self.poll_interval_elapsed() {
            return;
        }

        let op = match self.role.clone() {
            Some(Role::Host { cookie: Some(cookie) }) => {
                let server = self.server.clone();
                let io_timeout = self.config.io_timeout;
                PendingOp::spawn(self.runtime.handle(), "status", async move {
                    host_status(server.resolve(io_timeout).await?, io_timeout, &cookie).await
                })
            }
            Some(Role::Guest) => match self.guest_link.take() {
                Some(link) => PendingOp::spawn(self.runtime.handle(), "status", guest_status(link)),
                None => return self.fail_with("connection to server lost".to_string()),
            },
            _ => return self.fail_with("no session to poll".to_string()),
        };
        self.status_op = Some(op);
    }

    fn poll_finalizing(&mut self) {
        if let Some(result) = poll_slot(&mut self.finalize_op) {
            match result {
                Ok(link) => {
                    self.handshake = Some(Handshake::over(
                        self.runtime.handle(),
                        link,
                        self.config.queue_capacity,
                    ));
                }
                Err(e) => return self.fail(e),
            }
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

    /// Tells the server to drop a session nobody joined yet.
    fn withdraw_session(&self) {
        let Some(Role::Host { cookie: Some(cookie) }) = &self.role else {
            return;
        };
        if self.state != AdapterState::Waiting {
            return;
        }

        let cookie = cookie.clone();
        let server = self.server.clone();
        let io_timeout = self.config.io_timeout;
        self.runtime.spawn(async move {
            let closed = match server.resolve(io_timeout).await {
                Ok(addr) => close_session(addr, io_timeout, &cookie).await,
                Err(e) => Err(e),
            };
            if let Err(e) = closed {
                debug!("Close of session {} not delivered: {}", cookie, e);
            }
        });
    }
}

impl NetworkAdapter for RendezvousAdapter {
    fn update_state(&mut self, dt: f32) {
        self.since_poll += dt.max(0.0);

        match self.state {
            AdapterState::Updating => self.poll_listing(),
            AdapterState::Connecting => self.poll_connecting(),
            AdapterState::Waiting => self.poll_waiting(),
            AdapterState::Finalizing => self.poll_finalizing(),
            AdapterState::Game => self.poll_game(),
            AdapterState::Idle | AdapterState::Failure => {}
        }
    }

    fn update_hosts(&mut self) {
        if self.state != AdapterState::Idle {
            warn!("Host update ignored in {}", self.state);
            return;
        }
        self.hosts.clear();
        self.since_poll = 0.0;
        self.spawn_listing();
        self.set_state(AdapterState::Updating);
    }

    fn stop_host_update(&mut self) {
        if self.state == AdapterState::Updating {
            self.list_op = None;
            self.set_state(AdapterState::Idle);
        }
    }

    fn get_hosts(&mut self, out: &mut Vec<Host>) {
        out.clear();
        out.extend(self.hosts.iter().cloned());
    }

    fn register(&mut self, nickname: &str, timeout_secs: u32, data: &str) {
        self.reset();
        if let Err(e) = one_line(Request::Register {
            nickname: sanitize_token(nickname),
            timeout_ms: 0,
            data: data.to_string(),
        }) {
            return self.fail(e);
        }

        self.role = Some(Role::Host { cookie: None });
        self.session_data = Some(data.to_string());

        let server = self.server.clone();
        let io_timeout = self.config.io_timeout;
        let nickname = nickname.to_string();
        let data = data.to_string();
        let timeout_ms = u64::from(timeout_secs) * 1000;
        self.register_op = Some(PendingOp::spawn(
            self.runtime.handle(),
            "register",
            async move {
                let addr = server.resolve(io_timeout).await?;
                register_session(addr, io_timeout, &nickname, timeout_ms, &data).await
            },
        ));
        self.set_state(AdapterState::Connecting);
    }

    fn connect(&mut self, host: &Host) {
        self.reset();

        self.role = Some(Role::Guest);
        self.session_data = Some(host.data().to_string());

        let server = self.server.clone();
        let io_timeout = self.config.io_timeout;
        let cookie = host.connection_cookie().to_string();
        self.join_op = Some(PendingOp::spawn(
            self.runtime.handle(),
            "connect",
            async move { join_session(server.resolve(io_timeout).await?, io_timeout, &cookie).await },
        ));
        self.set_state(AdapterState::Connecting);
    }

    fn reset(&mut self) {
        self.withdraw_session();
        self.release();
        self.hosts.clear();
        self.role = None;
        self.session_data = None;
        self.failure = None;
        self.since_poll = 0.0;
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
