//! Rendezvous server network layer: one task per TCP connection plus a
//! background sweeper for abandoned sessions

use crate::registry::{ReadyOutcome, SessionRegistry};
use log::{debug, error, info, warn};
use shared::{Request, Response};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

/// A matched socket waiting for, or about to be joined with, its partner.
///
/// `pending` holds bytes already buffered past the `READY` line.
#[derive(Debug)]
pub struct Link {
    stream: TcpStream,
    pending: Vec<u8>,
}

type Sessions = Arc<RwLock<SessionRegistry<Link>>>;

/// Longest silence tolerated between two commands on one connection
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// What the connection has become after its first successful commands
#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    Anonymous,
    Guest(String),
    MatchedHost(String),
}

/// Rendezvous server accepting hosts and guests on one TCP port
pub struct Server {
    listener: TcpListener,
    sessions: Sessions,
    sweep_interval: Duration,
    idle_timeout: Duration,
}

impl Server {
    pub async fn new(addr: &str, max_sessions: usize) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Rendezvous server listening on {}", listener.local_addr()?);

        Ok(Server {
            listener,
            sessions: Arc::new(RwLock::new(SessionRegistry::new(max_sessions))),
            sweep_interval: Duration::from_secs(1),
            idle_timeout: IDLE_TIMEOUT,
        })
    }

    /// Drops connections that stay silent longer than `idle_timeout`.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawns task that drops sessions whose host stopped polling
    fn spawn_timeout_checker(&self) {
        let sessions = Arc::clone(&self.sessions);
        let period = self.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut sessions = sessions.write().await;
                    sessions.check_timeouts()
                };

                if !timed_out.is_empty() {
                    debug!("Swept {} abandoned sessions", timed_out.len());
                }
            }
        });
    }

    /// Accept loop; runs until the listener fails
    pub async fn run(self) -> io::Result<()> {
        self.spawn_timeout_checker();

        info!("Server started successfully");

        loop {
            let (stream, addr) = self.listener.accept().await?;
            let sessions = Arc::clone(&self.sessions);
            let idle_timeout = self.idle_timeout;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, sessions, idle_timeout).await {
                    warn!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }
    }
}

async fn write_line(stream: &mut TcpStream, line: &str) -> io::Result<()> {
    stream.write_all(format!("{}\n", line).as_bytes()).await
}

/// Serves one connection until it closes, is paired, or is parked
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    sessions: Sessions,
    idle_timeout: Duration,
) -> io::Result<()> {
    debug!("Connection from {}", addr);

    let mut conn = BufReader::new(stream);
    let mut role = Role::Anonymous;
    let mut line = String::new();

    let result = loop {
        line.clear();
        match tokio::time::timeout(idle_timeout, conn.read_line(&mut line)).await {
            Ok(Ok(0)) => break Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => break Err(e),
            Err(_) => {
                debug!("Dropping idle connection from {}", addr);
                break Ok(());
            }
        }

        let Some(request) = Request::parse(&line) else {
            warn!("Unknown command from {}: {:?}", addr, line.trim());
            let reply = Response::Error("unknown command".to_string()).to_string();
            if let Err(e) = write_line(conn.get_mut(), &reply).await {
                break Err(e);
            }
            continue;
        };
        debug!("{} -> {}", addr, request);

        if request == Request::Ready {
            let cookie = match &role {
                Role::Guest(cookie) | Role::MatchedHost(cookie) => cookie.clone(),
                Role::Anonymous => {
                    let reply = Response::Error("not matched".to_string()).to_string();
                    if let Err(e) = write_line(conn.get_mut(), &reply).await {
                        break Err(e);
                    }
                    continue;
                }
            };

            let link = Link {
                pending: conn.buffer().to_vec(),
                stream: conn.into_inner(),
            };
            return finalize(&cookie, link, &sessions).await;
        }

        let replies = {
            let mut sessions = sessions.write().await;
            respond(request, &mut role, &mut sessions)
        };

        let mut written = Ok(());
        for reply in &replies {
            written = write_line(conn.get_mut(), reply).await;
            if written.is_err() {
                break;
            }
        }
        if let Err(e) = written {
            break Err(e);
        }
    };

    if let Role::Guest(cookie) = &role {
        sessions.write().await.detach_guest(cookie);
    }

    result
}

/// Answers every command except `READY` with zero or more lines
fn respond(request: Request, role: &mut Role, sessions: &mut SessionRegistry<Link>) -> Vec<String> {
    match request {
        Request::Register {
            nickname,
            timeout_ms,
            data,
        } => match sessions.register(&nickname, Duration::from_millis(timeout_ms), &data) {
            Some(cookie) => vec![Response::Ok(Some(cookie)).to_string()],
            None => vec![Response::Error("server full".to_string()).to_string()],
        },

        Request::List => {
            let mut block = vec![Response::ListBegin.to_string()];
            block.extend(sessions.list_waiting().iter().map(|host| host.to_entry()));
            block.push(Response::ListEnd.to_string());
            block
        }

        Request::Connect { cookie } => match sessions.attach_guest(&cookie) {
            Ok(()) => {
                *role = Role::Guest(cookie);
                vec![Response::Ok(None).to_string()]
            }
            Err(e) => vec![Response::Error(e.reason().to_string()).to_string()],
        },

        Request::Status {
            cookie: Some(cookie),
        } => match sessions.host_status(&cookie) {
            Some(true) => {
                *role = Role::MatchedHost(cookie);
                vec![Response::Matched.to_string()]
            }
            Some(false) => vec![Response::Waiting.to_string()],
            None => vec![Response::Error("unknown session".to_string()).to_string()],
        },

        Request::Status { cookie: None } => {
            let status = match role {
                Role::Guest(cookie) => sessions.guest_status(cookie),
                _ => None,
            };
            match status {
                Some(true) => vec![Response::Matched.to_string()],
                Some(false) => vec![Response::Waiting.to_string()],
                None => vec![Response::Error("unknown session".to_string()).to_string()],
            }
        }

        Request::Close { cookie } => {
            sessions.remove(&cookie);
            Vec::new()
        }

        Request::Ready => Vec::new(),
    }
}

/// Parks the first ready link; the second joins it and relays until either
/// side hangs up
async fn finalize(cookie: &str, link: Link, sessions: &Sessions) -> io::Result<()> {
    let outcome = sessions.write().await.ready(cookie, link);

    match outcome {
        Ok(ReadyOutcome::Parked) => {
            debug!("Session {} waiting for second READY", cookie);
            Ok(())
        }
        Ok(ReadyOutcome::Paired(parked, incoming)) => {
            let (mut first, mut second) = (parked.stream, incoming.stream);
            let ready = format!("{}\n", Response::GameReady);
            first.write_all(ready.as_bytes()).await?;
            second.write_all(ready.as_bytes()).await?;

            first.write_all(&incoming.pending).await?;
            second.write_all(&parked.pending).await?;

            info!("Session {} relaying", cookie);
            match tokio::io::copy_bidirectional(&mut first, &mut second).await {
                Ok((to_second, to_first)) => {
                    info!(
                        "Session {} ended ({} / {} bytes relayed)",
                        cookie, to_second, to_first
                    );
                }
                Err(e) => debug!("Session {} relay ended: {}", cookie, e),
            }
            Ok(())
        }
        Err(mut link) => {
            let reply = Response::Error("unknown session".to_string()).to_string();
            if let Err(e) = write_line(&mut link.stream, &reply).await {
                error!("Failed to reject READY for {}: {}", cookie, e);
            }
            Ok(())
        }
    }
}
