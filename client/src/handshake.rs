//! Token exchange that turns a raw peer socket into a running transport.
//!
//! Both sides write the token first and then expect the same token back, so
//! neither side needs to know who speaks first. On success the transport
//! workers are started with any bytes the peer sent right after its token.

use crate::error::NetError;
use crate::task::{OpStatus, PendingOp};
use crate::transport::Transport;
use crate::wire::LineStream;
use log::{debug, info, warn};
use shared::HANDSHAKE_TOKEN;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Running,
    Success,
    Failed(String),
}

/// Which end of a direct peer link this side is
#[derive(Debug)]
pub enum LinkRole {
    /// Waits on a listener bound before the peer was told about it
    Accept(std::net::TcpListener),
    Dial(SocketAddr),
}

/// Opens the direct link for `role`, then runs the handshake over it.
pub async fn establish(
    role: LinkRole,
    io_timeout: Duration,
    capacity: usize,
) -> Result<Transport, NetError> {
    let stream = match role {
        LinkRole::Accept(listener) => {
            listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(listener)?;
            let (stream, peer) = timeout(io_timeout, listener.accept())
                .await
                .map_err(|_| NetError::Timeout("peer to connect"))??;
            debug!("Accepted peer link from {}", peer);
            stream
        }
        LinkRole::Dial(addr) => {
            let stream = timeout(io_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| NetError::Timeout("peer connection"))??;
            debug!("Dialed peer link to {}", addr);
            stream
        }
    };
    stream.set_nodelay(true)?;

    handshake(LineStream::new(stream, io_timeout), capacity).await
}

/// Exchanges the token over an open link and starts the transport.
pub async fn handshake(mut link: LineStream, capacity: usize) -> Result<Transport, NetError> {
    link.write_line(HANDSHAKE_TOKEN).await?;
    let reply = link.read_line("handshake token").await?;
    if reply != HANDSHAKE_TOKEN {
        return Err(NetError::UnexpectedResponse(reply));
    }

    let (stream, pending) = link.into_parts();
    Ok(Transport::start(&Handle::current(), stream, pending, capacity))
}

/// A handshake running in the background, observed from the game loop
pub struct Handshake {
    op: Option<PendingOp<Transport>>,
    state: ConnectionState,
    transport: Option<Transport>,
}

impl Handshake {
    pub fn open(runtime: &Handle, role: LinkRole, io_timeout: Duration, capacity: usize) -> Self {
        Self::from_op(PendingOp::spawn(
            runtime,
            "handshake",
            establish(role, io_timeout, capacity),
        ))
    }

    pub fn over(runtime: &Handle, link: LineStream, capacity: usize) -> Self {
        Self::from_op(PendingOp::spawn(
            runtime,
            "handshake",
            handshake(link, capacity),
        ))
    }

    fn from_op(op: PendingOp<Transport>) -> Self {
        Self {
            op: Some(op),
            state: ConnectionState::Running,
            transport: None,
        }
    }

    pub fn poll(&mut self) -> &ConnectionState {
        if let Some(op) = self.op.as_mut() {
            match op.poll() {
                OpStatus::Pending => {}
                OpStatus::Done(Ok(transport)) => {
                    info!("Handshake complete");
                    self.transport = Some(transport);
                    self.state = ConnectionState::Success;
                    self.op = None;
                }
                OpStatus::Done(Err(e)) => {
                    warn!("Handshake failed: {}", e);
                    self.state = ConnectionState::Failed(e.to_string());
                    self.op = None;
                }
                OpStatus::Cancelled => {
                    self.state = ConnectionState::Failed(NetError::Cancelled.to_string());
                    self.op = None;
                }
            }
        }
        &self.state
    }

    /// The transport, once; only after the state reached `Success`.
    pub fn take_transport(&mut self) -> Option<Transport> {
        self.transport.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::runtime::Runtime;

    fn settle(handshake: &mut Handshake) -> ConnectionState {
        for _ in 0..400 {
            let state = handshake.poll().clone();
            if state != ConnectionState::Running {
                return state;
            }
            thread::sleep(Duration::from_millis(5));
        }
        ConnectionState::Running
    }

    fn bound_listener() -> (std::net::TcpListener, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[test]
    fn test_matching_tokens_start_transport() {
        let runtime = Runtime::new().unwrap();
        let (listener, addr) = bound_listener();
        let timeout = Duration::from_secs(2);

        let mut host = Handshake::open(runtime.handle(), LinkRole::Accept(listener), timeout, 8);
        let mut guest = Handshake::open(runtime.handle(), LinkRole::Dial(addr), timeout, 8);

        assert_eq!(settle(&mut host), ConnectionState::Success);
        assert_eq!(settle(&mut guest), ConnectionState::Success);

        let host_transport = host.take_transport().unwrap();
        let mut guest_transport = guest.take_transport().unwrap();
        assert!(host.take_transport().is_none());

        assert!(host_transport.send("PLAYER_SHOT"));
        let mut line = None;
        for _ in 0..200 {
            line = guest_transport.receive();
            if line.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(line.as_deref(), Some("PLAYER_SHOT"));
    }

    #[test]
    fn test_wrong_token_fails() {
        let runtime = Runtime::new().unwrap();
        let (listener, addr) = bound_listener();

        runtime.spawn(async move {
            let listener = TcpListener::from_std({
                listener.set_nonblocking(true).unwrap();
                listener
            })
            .unwrap();
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"SOMETHING_ELSE\n").await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            while let Ok(Some(_)) = lines.next_line().await {}
        });

        let mut guest = Handshake::open(
            runtime.handle(),
            LinkRole::Dial(addr),
            Duration::from_secs(2),
            8,
        );
        match settle(&mut guest) {
            ConnectionState::Failed(reason) => assert!(reason.contains("unexpected response")),
            other => panic!("Unexpected state {:?}", other),
        }
        assert!(guest.take_transport().is_none());
    }

    #[test]
    fn test_silent_peer_times_out() {
        let runtime = Runtime::new().unwrap();
        let (listener, addr) = bound_listener();

        let mut guest = Handshake::open(
            runtime.handle(),
            LinkRole::Dial(addr),
            Duration::from_millis(100),
            8,
        );
        match settle(&mut guest) {
            ConnectionState::Failed(reason) => assert!(reason.contains("timeout")),
            other => panic!("Unexpected state {:?}", other),
        }
        drop(listener);
    }

    #[test]
    fn test_nobody_dials_times_out() {
        let runtime = Runtime::new().unwrap();
        let (listener, _addr) = bound_listener();

        let mut host = Handshake::open(
            runtime.handle(),
            LinkRole::Accept(listener),
            Duration::from_millis(100),
            8,
        );
        match settle(&mut host) {
            ConnectionState::Failed(reason) => assert!(reason.contains("timeout")),
            other => panic!("Unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_refused_dial_is_io_error() {
        let runtime = Runtime::new().unwrap();
        let (listener, addr) = bound_listener();
        drop(listener);

        let mut guest = Handshake::open(
            runtime.handle(),
            LinkRole::Dial(addr),
            Duration::from_secs(1),
            8,
        );
        match settle(&mut guest) {
            ConnectionState::Failed(reason) => assert!(reason.starts_with("I/O error")),
            other => panic!("Unexpected state {:?}", other),
        }
    }
}
