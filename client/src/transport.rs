//! The pair of workers that moves game lines between a connected socket and
//! the game loop.
//!
//! The reader feeds the inbound queue and waits when it is full, so a slow
//! consumer stalls the socket rather than losing lines. The writer drains the
//! outbound queue. Each worker stops after passing on `CLOSE` or
//! `CONNECTION LOST`, and reports how it ended through its own status
//! channel; the queues are the only state the workers share.

use crate::queue::{bounded_queue, QueueReceiver, QueueSender};
use log::{debug, warn};
use shared::GameMessage;
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Time the writer gets to flush queued lines once the transport closes
const WRITER_LINGER: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Closed,
    Failed(String),
}

/// How a running transport ended, once the game loop should react to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEnd {
    Closed,
    Failed(String),
}

pub struct Transport {
    inbound: QueueReceiver,
    outbound: Option<QueueSender>,
    reader_status: watch::Receiver<ThreadStatus>,
    writer_status: watch::Receiver<ThreadStatus>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
    runtime: Handle,
    peer: Option<SocketAddr>,
}

impl Transport {
    /// Starts both workers on `stream`. `pending` holds bytes already read
    /// off the socket by the handshake; they are delivered first.
    pub fn start(runtime: &Handle, stream: TcpStream, pending: Vec<u8>, capacity: usize) -> Self {
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();

        let (inbound_tx, inbound) = bounded_queue(capacity);
        let (outbound, outbound_rx) = bounded_queue(capacity);
        let (reader_tx, reader_status) = watch::channel(ThreadStatus::Running);
        let (writer_tx, writer_status) = watch::channel(ThreadStatus::Running);

        let source = Cursor::new(pending).chain(read_half);
        let reader = runtime.spawn(run_inbound(source, inbound_tx, reader_tx));
        let writer = runtime.spawn(run_outbound(write_half, outbound_rx, writer_tx));

        debug!("Transport started with {:?}", peer);
        Self {
            inbound,
            outbound: Some(outbound),
            reader_status,
            writer_status,
            reader,
            writer: Some(writer),
            runtime: runtime.clone(),
            peer,
        }
    }

    /// Queues a line for the peer. False when the outbound queue is full or
    /// the transport is closed; the line is dropped.
    pub fn send(&self, line: &str) -> bool {
        match &self.outbound {
            Some(queue) => queue.try_put(line.to_string()),
            None => false,
        }
    }

    pub fn receive(&mut self) -> Option<String> {
        self.inbound.try_get()
    }

    pub fn inbound_status(&self) -> ThreadStatus {
        self.reader_status.borrow().clone()
    }

    pub fn outbound_status(&self) -> ThreadStatus {
        self.writer_status.borrow().clone()
    }

    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// None while the session is live. A clean close is only reported once
    /// the game loop has drained every received line.
    pub fn end(&self) -> Option<TransportEnd> {
        let reader = self.inbound_status();
        let writer = self.outbound_status();

        if let ThreadStatus::Failed(reason) = reader {
            return Some(TransportEnd::Failed(format!("receive failed: {}", reason)));
        }
        if let ThreadStatus::Failed(reason) = writer {
            return Some(TransportEnd::Failed(format!("send failed: {}", reason)));
        }

        let closed = reader == ThreadStatus::Closed || writer == ThreadStatus::Closed;
        if closed && self.inbound.is_empty() {
            Some(TransportEnd::Closed)
        } else {
            None
        }
    }

    /// Stops both workers. The reader stops at once; the writer may flush
    /// what is already queued for a short moment. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.reader.abort();
        self.inbound.close();

        // dropping the sender lets the writer finish once the queue is empty
        self.outbound.take();
        if let Some(mut writer) = self.writer.take() {
            self.runtime.spawn(async move {
                if timeout(WRITER_LINGER, &mut writer).await.is_err() {
                    warn!("Writer did not flush in time, aborting");
                    writer.abort();
                }
            });
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_inbound<R>(source: R, queue: QueueSender, status: watch::Sender<ThreadStatus>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(source).lines();

    let outcome = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end_matches('\r').to_string();
                let terminal = GameMessage::is_terminal(&line);

                if queue.put(line).await.is_err() {
                    break ThreadStatus::Closed;
                }
                if terminal {
                    debug!("Peer ended the session");
                    break ThreadStatus::Closed;
                }
            }
            Ok(None) => break ThreadStatus::Closed,
            Err(e) => break ThreadStatus::Failed(e.to_string()),
        }
    };

    status.send_replace(outcome);
}

async fn run_outbound<W>(mut sink: W, mut queue: QueueReceiver, status: watch::Sender<ThreadStatus>)
where
    W: AsyncWrite + Unpin,
{
    let outcome = loop {
        let Some(line) = queue.get().await else {
            break ThreadStatus::Closed;
        };
        let terminal = GameMessage::is_terminal(&line);

        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        if let Err(e) = sink.write_all(&bytes).await {
            break ThreadStatus::Failed(e.to_string());
        }
        if terminal {
            break ThreadStatus::Closed;
        }
    };

    let _ = sink.shutdown().await;
    status.send_replace(outcome);
}
