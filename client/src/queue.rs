//! Bounded FIFO of text lines shared by exactly one producer and one
//! consumer.
//!
//! `put` waits while the queue is full, which is how the reader applies
//! backpressure to the socket. `try_put` never waits; the game loop uses it
//! so a congested link drops outbound messages instead of stalling a frame.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Creates a queue holding at most `capacity` lines.
pub fn bounded_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let len = Arc::new(AtomicUsize::new(0));

    (
        QueueSender {
            tx,
            len: len.clone(),
            capacity,
        },
        QueueReceiver { rx, len, capacity },
    )
}

/// The consumer side went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueClosed(pub String);

pub struct QueueSender {
    tx: mpsc::Sender<String>,
    len: Arc<AtomicUsize>,
    capacity: usize,
}

impl QueueSender {
    /// Appends a line, waiting for space when full.
    pub async fn put(&self, line: String) -> Result<(), QueueClosed> {
        let permit = self.tx.reserve().await.map_err(|_| QueueClosed(line.clone()))?;
        self.len.fetch_add(1, Ordering::AcqRel);
        permit.send(line);
        Ok(())
    }

    /// Appends a line if there is room. Returns false when full or closed.
    pub fn try_put(&self, line: String) -> bool {
        match self.tx.try_reserve() {
            Ok(permit) => {
                self.len.fetch_add(1, Ordering::AcqRel);
                permit.send(line);
                true
            }
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct QueueReceiver {
    rx: mpsc::Receiver<String>,
    len: Arc<AtomicUsize>,
    capacity: usize,
}

impl QueueReceiver {
    /// Waits for the next line. None once the sender is gone and the queue
    /// is drained.
    pub async fn get(&mut self) -> Option<String> {
        let line = self.rx.recv().await?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(line)
    }

    /// Takes the oldest line without waiting.
    pub fn try_get(&mut self) -> Option<String> {
        match self.rx.try_recv() {
            Ok(line) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                Some(line)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Rejects further puts; lines already queued stay readable.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
