//! Background operations polled from the game loop.
//!
//! Every networking step runs as a task on the adapter's runtime. The game
//! loop never waits on one; it calls [`PendingOp::poll`] once per tick.
//! Cancelling drops the task's future, and with it every socket the future
//! owns.

use crate::error::NetError;
use std::future::Future;
use std::io;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::task::JoinHandle;

/// The runtime an adapter drives its background work on.
pub fn network_runtime(thread_name: &str) -> io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name(thread_name)
        .enable_all()
        .build()
}

#[derive(Debug)]
pub enum OpStatus<T> {
    Pending,
    Done(Result<T, NetError>),
    /// Aborted, or the task died before reporting
    Cancelled,
}

pub struct PendingOp<T> {
    name: &'static str,
    handle: JoinHandle<()>,
    result: oneshot::Receiver<Result<T, NetError>>,
}

impl<T: Send + 'static> PendingOp<T> {
    pub fn spawn<F>(runtime: &Handle, name: &'static str, future: F) -> Self
    where
        F: Future<Output = Result<T, NetError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = runtime.spawn(async move {
            let _ = tx.send(future.await);
        });

        Self {
            name,
            handle,
            result: rx,
        }
    }
}

impl<T> PendingOp<T> {
    /// Non-blocking. The outcome is handed out once; callers drop the op
    /// after seeing `Done`.
    pub fn poll(&mut self) -> OpStatus<T> {
        match self.result.try_recv() {
            Ok(result) => OpStatus::Done(result),
            Err(TryRecvError::Empty) => OpStatus::Pending,
            Err(TryRecvError::Closed) => OpStatus::Cancelled,
        }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Polls the op in `slot` and empties the slot once it has an outcome.
/// A cancelled op reports `NetError::Cancelled`.
pub fn poll_slot<T>(slot: &mut Option<PendingOp<T>>) -> Option<Result<T, NetError>> {
    let status = slot.as_mut()?.poll();
    match status {
        OpStatus::Pending => None,
        OpStatus::Done(result) => {
            *slot = None;
            Some(result)
        }
        OpStatus::Cancelled => {
            *slot = None;
            Some(Err(NetError::Cancelled))
        }
    }
}

impl<T> Drop for PendingOp<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tokio::runtime::Runtime;

    fn wait_done<T>(op: &mut PendingOp<T>) -> OpStatus<T> {
        for _ in 0..200 {
            match op.poll() {
                OpStatus::Pending => thread::sleep(Duration::from_millis(5)),
                other => return other,
            }
        }
        OpStatus::Pending
    }

    #[test]
    fn test_poll_reports_result() {
        let runtime = Runtime::new().unwrap();
        let mut op = PendingOp::spawn(runtime.handle(), "answer", async { Ok(42) });

        match wait_done(&mut op) {
            OpStatus::Done(Ok(value)) => assert_eq!(value, 42),
            other => panic!("Unexpected status {:?}", other),
        }
        assert_eq!(op.name(), "answer");
    }

    #[test]
    fn test_poll_reports_error() {
        let runtime = Runtime::new().unwrap();
        let mut op: PendingOp<()> =
            PendingOp::spawn(runtime.handle(), "fails", async { Err(NetError::Closed) });

        assert!(matches!(
            wait_done(&mut op),
            OpStatus::Done(Err(NetError::Closed))
        ));
    }

    #[test]
    fn test_pending_until_finished() {
        let runtime = Runtime::new().unwrap();
        let mut op = PendingOp::spawn(runtime.handle(), "slow", async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        });
        assert!(matches!(op.poll(), OpStatus::Pending));
        assert!(matches!(wait_done(&mut op), OpStatus::Done(Ok(()))));
    }

    #[test]
    fn test_poll_slot_empties_on_outcome() {
        let runtime = network_runtime("test-net").unwrap();
        let mut slot = Some(PendingOp::spawn(runtime.handle(), "quick", async { Ok("done") }));

        let mut outcome = None;
        for _ in 0..200 {
            outcome = poll_slot(&mut slot);
            if outcome.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(outcome, Some(Ok("done"))));
        assert!(slot.is_none());
        assert!(poll_slot(&mut slot).is_none());
    }

    #[test]
    fn test_cancel_drops_future() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let runtime = Runtime::new().unwrap();
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Flag(dropped.clone());

        let mut op: PendingOp<()> = PendingOp::spawn(runtime.handle(), "forever", async move {
            let _flag = flag;
            std::future::pending::<()>().await;
            Ok(())
        });
        op.cancel();

        assert!(matches!(wait_done(&mut op), OpStatus::Cancelled));
        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(dropped.load(Ordering::SeqCst));
    }
}
