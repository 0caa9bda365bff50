//! Bounded shutdown of background work
//!
//! [`CancellableTask`] ties a spawned task to a cancellation signal. Stopping
//! it signals cancellation, waits a bounded time for the task to finish, and
//! then returns regardless, so a stuck task cannot hang the caller.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Cancellation side handed to the task body
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Check whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested
    ///
    /// Also resolves when the owning [`CancellableTask`] is dropped.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// How a bounded join ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The task finished within the bound
    Joined,
    /// The task panicked
    Panicked(String),
    /// The bound elapsed; the task was aborted at its next await point
    TimedOut,
}

impl JoinOutcome {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, JoinOutcome::TimedOut)
    }
}

/// A spawned task plus its cancellation signal
#[derive(Debug)]
pub struct CancellableTask {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CancellableTask {
    /// Spawn `body` on the current runtime
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancelSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, rx) = watch::channel(false);
        let task = tokio::spawn(body(CancelSignal { rx }));
        Self { cancel, task }
    }

    /// Request cancellation without waiting
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Check whether the task has already finished
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal cancellation, then wait at most `timeout` for the task
    pub async fn cancel_and_join(self, timeout: Duration) -> JoinOutcome {
        self.cancel();

        let abort = self.task.abort_handle();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => JoinOutcome::Joined,
            Ok(Err(e)) if e.is_panic() => JoinOutcome::Panicked(e.to_string()),
            Ok(Err(_)) => JoinOutcome::Joined,
            Err(_) => {
                abort.abort();
                JoinOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cooperative_task_joins() {
        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();

        let task = CancellableTask::spawn(|mut cancel| async move {
            cancel.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        let outcome = task.cancel_and_join(Duration::from_secs(1)).await;
        assert_eq!(outcome, JoinOutcome::Joined);
        assert!(exited.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_times_out() {
        let task = CancellableTask::spawn(|_cancel| async move {
            // Ignores cancellation entirely
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let outcome = task.cancel_and_join(Duration::from_secs(5)).await;
        assert!(outcome.is_timed_out());
    }

    #[tokio::test]
    async fn test_panicking_task() {
        let task = CancellableTask::spawn(|_cancel| async move {
            panic!("engine poller blew up");
        });

        tokio::task::yield_now().await;
        let outcome = task.cancel_and_join(Duration::from_secs(1)).await;
        assert!(matches!(outcome, JoinOutcome::Panicked(_)));
    }

    #[tokio::test]
    async fn test_finished_task_joins_immediately() {
        let task = CancellableTask::spawn(|_cancel| async move {});
        while !task.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            task.cancel_and_join(Duration::from_millis(10)).await,
            JoinOutcome::Joined
        );
    }

    #[tokio::test]
    async fn test_signal_reflects_cancel() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let task = CancellableTask::spawn(|cancel| async move {
            let _ = tx.send(cancel);
        });
        let signal = rx.await.unwrap();
        assert!(!signal.is_cancelled());
        task.cancel();
        assert!(signal.is_cancelled());
    }
}
