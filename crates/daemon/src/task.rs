//! Cancellable, timeout-bound background work.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

/// How a unit of work ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The work returned.
    Completed(T),
    /// Stopped through [`Exec::stop`].
    Cancelled,
    /// Hit the deadline.
    TimedOut(Duration),
}

/// Runs at most one unit of work at a time under an explicit cancel signal
/// and a deadline.
///
/// The work future is dropped on cancel or timeout, so child processes
/// spawned with `kill_on_drop` die with it. The `done` callback always runs,
/// and [`Exec::stop`] returns only after it has.
pub struct Exec {
    name: &'static str,
    timeout: Duration,
    running: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl Exec {
    /// Idle wrapper; `name` only shows up in logs.
    pub fn new(name: &'static str, timeout: Duration) -> Self {
        Self {
            name,
            timeout,
            running: None,
        }
    }

    /// Runs `work` in the background and hands its outcome to `done`.
    /// 
    /// Callers stop the previous work first.
    pub fn spawn<T, W, D, F>(&mut self, work: W, done: D)
    where
        T: Send + 'static,
        W: Future<Output = T> + Send + 'static,
        D: FnOnce(Outcome<T>) -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let timeout = self.timeout;

        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel_rx => Outcome::Cancelled,
                res = tokio::time::timeout(timeout, work) => match res {
                    Ok(value) => Outcome::Completed(value),
                    Err(_) => Outcome::TimedOut(timeout),
                },
            };
            done(outcome).await;
        });

        self.running = Some((cancel_tx, handle));
    }

    /// Cancels the running work, if any, and waits for it to wind down.
    pub async fn stop(&mut self) {
        let Some((cancel, handle)) = self.running.take() else {
            return;
        };
        let _ = cancel.send(());
        if let Err(e) = handle.await {
            warn!(exec = self.name, error = %e, "background work panicked");
        }
    }

    /// Work is spawned and not finished.
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }
}
