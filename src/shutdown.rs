//! Cooperative shutdown: one cancellation token, a `Running → Stopping →
//! Stopped` state machine and a bounded join over the worker tasks.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping,
    Stopped,
}

/// How a worker left its loop.
#[derive(Debug)]
pub enum WorkerExit {
    Cancelled,
    Failed(BridgeError),
}

impl WorkerExit {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerExit::Cancelled)
    }
}

/// Runs a worker body, turning a panic into [`BridgeError::Panicked`] so the
/// caller can still run its cleanup.
pub async fn catch_panic<T, F>(body: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(body).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(BridgeError::Panicked(panic_message(payload.as_ref()))),
    }
}

/// Races an external call against the token so shutdown does not wait for
/// it to return.
pub async fn cancellable<F: Future>(token: &CancellationToken, call: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(BridgeError::Cancelled),
        out = call => Ok(out),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub exits: Vec<(&'static str, WorkerExit)>,
    pub timed_out: Vec<&'static str>,
}

pub struct ShutdownCoordinator {
    token: CancellationToken,
    state: watch::Sender<ShutdownState>,
    workers: Mutex<Vec<(&'static str, JoinHandle<WorkerExit>)>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            token: CancellationToken::new(),
            state,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Requests shutdown. Redundant calls have no effect.
    pub fn stop(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::Stopping;
                true
            } else {
                false
            }
        });
        if changed {
            tracing::info!("shutdown requested");
        }
        self.token.cancel();
    }

    pub fn spawn<F>(&self, name: &'static str, worker: F)
    where
        F: Future<Output = WorkerExit> + Send + 'static,
    {
        let handle = tokio::spawn(worker);
        self.workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((name, handle));
    }

    /// Waits for an interrupt or terminate signal, then stops. Returns early
    /// if [`Self::stop`] was already called.
    pub async fn listen_for_signals(&self) {
        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = shutdown_signal() => {}
        }
        self.stop();
    }

    /// Waits for shutdown to be requested, then joins every worker. Workers
    /// still running after `timeout` are aborted and reported as timed out.
    pub async fn join(&self, timeout: Duration) -> ShutdownReport {
        self.token.cancelled().await;

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        let deadline = tokio::time::Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        for (name, mut handle) in workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(result) => report.exits.push((name, join_result(name, result))),
                Err(_) => {
                    tracing::warn!(worker = name, ?timeout, "worker did not stop in time, aborting");
                    handle.abort();
                    report.timed_out.push(name);
                }
            }
        }

        self.state.send_replace(ShutdownState::Stopped);
        tracing::info!(
            joined = report.exits.len(),
            timed_out = report.timed_out.len(),
            "shutdown complete"
        );
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn join_result(
    name: &'static str,
    result: std::result::Result<WorkerExit, tokio::task::JoinError>,
) -> WorkerExit {
    match result {
        Ok(exit) => exit,
        Err(e) => {
            tracing::error!(worker = name, error = %e, "worker task failed");
            WorkerExit::Failed(BridgeError::Panicked(e.to_string()))
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received terminate signal"),
    }
}
