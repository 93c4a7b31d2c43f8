//! Start/stop lifecycle of the real-time connection task.

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::connection::{ConnectionManager, EventSource};

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The connection task panicked or was cancelled.
    #[error("event connection task failed: {0}")]
    TaskFailed(String),

    /// An earlier failure lost the connection manager; the service cannot
    /// be started again.
    #[error("event connection manager is unavailable after an earlier failure")]
    Unavailable,
}

enum Lifecycle<S> {
    Idle(ConnectionManager<S>),
    Running {
        shutdown_tx: watch::Sender<bool>,
        handle: JoinHandle<ConnectionManager<S>>,
    },
    Failed,
}

/// Owns the connection manager and the task running it.
///
/// `start` and `stop` are idempotent and safe to call concurrently: the
/// lifecycle lock is held until the transition completes, so a concurrent
/// `stop` returns only after the task has exited.
pub struct RealTimeService<S> {
    lifecycle: Mutex<Lifecycle<S>>,
}

impl<S: EventSource + 'static> RealTimeService<S> {
    pub fn new(manager: ConnectionManager<S>) -> Self {
        Self {
            lifecycle: Mutex::new(Lifecycle::Idle(manager)),
        }
    }

    /// Spawn the connection task. Does nothing if it is already running.
    pub async fn start(&self) -> Result<(), ServiceError> {
        let mut lifecycle = self.lifecycle.lock().await;

        match std::mem::replace(&mut *lifecycle, Lifecycle::Failed) {
            Lifecycle::Idle(manager) => {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let handle = tokio::spawn(manager.run(shutdown_rx));
                *lifecycle = Lifecycle::Running {
                    shutdown_tx,
                    handle,
                };
                info!("Real-time service started");
                Ok(())
            }
            running @ Lifecycle::Running { .. } => {
                debug!("Real-time service already running");
                *lifecycle = running;
                Ok(())
            }
            Lifecycle::Failed => Err(ServiceError::Unavailable),
        }
    }

    /// Signal the connection task to stop and wait for it to exit. Does
    /// nothing if it is not running.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let mut lifecycle = self.lifecycle.lock().await;

        match std::mem::replace(&mut *lifecycle, Lifecycle::Failed) {
            Lifecycle::Running {
                shutdown_tx,
                handle,
            } => {
                let _ = shutdown_tx.send(true);
                match handle.await {
                    Ok(manager) => {
                        *lifecycle = Lifecycle::Idle(manager);
                        info!("Real-time service stopped");
                        Ok(())
                    }
                    Err(e) => {
                        error!(error = %e, "Real-time connection task failed");
                        Err(ServiceError::TaskFailed(e.to_string()))
                    }
                }
            }
            other => {
                *lifecycle = other;
                Ok(())
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running { .. })
    }
}
