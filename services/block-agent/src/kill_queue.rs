//! Queue of jobs that lost their block.
//!
//! The reconciler pushes a request while holding the registry lock; the
//! teardown worker pops requests independently and asks the scheduler to
//! kill the job. Each request is delivered exactly once.

use std::sync::Arc;

use bgwatch_id::{BlockName, JobId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::scheduler::Scheduler;

/// A job to tear down because its block went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillJobRequest {
    pub job_id: JobId,
    pub block: BlockName,
}

/// Producer side of the kill queue.
#[derive(Debug, Clone)]
pub struct KillJobQueue {
    tx: mpsc::UnboundedSender<KillJobRequest>,
}

/// Consumer side of the kill queue.
#[derive(Debug)]
pub struct KillJobReceiver {
    rx: mpsc::UnboundedReceiver<KillJobRequest>,
}

/// Create a connected queue/receiver pair.
pub fn kill_job_queue() -> (KillJobQueue, KillJobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (KillJobQueue { tx }, KillJobReceiver { rx })
}

impl KillJobQueue {
    /// Queue a kill request. Never blocks.
    pub fn push(&self, job_id: JobId, block: BlockName) {
        debug!(job_id = %job_id, block = %block, "Queueing job kill");
        if let Err(e) = self.tx.send(KillJobRequest { job_id, block }) {
            warn!(
                job_id = %e.0.job_id,
                block = %e.0.block,
                "Kill queue consumer is gone, dropping request"
            );
        }
    }
}

impl KillJobReceiver {
    /// Wait for the next request. Returns `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<KillJobRequest> {
        self.rx.recv().await
    }

    /// Pop a request if one is queued.
    pub fn try_pop(&mut self) -> Option<KillJobRequest> {
        self.rx.try_recv().ok()
    }

    /// Pop every queued request.
    pub fn drain(&mut self) -> Vec<KillJobRequest> {
        std::iter::from_fn(|| self.try_pop()).collect()
    }
}

/// Forward kill requests to the scheduler until shutdown.
///
/// Requests still queued at shutdown are flushed before returning.
pub async fn run_kill_worker(
    mut receiver: KillJobReceiver,
    scheduler: Arc<dyn Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Starting job kill worker");

    loop {
        tokio::select! {
            request = receiver.recv() => {
                let Some(request) = request else {
                    debug!("Kill queue closed");
                    break;
                };
                kill(scheduler.as_ref(), request).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    for request in receiver.drain() {
        kill(scheduler.as_ref(), request).await;
    }

    info!("Job kill worker stopped");
}

async fn kill(scheduler: &dyn Scheduler, request: KillJobRequest) {
    info!(job_id = %request.job_id, block = %request.block, "Killing job");
    if let Err(e) = scheduler.kill_job(request.job_id).await {
        error!(
            job_id = %request.job_id,
            block = %request.block,
            error = %e,
            "Failed to kill job"
        );
    }
}
