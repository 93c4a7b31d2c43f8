//! Scheduler collaborator interface and mock implementation.
//!
//! The reconciler never acts on jobs or hardware directly. Everything it
//! decides goes through this interface:
//! - Booting a block for a user
//! - Requeuing or killing a job
//! - Binding a booted block to its user
//! - Reporting block errors and job configuring state
//!
//! A mock implementation is provided for testing and development.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bgwatch_id::{BlockName, JobId, UserName};
use thiserror::Error;
use tracing::{debug, info};

/// Errors from scheduler calls.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The scheduler refused the request.
    #[error("{operation} rejected: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },

    /// The scheduler could not be reached.
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Scheduler collaborator.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Issue a boot for `block`, prepared for `user`.
    async fn boot_block(
        &self,
        block: &BlockName,
        user: Option<&UserName>,
    ) -> Result<(), SchedulerError>;

    /// Return a job to the pending queue with a reason.
    async fn requeue_job(
        &self,
        job_id: JobId,
        block: &BlockName,
        reason: &str,
    ) -> Result<(), SchedulerError>;

    /// Tear down a job.
    async fn kill_job(&self, job_id: JobId) -> Result<(), SchedulerError>;

    /// Bind a booted block to `user`.
    async fn assign_occupancy(
        &self,
        block: &BlockName,
        user: &UserName,
    ) -> Result<(), SchedulerError>;

    /// A block entered the error state.
    async fn signal_block_error(&self, block: &BlockName);

    /// Set or clear the configuring flag of a job.
    async fn set_job_configuring(&self, job_id: JobId, configuring: bool);
}

// =============================================================================
// Mock
// =============================================================================

/// A call recorded by [`MockScheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerCall {
    BootBlock {
        block: BlockName,
        user: Option<UserName>,
    },
    RequeueJob {
        job_id: JobId,
        block: BlockName,
        reason: String,
    },
    KillJob {
        job_id: JobId,
    },
    AssignOccupancy {
        block: BlockName,
        user: UserName,
    },
    SignalBlockError {
        block: BlockName,
    },
    SetJobConfiguring {
        job_id: JobId,
        configuring: bool,
    },
}

/// Mock scheduler for testing and development.
#[derive(Debug, Default)]
pub struct MockScheduler {
    calls: Mutex<Vec<SchedulerCall>>,

    /// Whether boots should "fail".
    fail_boots: AtomicBool,

    /// Whether occupancy assignment should "fail".
    fail_assign: AtomicBool,
}

impl MockScheduler {
    /// Create a new mock scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock scheduler that rejects every occupancy assignment.
    pub fn failing_assign() -> Self {
        let scheduler = Self::default();
        scheduler.fail_assign.store(true, Ordering::SeqCst);
        scheduler
    }

    pub fn set_fail_boots(&self, fail: bool) {
        self.fail_boots.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_assign(&self, fail: bool) {
        self.fail_assign.store(fail, Ordering::SeqCst);
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.lock_calls().clone()
    }

    /// Number of boots issued for `block`.
    pub fn boots_for(&self, block: &str) -> usize {
        self.lock_calls()
            .iter()
            .filter(|call| matches!(call, SchedulerCall::BootBlock { block: b, .. } if b.as_str() == block))
            .count()
    }

    /// Requeue calls, as (job, reason).
    pub fn requeues(&self) -> Vec<(JobId, String)> {
        self.lock_calls()
            .iter()
            .filter_map(|call| match call {
                SchedulerCall::RequeueJob { job_id, reason, .. } => Some((*job_id, reason.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: SchedulerCall) {
        self.lock_calls().push(call);
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<SchedulerCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    async fn boot_block(
        &self,
        block: &BlockName,
        user: Option<&UserName>,
    ) -> Result<(), SchedulerError> {
        info!(block = %block, user = ?user, "[MOCK] Booting block");
        self.record(SchedulerCall::BootBlock {
            block: block.clone(),
            user: user.cloned(),
        });

        if self.fail_boots.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rejected {
                operation: "boot",
                message: "mock scheduler configured to fail".to_string(),
            });
        }
        Ok(())
    }

    async fn requeue_job(
        &self,
        job_id: JobId,
        block: &BlockName,
        reason: &str,
    ) -> Result<(), SchedulerError> {
        info!(job_id = %job_id, block = %block, reason, "[MOCK] Requeuing job");
        self.record(SchedulerCall::RequeueJob {
            job_id,
            block: block.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn kill_job(&self, job_id: JobId) -> Result<(), SchedulerError> {
        info!(job_id = %job_id, "[MOCK] Killing job");
        self.record(SchedulerCall::KillJob { job_id });
        Ok(())
    }

    async fn assign_occupancy(
        &self,
        block: &BlockName,
        user: &UserName,
    ) -> Result<(), SchedulerError> {
        debug!(block = %block, user = %user, "[MOCK] Assigning block");
        self.record(SchedulerCall::AssignOccupancy {
            block: block.clone(),
            user: user.clone(),
        });

        if self.fail_assign.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rejected {
                operation: "assign",
                message: "mock scheduler configured to fail".to_string(),
            });
        }
        Ok(())
    }

    async fn signal_block_error(&self, block: &BlockName) {
        debug!(block = %block, "[MOCK] Block error");
        self.record(SchedulerCall::SignalBlockError {
            block: block.clone(),
        });
    }

    async fn set_job_configuring(&self, job_id: JobId, configuring: bool) {
        debug!(job_id = %job_id, configuring, "[MOCK] Job configuring");
        self.record(SchedulerCall::SetJobConfiguring {
            job_id,
            configuring,
        });
    }
}
