//! Block reconciler: applies reported block states to the registry.
//!
//! The reconciler:
//! - Classifies each reported state against the block's current state,
//!   correcting for events the hardware service dropped or made up
//! - Applies state-entry side effects to the registry lists and capacity
//! - Drives the boot-retry policy for blocks with a boot outstanding
//!
//! It runs with the registry lock held from the moment the event's block is
//! looked up. The lock is released only around the job requeue call.

use std::sync::Arc;

use bgwatch_id::{BlockName, UserName};
use bgwatch_reconcile::{
    BlockState, BootAction, Transition, BOOT_FAILED_REASON, MAX_BOOT_RETRIES,
};
use tokio::sync::MutexGuard;
use tracing::{debug, error, info, warn};

use crate::kill_queue::KillJobQueue;
use crate::registry::{BlockHandle, BlockList, BlockRegistry, RegistryState};
use crate::scheduler::Scheduler;

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Boots re-issued before the job is requeued.
    pub max_boot_retries: u32,

    /// Account that owns blocks no job is using.
    pub idle_user: UserName,
}

impl ReconcilerConfig {
    pub fn new(idle_user: UserName) -> Self {
        Self {
            max_boot_retries: MAX_BOOT_RETRIES,
            idle_user,
        }
    }
}

/// What happened to a reported state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The state was applied (possibly corrected).
    Applied {
        previous: BlockState,
        current: BlockState,
        transition: Transition,
    },

    /// The report was dropped as a known vendor quirk.
    Ignored { current: BlockState },

    /// The block is being modified elsewhere; the event was queued.
    Deferred,

    /// The block is not tracked.
    Stale,
}

/// Block reconciler.
pub struct BlockReconciler {
    registry: Arc<BlockRegistry>,
    scheduler: Arc<dyn Scheduler>,
    kill_queue: KillJobQueue,
    config: ReconcilerConfig,
}

impl BlockReconciler {
    /// Create a new reconciler.
    pub fn new(
        registry: Arc<BlockRegistry>,
        scheduler: Arc<dyn Scheduler>,
        kill_queue: KillJobQueue,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            registry,
            scheduler,
            kill_queue,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    /// Apply a reported state to `block`.
    ///
    /// `registry` must be the guard under which the block was looked up.
    pub async fn apply<'a>(
        &'a self,
        mut registry: MutexGuard<'a, RegistryState>,
        block: &BlockName,
        reported: BlockState,
    ) -> ReconcileOutcome {
        let Some(record) = registry.get_mut(block.as_str()) else {
            return ReconcileOutcome::Stale;
        };

        let previous = record.state;
        let handle = record.handle();
        let transition = Transition::classify(previous, reported);

        debug!(
            block = %block,
            previous = %previous,
            reported = %reported,
            "Block state changed"
        );

        match transition {
            Transition::IgnoredQuirk => {
                info!(
                    block = %block,
                    "Ignoring BOOTING reported while terminating"
                );
                self.check_boot(registry, &handle).await;
                return ReconcileOutcome::Ignored { current: previous };
            }
            Transition::MissedDeallocation => {
                debug!(
                    block = %block,
                    previous = %previous,
                    "Block went free without deallocating, tearing it down first"
                );
            }
            Transition::MissedReboot => {
                debug!(
                    block = %block,
                    user = ?record.user,
                    "Block rebooted outside the scheduler, resetting target user"
                );
                record.target_user = record.user.clone();
            }
            Transition::Direct(_) => {}
        }

        let current = transition.resulting_state(previous);
        record.state = current;

        if transition.runs_block_lost() {
            self.block_lost(&mut registry, block);
        }
        self.enter_state(&mut registry, block, current).await;
        self.check_boot(registry, &handle).await;

        ReconcileOutcome::Applied {
            previous,
            current,
            transition,
        }
    }

    /// Side effects of entering `state`.
    async fn enter_state(&self, registry: &mut RegistryState, block: &BlockName, state: BlockState) {
        let name = block.as_str();

        match state {
            BlockState::Booting => {
                if let Some(record) = registry.get_mut(name) {
                    debug!(block = %block, "Setting boot flag");
                    record.boot_outstanding = true;
                }
                registry.remove_from(BlockList::Booted, name);
            }
            BlockState::Free => {
                registry.remove_from(BlockList::JobRunning, name);
                registry.remove_from(BlockList::Booted, name);
            }
            BlockState::Error => {
                let booting = registry.get(name).is_some_and(|r| r.boot_outstanding);
                if booting {
                    error!(block = %block, "Block in an error state while booting");
                } else {
                    error!(block = %block, "Block in an error state");
                }
                registry.remove_from(BlockList::Booted, name);
                self.scheduler.signal_block_error(block).await;
            }
            BlockState::Initialized => {
                registry.add_if_absent(BlockList::Booted, name);
            }
            BlockState::Allocated => {
                registry.add_if_absent(BlockList::Booted, name);
                registry.remove_from(BlockList::JobRunning, name);
            }
            BlockState::Terminating | BlockState::Unknown => {}
        }
    }

    /// The block is deallocating: whatever ran on it is gone.
    fn block_lost(&self, registry: &mut RegistryState, block: &BlockName) {
        let name = block.as_str();
        let Some(record) = registry.get_mut(name) else {
            return;
        };

        let lost_job = record
            .running_job()
            .or(record.job.filter(|_| !record.boot_outstanding));

        if let Some(job_id) = lost_job {
            error!(
                block = %block,
                user = ?record.user,
                job_id = %job_id,
                "Block was in a ready state but is being freed, job was lost"
            );
            self.kill_queue.push(job_id, block.clone());
        } else if record.target_user.is_some() && record.target_user != record.user {
            error!(
                block = %block,
                target_user = ?record.target_user,
                user = ?record.user,
                "Block went free during a boot"
            );
        } else {
            debug!(
                block = %block,
                "Block was in a ready state but is being freed, no job running"
            );
        }

        if record.user.is_none() {
            error!(
                block = %block,
                idle_user = %self.config.idle_user,
                "Neither target nor occupying user set, handing block to idle user"
            );
            record.user = Some(self.config.idle_user.clone());
        } else if record.target_user.is_none() {
            error!(block = %block, "Target user not set");
        }

        // A watched boot keeps its target and job: the retry policy still
        // needs both.
        if !record.boot_outstanding || record.target_user.is_none() {
            record.target_user = record.user.clone();
        }
        if !record.boot_outstanding {
            record.job = None;
        }

        registry.remove_from(BlockList::JobRunning, name);
        registry.remove_from(BlockList::Booted, name);
    }

    /// Boot-retry policy. Consumes the guard; may release it around the
    /// job requeue.
    async fn check_boot<'a>(
        &'a self,
        mut registry: MutexGuard<'a, RegistryState>,
        handle: &BlockHandle,
    ) {
        let block = &handle.name;
        let Some(record) = registry.resolve_mut(handle) else {
            return;
        };

        debug!(
            block = %block,
            boot_outstanding = record.boot_outstanding,
            boot_count = record.boot_count,
            "Checking boot state"
        );
        if !record.boot_outstanding {
            return;
        }

        let action = BootAction::decide(record.state, record.boot_count, self.config.max_boot_retries);
        match action {
            BootAction::CheckTarget => {
                debug!(block = %block, target_user = ?record.target_user, "Checking block is set up for target user");
                let drifted = record.user != record.target_user;
                if drifted {
                    record.user = record.target_user.clone();
                }
                let job = record.job;
                if drifted {
                    registry.touch();
                }
                if let Some(job_id) = job {
                    self.scheduler.set_job_configuring(job_id, true).await;
                }
            }
            BootAction::AwaitRecovery => {
                // Errors during boot are expected to clear themselves and
                // come back as FREE, which retries the boot.
                debug!(block = %block, "Waiting for block to recover from boot error");
            }
            BootAction::Retry { attempt } => {
                record.boot_count = attempt;
                let target_user = record.target_user.clone();
                info!(
                    block = %block,
                    attempt,
                    max = self.config.max_boot_retries,
                    "Re-issuing block boot"
                );
                if let Err(e) = self.scheduler.boot_block(block, target_user.as_ref()).await {
                    warn!(block = %block, attempt, error = %e, "Boot request failed");
                }
            }
            BootAction::GiveUp => {
                let job = record.job;
                error!(
                    block = %block,
                    target_user = ?record.target_user,
                    "Couldn't boot block"
                );

                drop(registry);
                if let Some(job_id) = job {
                    if let Err(e) = self
                        .scheduler
                        .requeue_job(job_id, block, BOOT_FAILED_REASON)
                        .await
                    {
                        error!(block = %block, job_id = %job_id, error = %e, "Failed to requeue job");
                    }
                }
                let mut registry = self.registry.lock().await;

                let Some(record) = registry.resolve_mut(handle) else {
                    warn!(block = %block, "Block was removed while its job was requeued");
                    return;
                };
                record.boot_outstanding = false;
                record.boot_count = 0;
                if record.job == job {
                    record.job = None;
                }
                registry.remove_from(BlockList::JobRunning, block.as_str());
                registry.remove_from(BlockList::Booted, block.as_str());
            }
            BootAction::Ready => {
                debug!(block = %block, "Block is ready");
                record.boot_outstanding = false;
                record.boot_count = 0;
                let job = record.job;
                let target_user = record.target_user.clone();

                if let Some(job_id) = job {
                    self.scheduler.set_job_configuring(job_id, false).await;
                }

                let assigned = match &target_user {
                    Some(user) => match self.scheduler.assign_occupancy(block, user).await {
                        Ok(()) => true,
                        Err(e) => {
                            error!(block = %block, user = %user, error = %e, "Failed to assign block to user");
                            false
                        }
                    },
                    None => {
                        error!(block = %block, "Block booted without a target user");
                        false
                    }
                };

                if assigned {
                    if let Some(record) = registry.resolve_mut(handle) {
                        record.user = target_user;
                    }
                    registry.touch();
                } else if let Some(job_id) = job {
                    self.kill_queue.push(job_id, block.clone());
                }
            }
            BootAction::AwaitFree => {
                debug!(
                    block = %block,
                    "Block is deallocating during a boot, doing nothing until free"
                );
            }
            BootAction::Ignore => {
                debug!(block = %block, state = %record.state, "Doing nothing for block state");
            }
        }
    }
}
