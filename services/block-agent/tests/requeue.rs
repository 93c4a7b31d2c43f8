//! Integration tests for job requeue after repeated boot failures.
//!
//! The requeue call runs with the registry lock released. These tests use a
//! scheduler that takes the registry lock itself while requeuing, one that
//! replaces the block in the meantime, and one that holds the requeue open
//! while a newer event for the block arrives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use async_trait::async_trait;
use bgwatch_agent::{
    kill_job_queue, BlockReconciler, BlockRegistry, BlockSpec, EventListener, ReconcilerConfig,
    Scheduler, SchedulerError,
};
use bgwatch_events::{BlockStateChanged, VendorBlockStatus};
use bgwatch_id::{BlockName, JobId, UserName};
use bgwatch_reconcile::{BlockState, MAX_BOOT_RETRIES};

/// Scheduler that touches the registry from inside `requeue_job`.
struct RegistryTouchingScheduler {
    registry: Arc<BlockRegistry>,
    replace_block: bool,
    requeued: Mutex<Vec<JobId>>,
}

#[async_trait]
impl Scheduler for RegistryTouchingScheduler {
    async fn boot_block(
        &self,
        _block: &BlockName,
        _user: Option<&UserName>,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn requeue_job(
        &self,
        job_id: JobId,
        block: &BlockName,
        _reason: &str,
    ) -> Result<(), SchedulerError> {
        let mut registry = self.registry.lock().await;
        if self.replace_block {
            registry.remove_block(block.as_str()).unwrap();
            let mut spec = BlockSpec::new(block.clone(), 512);
            spec.job = Some(job(555));
            registry.insert_block(spec).unwrap();
        }
        self.requeued.lock().unwrap().push(job_id);
        Ok(())
    }

    async fn kill_job(&self, _job_id: JobId) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn assign_occupancy(
        &self,
        _block: &BlockName,
        _user: &UserName,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn signal_block_error(&self, _block: &BlockName) {}

    async fn set_job_configuring(&self, _job_id: JobId, _configuring: bool) {}
}

fn job(id: u32) -> JobId {
    JobId::new(id).unwrap()
}

fn event(status: VendorBlockStatus) -> BlockStateChanged {
    BlockStateChanged::new(BlockName::parse("B1").unwrap(), status)
}

fn setup(replace_block: bool) -> (EventListener, Arc<RegistryTouchingScheduler>) {
    let mut spec = BlockSpec::new(BlockName::parse("B1").unwrap(), 512);
    spec.state = BlockState::Free;
    spec.target_user = Some(UserName::parse("alice").unwrap());
    spec.job = Some(job(100));

    let registry = Arc::new(BlockRegistry::from_specs([spec]).unwrap());
    let scheduler = Arc::new(RegistryTouchingScheduler {
        registry: registry.clone(),
        replace_block,
        requeued: Mutex::new(Vec::new()),
    });
    let (queue, _receiver) = kill_job_queue();
    let reconciler = BlockReconciler::new(
        registry,
        scheduler.clone(),
        queue,
        ReconcilerConfig::new(UserName::parse("slurm").unwrap()),
    );
    (EventListener::new(Arc::new(reconciler)), scheduler)
}

async fn exhaust_boot_retries(listener: &EventListener) {
    for _ in 0..=MAX_BOOT_RETRIES {
        listener.handle(event(VendorBlockStatus::Booting)).await;
        listener.handle(event(VendorBlockStatus::Free)).await;
    }
}

#[tokio::test]
async fn test_requeue_runs_without_registry_lock() {
    let (listener, scheduler) = setup(false);

    tokio::time::timeout(Duration::from_secs(5), exhaust_boot_retries(&listener))
        .await
        .expect("requeue deadlocked on the registry lock");

    assert_eq!(*scheduler.requeued.lock().unwrap(), vec![job(100)]);

    let registry = listener.reconciler().registry();
    let record = registry.snapshot("B1").await.unwrap();
    assert!(!record.boot_outstanding);
    assert_eq!(record.boot_count, 0);
    assert_eq!(record.job, None);
    registry.lock().await.check_invariants().unwrap();
}

#[tokio::test]
async fn test_block_replaced_during_requeue_is_left_alone() {
    let (listener, scheduler) = setup(true);

    tokio::time::timeout(Duration::from_secs(5), exhaust_boot_retries(&listener))
        .await
        .expect("requeue deadlocked on the registry lock");

    assert_eq!(*scheduler.requeued.lock().unwrap(), vec![job(100)]);

    // The new incarnation keeps its own job.
    let registry = listener.reconciler().registry();
    let record = registry.snapshot("B1").await.unwrap();
    assert_eq!(record.job, Some(job(555)));
    assert_eq!(record.state, BlockState::Unknown);
    registry.lock().await.check_invariants().unwrap();
}

/// Scheduler whose `requeue_job` waits until released.
#[derive(Default)]
struct GatedScheduler {
    requeue_entered: Notify,
    requeue_release: Notify,
    requeued: Mutex<Vec<JobId>>,
}

#[async_trait]
impl Scheduler for GatedScheduler {
    async fn boot_block(
        &self,
        _block: &BlockName,
        _user: Option<&UserName>,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn requeue_job(
        &self,
        job_id: JobId,
        _block: &BlockName,
        _reason: &str,
    ) -> Result<(), SchedulerError> {
        self.requeue_entered.notify_one();
        self.requeue_release.notified().await;
        self.requeued.lock().unwrap().push(job_id);
        Ok(())
    }

    async fn kill_job(&self, _job_id: JobId) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn assign_occupancy(
        &self,
        _block: &BlockName,
        _user: &UserName,
    ) -> Result<(), SchedulerError> {
        Ok(())
    }

    async fn signal_block_error(&self, _block: &BlockName) {}

    async fn set_job_configuring(&self, _job_id: JobId, _configuring: bool) {}
}

#[tokio::test]
async fn test_newer_event_waits_for_replayed_give_up() {
    let mut spec = BlockSpec::new(BlockName::parse("B1").unwrap(), 512);
    spec.state = BlockState::Free;
    spec.target_user = Some(UserName::parse("alice").unwrap());
    spec.job = Some(job(100));

    let registry = Arc::new(BlockRegistry::from_specs([spec]).unwrap());
    let scheduler = Arc::new(GatedScheduler::default());
    let (queue, _receiver) = kill_job_queue();
    let reconciler = BlockReconciler::new(
        registry.clone(),
        scheduler.clone(),
        queue,
        ReconcilerConfig::new(UserName::parse("slurm").unwrap()),
    );
    let listener = Arc::new(EventListener::new(Arc::new(reconciler)));

    // Use up every retry, then boot once more.
    for _ in 0..MAX_BOOT_RETRIES {
        listener.handle(event(VendorBlockStatus::Booting)).await;
        listener.handle(event(VendorBlockStatus::Free)).await;
    }
    listener.handle(event(VendorBlockStatus::Booting)).await;

    // The final FREE arrives while the block is being modified.
    registry.lock().await.set_modifying("B1", true).unwrap();
    listener.handle(event(VendorBlockStatus::Free)).await;
    registry.lock().await.set_modifying("B1", false).unwrap();

    // Replaying it gives up on the boot and blocks in the requeue.
    let replay = tokio::spawn({
        let listener = listener.clone();
        async move { listener.replay_deferred().await }
    });
    scheduler.requeue_entered.notified().await;

    // A newer BOOTING is delivered while the requeue is in flight.
    let newer = tokio::spawn({
        let listener = listener.clone();
        async move { listener.handle(event(VendorBlockStatus::Booting)).await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!newer.is_finished());

    scheduler.requeue_release.notify_one();
    assert_eq!(replay.await.unwrap(), 1);
    newer.await.unwrap();

    assert_eq!(*scheduler.requeued.lock().unwrap(), vec![job(100)]);
    let record = registry.snapshot("B1").await.unwrap();
    assert_eq!(record.state, BlockState::Booting);
    assert!(record.boot_outstanding);
    registry.lock().await.check_invariants().unwrap();
}
