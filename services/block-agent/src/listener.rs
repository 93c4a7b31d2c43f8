//! Event listener: turns feed events into reconciler calls.
//!
//! For each block state change the listener:
//! - Replays deferred events whose block is no longer being modified
//! - Looks the block up under the registry lock, dropping stale names
//! - Defers the event if the block is mid-update elsewhere
//! - Maps the vendor status and hands the event to the reconciler
//!
//! Event processing is serialized: one event, live or replayed, is applied
//! at a time, even across the registry lock release around a job requeue.

use std::sync::Arc;

use bgwatch_events::BlockStateChanged;
use bgwatch_reconcile::BlockState;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::reconciler::{BlockReconciler, ReconcileOutcome};

/// Event listener.
pub struct EventListener {
    reconciler: Arc<BlockReconciler>,

    /// Held from taking deferred events until the reconciler returns.
    processing: Mutex<()>,
}

impl EventListener {
    pub fn new(reconciler: Arc<BlockReconciler>) -> Self {
        Self {
            reconciler,
            processing: Mutex::new(()),
        }
    }

    pub fn reconciler(&self) -> &Arc<BlockReconciler> {
        &self.reconciler
    }

    /// Handle one block state change.
    pub async fn handle(&self, event: BlockStateChanged) -> ReconcileOutcome {
        let _processing = self.processing.lock().await;
        self.replay_ready().await;
        self.dispatch(event, false).await
    }

    /// Apply every deferred event whose block is no longer being modified.
    /// Returns the number of events replayed.
    pub async fn replay_deferred(&self) -> usize {
        let _processing = self.processing.lock().await;
        self.replay_ready().await
    }

    async fn replay_ready(&self) -> usize {
        let ready = self.reconciler.registry().lock().await.take_ready_deferred();
        let count = ready.len();

        for event in ready {
            debug!(block = %event.block, status = %event.status, "Replaying deferred event");
            self.dispatch(event, true).await;
        }
        count
    }

    async fn dispatch(&self, event: BlockStateChanged, replay: bool) -> ReconcileOutcome {
        let mut registry = self.reconciler.registry().lock().await;

        let Some(record) = registry.get(event.block.as_str()) else {
            info!(block = %event.block, status = %event.status, "Event for unknown block, discarding");
            return ReconcileOutcome::Stale;
        };

        // Events queue behind earlier deferred events for the same block.
        let must_wait = record.is_modifying() || (!replay && registry.has_deferred(event.block.as_str()));
        if must_wait {
            debug!(block = %event.block, status = %event.status, "Block is being modified, deferring event");
            registry.defer(event);
            return ReconcileOutcome::Deferred;
        }

        let reported = BlockState::from_vendor(&event.status);
        debug!(
            block = %event.block,
            status = %event.status,
            state = %reported,
            occurred_at = ?event.occurred_at,
            "Block status changed"
        );

        self.reconciler.apply(registry, &event.block, reported).await
    }
}
