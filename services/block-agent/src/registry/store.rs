//! Lock-protected block registry.

use std::collections::{BTreeSet, HashMap, VecDeque};

use bgwatch_events::BlockStateChanged;
use bgwatch_id::{BlockName, JobId};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::record::{BlockHandle, BlockRecord, BlockSpec};

/// Most events held back for a single block. Past this the oldest one for
/// that block is dropped.
pub const MAX_DEFERRED_PER_BLOCK: usize = 64;

/// Errors from registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("block not found: {0}")]
    UnknownBlock(String),

    #[error("block already registered: {0}")]
    DuplicateBlock(BlockName),

    #[error("registry invariant violated: {0}")]
    Invariant(String),
}

/// Lists a block can be a member of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockList {
    /// Blocks in INITIALIZED or ALLOCATED.
    Booted,
    /// Blocks with a running job.
    JobRunning,
}

/// Everything guarded by the registry lock.
#[derive(Debug, Default)]
pub struct RegistryState {
    blocks: HashMap<BlockName, BlockRecord>,
    booted: BTreeSet<BlockName>,
    job_running: BTreeSet<BlockName>,
    total_capacity: u64,
    unused_capacity: u64,
    next_generation: u64,

    /// Events held back while their block was being modified, in delivery order.
    deferred: VecDeque<BlockStateChanged>,

    last_block_update: Option<DateTime<Utc>>,
}

impl RegistryState {
    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    /// Register a block created by the allocation subsystem.
    pub fn insert_block(&mut self, spec: BlockSpec) -> Result<BlockHandle, RegistryError> {
        if self.blocks.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateBlock(spec.name));
        }

        self.next_generation += 1;
        let name = spec.name.clone();
        let running = spec.job.filter(|_| spec.job_running);
        let record = BlockRecord::from_spec(spec, self.next_generation);
        let handle = record.handle();
        let cpu_count = u64::from(record.cpu_count);
        let booted = record.state.is_booted();

        self.blocks.insert(name.clone(), record);
        self.total_capacity += cpu_count;
        self.unused_capacity += cpu_count;

        if booted {
            self.add_if_absent(BlockList::Booted, name.as_str());
        }
        if let Some(job) = running {
            self.start_job(name.as_str(), job)?;
        }

        debug!(block = %name, generation = handle.generation, "Block registered");
        Ok(handle)
    }

    /// Remove a block record, dropping it from every list.
    pub fn remove_block(&mut self, name: &str) -> Result<BlockRecord, RegistryError> {
        if !self.blocks.contains_key(name) {
            return Err(RegistryError::UnknownBlock(name.to_string()));
        }

        self.remove_from(BlockList::JobRunning, name);
        self.remove_from(BlockList::Booted, name);
        self.deferred.retain(|event| event.block.as_str() != name);

        let record = self
            .blocks
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownBlock(name.to_string()))?;
        let cpu_count = u64::from(record.cpu_count);
        self.total_capacity -= cpu_count;
        self.unused_capacity -= cpu_count;

        debug!(block = %name, "Block removed");
        Ok(record)
    }

    pub fn get(&self, name: &str) -> Option<&BlockRecord> {
        self.blocks.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut BlockRecord> {
        self.blocks.get_mut(name)
    }

    /// Resolve a handle, failing if the record was freed or reused since.
    pub fn resolve(&self, handle: &BlockHandle) -> Option<&BlockRecord> {
        self.blocks
            .get(&handle.name)
            .filter(|record| record.generation == handle.generation)
    }

    pub fn resolve_mut(&mut self, handle: &BlockHandle) -> Option<&mut BlockRecord> {
        self.blocks
            .get_mut(&handle.name)
            .filter(|record| record.generation == handle.generation)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &BlockRecord> {
        self.blocks.values()
    }

    // -------------------------------------------------------------------------
    // Lists and capacity
    // -------------------------------------------------------------------------

    pub fn contains(&self, list: BlockList, name: &str) -> bool {
        match list {
            BlockList::Booted => self.booted.contains(name),
            BlockList::JobRunning => self.job_running.contains(name),
        }
    }

    /// Remove a block from a list. Returns true if it was a member.
    ///
    /// Leaving the job-running list clears the block's running job and
    /// returns its capacity to the unused pool.
    pub fn remove_from(&mut self, list: BlockList, name: &str) -> bool {
        match list {
            BlockList::Booted => self.booted.remove(name),
            BlockList::JobRunning => {
                if !self.job_running.remove(name) {
                    return false;
                }
                if let Some(record) = self.blocks.get_mut(name) {
                    record.running_job = None;
                    self.unused_capacity += u64::from(record.cpu_count);
                }
                true
            }
        }
    }

    /// Add a block to a list unless it is already there. Returns true if added.
    ///
    /// Joining the job-running list promotes the block's assigned job to its
    /// running job and takes its capacity out of the unused pool. A block
    /// without an assigned job cannot join.
    pub fn add_if_absent(&mut self, list: BlockList, name: &str) -> bool {
        let Some(record) = self.blocks.get_mut(name) else {
            return false;
        };

        match list {
            BlockList::Booted => {
                if self.booted.contains(name) {
                    return false;
                }
                self.booted.insert(record.name.clone());
                true
            }
            BlockList::JobRunning => {
                if self.job_running.contains(name) {
                    return false;
                }
                let Some(job) = record.job else {
                    warn!(block = %name, "Block has no job, not marking it running");
                    return false;
                };
                record.running_job = Some(job);
                self.job_running.insert(record.name.clone());
                self.unused_capacity -= u64::from(record.cpu_count);
                true
            }
        }
    }

    /// Assign `job` to a block and mark it running.
    pub fn start_job(&mut self, name: &str, job: JobId) -> Result<(), RegistryError> {
        let record = self
            .blocks
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownBlock(name.to_string()))?;

        if record.running_job.is_some_and(|running| running != job) {
            return Err(RegistryError::Invariant(format!(
                "block {name} already runs job {}",
                record.running_job.map_or(0, |j| j.value())
            )));
        }

        record.job = Some(job);
        self.add_if_absent(BlockList::JobRunning, name);
        Ok(())
    }

    /// The scheduler finished a job normally. Returns the job that was running.
    pub fn finish_job(&mut self, name: &str) -> Result<Option<JobId>, RegistryError> {
        let record = self
            .blocks
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownBlock(name.to_string()))?;
        let running = record.running_job;
        record.job = None;
        self.remove_from(BlockList::JobRunning, name);
        Ok(running)
    }

    pub fn total_capacity(&self) -> u64 {
        self.total_capacity
    }

    pub fn unused_capacity(&self) -> u64 {
        self.unused_capacity
    }

    pub fn booted(&self) -> impl Iterator<Item = &BlockName> {
        self.booted.iter()
    }

    pub fn job_running(&self) -> impl Iterator<Item = &BlockName> {
        self.job_running.iter()
    }

    // -------------------------------------------------------------------------
    // Concurrent modification
    // -------------------------------------------------------------------------

    /// Mark a block as being modified by another subsystem. Events for it are
    /// deferred until the flag is cleared.
    pub fn set_modifying(&mut self, name: &str, modifying: bool) -> Result<(), RegistryError> {
        let record = self
            .blocks
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownBlock(name.to_string()))?;
        record.modifying = modifying;
        Ok(())
    }

    /// Hold `event` back until its block is no longer being modified.
    pub fn defer(&mut self, event: BlockStateChanged) {
        let name = event.block.as_str();
        let held = self
            .deferred
            .iter()
            .filter(|deferred| deferred.block.as_str() == name)
            .count();

        if held >= MAX_DEFERRED_PER_BLOCK {
            let oldest = self
                .deferred
                .iter()
                .position(|deferred| deferred.block.as_str() == name);
            if let Some(dropped) = oldest.and_then(|pos| self.deferred.remove(pos)) {
                warn!(
                    block = %event.block,
                    dropped_status = %dropped.status,
                    limit = MAX_DEFERRED_PER_BLOCK,
                    "Too many deferred events for block, dropping the oldest"
                );
            }
        }

        self.deferred.push_back(event);
    }

    pub fn has_deferred(&self, name: &str) -> bool {
        self.deferred.iter().any(|event| event.block.as_str() == name)
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Take every deferred event whose block is no longer being modified,
    /// keeping delivery order. Events for removed blocks are dropped.
    pub fn take_ready_deferred(&mut self) -> Vec<BlockStateChanged> {
        let mut ready = Vec::new();
        let mut held = VecDeque::with_capacity(self.deferred.len());

        for event in self.deferred.drain(..) {
            match self.blocks.get(event.block.as_str()) {
                Some(record) if record.modifying => held.push_back(event),
                Some(_) => ready.push(event),
                None => debug!(block = %event.block, "Dropping deferred event for removed block"),
            }
        }

        self.deferred = held;
        ready
    }

    // -------------------------------------------------------------------------
    // Scheduler visibility
    // -------------------------------------------------------------------------

    /// Record that block data visible to the scheduler changed.
    pub fn touch(&mut self) {
        self.last_block_update = Some(Utc::now());
    }

    pub fn last_block_update(&self) -> Option<DateTime<Utc>> {
        self.last_block_update
    }

    /// Verify list membership and the capacity counter against the records.
    pub fn check_invariants(&self) -> Result<(), RegistryError> {
        let mut running_capacity = 0u64;

        for record in self.blocks.values() {
            let name = &record.name;

            if record.state.is_booted() != self.booted.contains(name) {
                return Err(RegistryError::Invariant(format!(
                    "block {name} in state {} has booted membership {}",
                    record.state,
                    self.booted.contains(name)
                )));
            }

            if record.running_job.is_some() != self.job_running.contains(name) {
                return Err(RegistryError::Invariant(format!(
                    "block {name} running job {:?} has job-running membership {}",
                    record.running_job,
                    self.job_running.contains(name)
                )));
            }

            if record.running_job.is_some() {
                running_capacity += u64::from(record.cpu_count);
            }
        }

        if let Some(stray) = self
            .booted
            .iter()
            .chain(self.job_running.iter())
            .find(|name| !self.blocks.contains_key(*name))
        {
            return Err(RegistryError::Invariant(format!(
                "list entry {stray} has no record"
            )));
        }

        if self.total_capacity - running_capacity != self.unused_capacity {
            return Err(RegistryError::Invariant(format!(
                "unused capacity {} != total {} - running {}",
                self.unused_capacity, self.total_capacity, running_capacity
            )));
        }

        Ok(())
    }
}

/// The shared block registry: one lock over every record, list and counter.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    state: Mutex<RegistryState>,
}

impl BlockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the given blocks.
    pub fn from_specs(specs: impl IntoIterator<Item = BlockSpec>) -> Result<Self, RegistryError> {
        let mut state = RegistryState::default();
        for spec in specs {
            state.insert_block(spec)?;
        }
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Acquire the registry lock.
    pub async fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().await
    }

    /// Copy of a block record.
    pub async fn snapshot(&self, name: &str) -> Option<BlockRecord> {
        self.state.lock().await.get(name).cloned()
    }

    pub async fn unused_capacity(&self) -> u64 {
        self.state.lock().await.unused_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgwatch_events::VendorBlockStatus;
    use bgwatch_reconcile::BlockState;

    fn name(s: &str) -> BlockName {
        BlockName::parse(s).unwrap()
    }

    fn job(id: u32) -> JobId {
        JobId::new(id).unwrap()
    }

    fn registry_with(blocks: &[(&str, u32)]) -> RegistryState {
        let mut state = RegistryState::default();
        for (block, cpus) in blocks {
            state.insert_block(BlockSpec::new(name(block), *cpus)).unwrap();
        }
        state
    }

    #[test]
    fn test_insert_tracks_capacity() {
        let state = registry_with(&[("B1", 512), ("B2", 1024)]);
        assert_eq!(state.total_capacity(), 1536);
        assert_eq!(state.unused_capacity(), 1536);
        assert_eq!(state.len(), 2);
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_duplicate_rejected() {
        let mut state = registry_with(&[("B1", 512)]);
        let err = state.insert_block(BlockSpec::new(name("B1"), 512)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateBlock(name("B1")));
    }

    #[test]
    fn test_insert_booted_and_running_spec() {
        let mut spec = BlockSpec::new(name("B1"), 512);
        spec.state = BlockState::Initialized;
        spec.job = Some(job(7));
        spec.job_running = true;

        let state = BlockRegistry::from_specs([spec]).unwrap().state.into_inner();
        assert!(state.contains(BlockList::Booted, "B1"));
        assert!(state.contains(BlockList::JobRunning, "B1"));
        assert_eq!(state.unused_capacity(), 0);
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_job_running_membership_moves_capacity() {
        let mut state = registry_with(&[("B1", 512), ("B2", 256)]);

        state.start_job("B1", job(1)).unwrap();
        assert_eq!(state.unused_capacity(), 256);
        assert_eq!(state.get("B1").unwrap().running_job(), Some(job(1)));

        // Adding twice does not double count.
        assert!(!state.add_if_absent(BlockList::JobRunning, "B1"));
        assert_eq!(state.unused_capacity(), 256);

        assert!(state.remove_from(BlockList::JobRunning, "B1"));
        assert!(!state.remove_from(BlockList::JobRunning, "B1"));
        assert_eq!(state.unused_capacity(), 768);
        assert!(state.get("B1").unwrap().running_job().is_none());
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_add_job_running_requires_job() {
        let mut state = registry_with(&[("B1", 512)]);
        assert!(!state.add_if_absent(BlockList::JobRunning, "B1"));
        assert_eq!(state.unused_capacity(), 512);
    }

    #[test]
    fn test_start_job_rejects_second_job() {
        let mut state = registry_with(&[("B1", 512)]);
        state.start_job("B1", job(1)).unwrap();
        assert!(matches!(
            state.start_job("B1", job(2)),
            Err(RegistryError::Invariant(_))
        ));
        assert!(matches!(
            state.start_job("B9", job(2)),
            Err(RegistryError::UnknownBlock(_))
        ));
    }

    #[test]
    fn test_finish_job() {
        let mut state = registry_with(&[("B1", 512)]);
        state.start_job("B1", job(3)).unwrap();
        assert_eq!(state.finish_job("B1").unwrap(), Some(job(3)));
        assert!(state.get("B1").unwrap().job.is_none());
        assert_eq!(state.unused_capacity(), 512);
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_block_invalidates_handle() {
        let mut state = registry_with(&[("B1", 512)]);
        let old = state.get("B1").unwrap().handle();
        state.start_job("B1", job(1)).unwrap();

        state.remove_block("B1").unwrap();
        assert_eq!(state.total_capacity(), 0);
        assert_eq!(state.unused_capacity(), 0);
        assert!(state.resolve(&old).is_none());

        let new = state.insert_block(BlockSpec::new(name("B1"), 512)).unwrap();
        assert_ne!(old.generation, new.generation);
        assert!(state.resolve(&old).is_none());
        assert!(state.resolve(&new).is_some());
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_invariant_check_catches_booted_mismatch() {
        let mut state = registry_with(&[("B1", 512)]);
        state.get_mut("B1").unwrap().state = BlockState::Initialized;
        assert!(state.check_invariants().is_err());
        state.add_if_absent(BlockList::Booted, "B1");
        state.check_invariants().unwrap();
    }

    #[test]
    fn test_deferred_events_released_in_order() {
        let mut state = registry_with(&[("B1", 512), ("B2", 512)]);
        state.set_modifying("B1", true).unwrap();

        state.defer(BlockStateChanged::new(name("B1"), VendorBlockStatus::Booting));
        state.defer(BlockStateChanged::new(name("B2"), VendorBlockStatus::Free));
        state.defer(BlockStateChanged::new(name("B1"), VendorBlockStatus::Initialized));

        let ready = state.take_ready_deferred();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].block, name("B2"));
        assert!(state.has_deferred("B1"));

        state.set_modifying("B1", false).unwrap();
        let ready = state.take_ready_deferred();
        let statuses: Vec<_> = ready.iter().map(|e| e.status.clone()).collect();
        assert_eq!(
            statuses,
            vec![VendorBlockStatus::Booting, VendorBlockStatus::Initialized]
        );
        assert_eq!(state.deferred_len(), 0);
    }

    #[test]
    fn test_deferred_events_capped_per_block() {
        let mut state = registry_with(&[("B1", 512), ("B2", 512)]);
        state.set_modifying("B1", true).unwrap();

        state.defer(BlockStateChanged::new(name("B2"), VendorBlockStatus::Free));
        state.defer(BlockStateChanged::new(name("B1"), VendorBlockStatus::Booting));
        for _ in 0..MAX_DEFERRED_PER_BLOCK {
            state.defer(BlockStateChanged::new(name("B1"), VendorBlockStatus::Initialized));
        }

        // The oldest B1 event went; B2's event is untouched.
        assert_eq!(state.deferred_len(), MAX_DEFERRED_PER_BLOCK + 1);
        state.set_modifying("B1", false).unwrap();
        let ready = state.take_ready_deferred();
        assert_eq!(ready[0].block, name("B2"));
        assert!(ready[1..]
            .iter()
            .all(|e| e.status == VendorBlockStatus::Initialized));
    }

    #[test]
    fn test_touch_sets_update_time() {
        let mut state = RegistryState::default();
        assert!(state.last_block_update().is_none());
        state.touch();
        assert!(state.last_block_update().is_some());
    }
}
