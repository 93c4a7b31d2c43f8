//! Block records and the specs they are created from.

use std::path::Path;

use anyhow::{Context, Result};
use bgwatch_id::{BlockName, JobId, UserName};
use bgwatch_reconcile::BlockState;
use serde::Deserialize;

/// Identifies one incarnation of a block record.
///
/// A block that is removed and re-created under the same name gets a new
/// generation, so a stale handle no longer resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub name: BlockName,
    pub generation: u64,
}

/// Description of a block as handed over by the allocation subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockSpec {
    pub name: BlockName,

    /// Compute units the block represents.
    pub cpu_count: u32,

    #[serde(default)]
    pub state: BlockState,

    #[serde(default)]
    pub user: Option<UserName>,

    #[serde(default)]
    pub target_user: Option<UserName>,

    /// Job the block is assigned to.
    #[serde(default)]
    pub job: Option<JobId>,

    /// Whether `job` is already running on the block.
    #[serde(default)]
    pub job_running: bool,
}

impl BlockSpec {
    /// Create a spec for an idle block.
    pub fn new(name: BlockName, cpu_count: u32) -> Self {
        Self {
            name,
            cpu_count,
            state: BlockState::Unknown,
            user: None,
            target_user: None,
            job: None,
            job_running: false,
        }
    }

    /// Load a block inventory: a JSON array of specs.
    pub fn load_all(path: &Path) -> Result<Vec<BlockSpec>> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read block inventory {}", path.display()))?;
        let specs: Vec<BlockSpec> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse block inventory {}", path.display()))?;
        Ok(specs)
    }
}

/// One hardware partition as tracked by the scheduler.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub name: BlockName,
    pub(super) generation: u64,

    pub state: BlockState,

    /// A watched boot sequence is in progress.
    pub boot_outstanding: bool,

    /// Boots re-issued during the current boot sequence.
    pub boot_count: u32,

    /// Job the block is being prepared for or serving.
    pub job: Option<JobId>,

    /// Running job. Managed by the registry together with the job-running list.
    pub(super) running_job: Option<JobId>,

    /// User the block is currently set up for.
    pub user: Option<UserName>,

    /// User the block is being prepared for.
    pub target_user: Option<UserName>,

    pub cpu_count: u32,

    /// Another subsystem is in the middle of updating this block.
    pub(super) modifying: bool,
}

impl BlockRecord {
    pub(super) fn from_spec(spec: BlockSpec, generation: u64) -> Self {
        Self {
            name: spec.name,
            generation,
            state: spec.state,
            boot_outstanding: false,
            boot_count: 0,
            job: spec.job,
            running_job: None,
            user: spec.user,
            target_user: spec.target_user,
            cpu_count: spec.cpu_count,
            modifying: false,
        }
    }

    pub fn handle(&self) -> BlockHandle {
        BlockHandle {
            name: self.name.clone(),
            generation: self.generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Job currently running on the block, if its teardown is unprocessed.
    pub fn running_job(&self) -> Option<JobId> {
        self.running_job
    }

    pub fn is_modifying(&self) -> bool {
        self.modifying
    }
}
