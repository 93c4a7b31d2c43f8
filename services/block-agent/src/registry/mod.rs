//! Shared block registry.
//!
//! This module owns every piece of state the reconciler shares with the rest
//! of the scheduler:
//! - Block records by name (state, boot bookkeeping, occupancy)
//! - The booted list (blocks in INITIALIZED or ALLOCATED)
//! - The job-running list (blocks with a job whose teardown is unprocessed)
//! - The unused capacity counter
//!
//! All of it sits behind one lock. List membership and the capacity counter
//! are only changed together, through [`RegistryState`] methods.

mod record;
mod store;

pub use record::{BlockHandle, BlockRecord, BlockSpec};
pub use store::{BlockList, BlockRegistry, RegistryError, RegistryState, MAX_DEFERRED_PER_BLOCK};
