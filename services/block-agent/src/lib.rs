//! bgwatch Block Agent Library
//!
//! The block agent keeps the scheduler's view of hardware partitions
//! ("blocks") consistent with the state changes pushed by the hardware
//! control service, and acts on what it sees: retrying boots, requeuing or
//! killing jobs whose block was lost, and handing booted blocks to users.
//!
//! ## Architecture
//!
//! ```text
//! RealTimeService
//! └── ConnectionManager   (subscription, connect-with-retry, receive loop)
//!     └── EventListener   (stale lookup, deferral, vendor status mapping)
//!         └── BlockReconciler  (transitions, side effects, boot retries)
//!             ├── BlockRegistry  (records, lists, capacity, one lock)
//!             ├── Scheduler      (boot, requeue, occupancy, errors)
//!             └── KillJobQueue   (drained by the kill worker)
//! ```
//!
//! ## Modules
//!
//! - `registry`: Shared block records, lists and capacity counter
//! - `reconciler`: Block state machine and boot-retry policy
//! - `listener`: Feed event handling
//! - `connection`: Event source trait and connection manager
//! - `source`: TCP and in-process event sources
//! - `service`: Start/stop lifecycle of the connection task

pub mod client;
pub mod config;
pub mod connection;
pub mod kill_queue;
pub mod listener;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod source;

// Re-export commonly used types
pub use client::SchedulerClient;
pub use connection::{
    ConnectionManager, ConnectionSession, EventSource, SourceError, DEFAULT_REPLAY_INTERVAL,
};
pub use kill_queue::{kill_job_queue, run_kill_worker, KillJobQueue, KillJobReceiver, KillJobRequest};
pub use listener::EventListener;
pub use reconciler::{BlockReconciler, ReconcileOutcome, ReconcilerConfig};
pub use registry::{
    BlockList, BlockRecord, BlockRegistry, BlockSpec, RegistryError, RegistryState,
    MAX_DEFERRED_PER_BLOCK,
};
pub use scheduler::{MockScheduler, Scheduler, SchedulerCall, SchedulerError};
pub use service::{RealTimeService, ServiceError};
pub use source::{channel_source, ChannelEventSource, ChannelFeed, TcpEventSource};
