//! Configuration for the block agent.
//!
//! The retry interval and boot retry bound are fixed constants in
//! `bgwatch_reconcile`, not configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bgwatch_id::UserName;

/// Block agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address of the hardware control service's real-time feed.
    pub event_server_addr: String,

    /// Scheduler API URL.
    pub scheduler_url: String,

    /// JSON file listing the blocks to track.
    pub inventory_path: PathBuf,

    /// Account that owns blocks no job is using.
    pub idle_user: UserName,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Interval in seconds between replays of deferred block events.
    pub deferred_replay_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let event_server_addr = std::env::var("BGWATCH_EVENT_SERVER_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:32061".to_string());

        let scheduler_url = std::env::var("BGWATCH_SCHEDULER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:6820".to_string());

        let inventory_path = std::env::var("BGWATCH_INVENTORY_PATH")
            .unwrap_or_else(|_| "/etc/bgwatch/blocks.json".to_string())
            .into();

        let idle_user = std::env::var("BGWATCH_IDLE_USER").unwrap_or_else(|_| "slurm".to_string());
        let idle_user = UserName::parse(&idle_user).context("invalid BGWATCH_IDLE_USER")?;

        let log_level = std::env::var("BGWATCH_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let deferred_replay_interval_secs = std::env::var("BGWATCH_DEFERRED_REPLAY_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Ok(Self {
            event_server_addr,
            scheduler_url,
            inventory_path,
            idle_user,
            log_level,
            deferred_replay_interval_secs,
        })
    }
}
