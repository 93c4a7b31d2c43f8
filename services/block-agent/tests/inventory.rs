//! Integration tests for loading the block inventory.

use std::io::Write;

use bgwatch_agent::{BlockList, BlockRegistry, BlockSpec};
use bgwatch_reconcile::BlockState;

#[tokio::test]
async fn test_load_inventory_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[
            {{"name": "R00-M0", "cpu_count": 512}},
            {{"name": "R00-M1", "cpu_count": 512, "state": "initialized",
              "user": "alice", "target_user": "alice", "job": 42, "job_running": true}}
        ]"#
    )
    .unwrap();

    let specs = BlockSpec::load_all(file.path()).unwrap();
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[0].state, BlockState::Unknown);

    let registry = BlockRegistry::from_specs(specs).unwrap();
    let state = registry.lock().await;
    assert_eq!(state.total_capacity(), 1024);
    assert_eq!(state.unused_capacity(), 512);
    assert!(state.contains(BlockList::Booted, "R00-M1"));
    assert!(state.contains(BlockList::JobRunning, "R00-M1"));
    state.check_invariants().unwrap();
}

#[test]
fn test_invalid_inventory_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"[{{"name": "bad name!", "cpu_count": 1}}]"#).unwrap();

    let err = BlockSpec::load_all(file.path()).unwrap_err();
    assert!(err.to_string().contains("failed to parse block inventory"));
}

#[test]
fn test_missing_inventory_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = BlockSpec::load_all(&dir.path().join("blocks.json")).unwrap_err();
    assert!(err.to_string().contains("failed to read block inventory"));
}
