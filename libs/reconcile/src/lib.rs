//! Block state machine primitives.
//!
//! This library holds the deterministic part of block reconciliation: it
//! decides, but does not act. Key concepts:
//!
//! - **Block state**: the internal lifecycle state of a hardware partition.
//! - **Transition**: how a vendor-reported state is applied to the current
//!   one, including corrections for events the hardware service dropped.
//! - **Boot action**: what the boot-retry policy does once a state has been
//!   applied to a block with a boot outstanding.
//!
//! # Invariants
//!
//! - Every transition is exactly one of [`Transition`]'s variants
//! - Applying a transition always yields one of the seven [`BlockState`]s
//! - A block is never rebooted more than [`MAX_BOOT_RETRIES`] times per boot

use std::time::Duration;

use bgwatch_events::VendorBlockStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A state name could not be parsed.
    #[error("unknown block state: {0}")]
    UnknownState(String),
}

/// Number of times a failed boot is re-issued before the job is requeued.
pub const MAX_BOOT_RETRIES: u32 = 3;

/// Delay between attempts to (re)connect to the event feed.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Reason attached to jobs requeued after their block failed to boot.
pub const BOOT_FAILED_REASON: &str = "boot failed: block did not come up after retries";

// =============================================================================
// Block state
// =============================================================================

/// Lifecycle state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    /// Not yet observed.
    #[default]
    Unknown,
    Free,
    Booting,
    Initialized,
    Allocated,
    Terminating,
    Error,
}

impl BlockState {
    /// All states, in declaration order.
    pub const ALL: [BlockState; 7] = [
        BlockState::Unknown,
        BlockState::Free,
        BlockState::Booting,
        BlockState::Initialized,
        BlockState::Allocated,
        BlockState::Terminating,
        BlockState::Error,
    ];

    /// Maps a vendor status to an internal state.
    ///
    /// Unrecognized vendor codes map to [`BlockState::Error`].
    pub fn from_vendor(status: &VendorBlockStatus) -> Self {
        match status {
            VendorBlockStatus::Allocated => BlockState::Allocated,
            VendorBlockStatus::Booting => BlockState::Booting,
            VendorBlockStatus::Free => BlockState::Free,
            VendorBlockStatus::Initialized => BlockState::Initialized,
            VendorBlockStatus::Terminating => BlockState::Terminating,
            VendorBlockStatus::Other(_) => BlockState::Error,
        }
    }

    /// Returns true for states in which the block belongs in the booted list.
    pub fn is_booted(&self) -> bool {
        matches!(self, BlockState::Initialized | BlockState::Allocated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockState::Unknown => "unknown",
            BlockState::Free => "free",
            BlockState::Booting => "booting",
            BlockState::Initialized => "initialized",
            BlockState::Allocated => "allocated",
            BlockState::Terminating => "terminating",
            BlockState::Error => "error",
        }
    }
}

impl std::fmt::Display for BlockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BlockState {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BlockState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ReconcileError::UnknownState(s.to_string()))
    }
}

// =============================================================================
// Transitions
// =============================================================================

/// How a reported state is applied to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Apply the reported state as is.
    Direct(BlockState),

    /// The block reported FREE without passing through TERMINATING.
    /// Run the block-lost procedure, then land on FREE.
    MissedDeallocation,

    /// A booted block reported BOOTING: someone rebooted it behind our back.
    /// Reset the target user to the occupying user, then apply BOOTING.
    MissedReboot,

    /// TERMINATING followed by BOOTING. The hardware service emits this
    /// spuriously; keep the current state.
    IgnoredQuirk,
}

impl Transition {
    /// Classifies a reported state against the current one.
    ///
    /// Rules are checked in priority order: missed deallocation, missed
    /// reboot, the known quirk, then a direct transition.
    pub fn classify(current: BlockState, reported: BlockState) -> Self {
        match (current, reported) {
            (BlockState::Terminating | BlockState::Error, BlockState::Free) => {
                Transition::Direct(BlockState::Free)
            }
            (_, BlockState::Free) => Transition::MissedDeallocation,
            (BlockState::Initialized | BlockState::Allocated, BlockState::Booting) => {
                Transition::MissedReboot
            }
            (BlockState::Terminating, BlockState::Booting) => Transition::IgnoredQuirk,
            (_, reported) => Transition::Direct(reported),
        }
    }

    /// State the block holds once the transition is applied.
    pub fn resulting_state(&self, current: BlockState) -> BlockState {
        match self {
            Transition::Direct(state) => *state,
            Transition::MissedDeallocation => BlockState::Free,
            Transition::MissedReboot => BlockState::Booting,
            Transition::IgnoredQuirk => current,
        }
    }

    /// Returns true if the block-lost procedure runs for this transition.
    pub fn runs_block_lost(&self) -> bool {
        matches!(
            self,
            Transition::MissedDeallocation | Transition::Direct(BlockState::Terminating)
        )
    }

    /// Returns true if the transition corrected or dropped the reported state.
    pub fn is_correction(&self) -> bool {
        !matches!(self, Transition::Direct(_))
    }
}

// =============================================================================
// Boot retry policy
// =============================================================================

/// What the boot-retry policy does for a block with a boot outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootAction {
    /// Boot in progress: make sure the block is set up for the target user
    /// and flag the attached job as configuring.
    CheckTarget,

    /// Error during boot: the hardware is expected to recover to FREE.
    AwaitRecovery,

    /// Boot failed, retries left: re-issue the boot as attempt `attempt`.
    Retry { attempt: u32 },

    /// Boot failed and retries are exhausted: requeue the job and release
    /// the block.
    GiveUp,

    /// Boot succeeded: hand the block to its target user.
    Ready,

    /// Block is deallocating mid-boot: wait for FREE.
    AwaitFree,

    /// Nothing to do for this state.
    Ignore,
}

impl BootAction {
    /// Decides the boot action for a block in `state` that has already been
    /// rebooted `boot_count` times.
    pub fn decide(state: BlockState, boot_count: u32, max_retries: u32) -> Self {
        match state {
            BlockState::Booting => BootAction::CheckTarget,
            BlockState::Error => BootAction::AwaitRecovery,
            BlockState::Free if boot_count < max_retries => BootAction::Retry {
                attempt: boot_count + 1,
            },
            BlockState::Free => BootAction::GiveUp,
            BlockState::Initialized | BlockState::Allocated => BootAction::Ready,
            BlockState::Terminating => BootAction::AwaitFree,
            BlockState::Unknown => BootAction::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(VendorBlockStatus::Allocated, BlockState::Allocated)]
    #[case(VendorBlockStatus::Booting, BlockState::Booting)]
    #[case(VendorBlockStatus::Free, BlockState::Free)]
    #[case(VendorBlockStatus::Initialized, BlockState::Initialized)]
    #[case(VendorBlockStatus::Terminating, BlockState::Terminating)]
    #[case(VendorBlockStatus::Other("R".to_string()), BlockState::Error)]
    #[case(VendorBlockStatus::Other(String::new()), BlockState::Error)]
    fn test_vendor_mapping(#[case] vendor: VendorBlockStatus, #[case] expected: BlockState) {
        assert_eq!(BlockState::from_vendor(&vendor), expected);
    }

    #[rstest]
    #[case(BlockState::Allocated, BlockState::Free, Transition::MissedDeallocation)]
    #[case(BlockState::Booting, BlockState::Free, Transition::MissedDeallocation)]
    #[case(BlockState::Unknown, BlockState::Free, Transition::MissedDeallocation)]
    #[case(BlockState::Free, BlockState::Free, Transition::MissedDeallocation)]
    #[case(BlockState::Terminating, BlockState::Free, Transition::Direct(BlockState::Free))]
    #[case(BlockState::Error, BlockState::Free, Transition::Direct(BlockState::Free))]
    #[case(BlockState::Initialized, BlockState::Booting, Transition::MissedReboot)]
    #[case(BlockState::Allocated, BlockState::Booting, Transition::MissedReboot)]
    #[case(BlockState::Terminating, BlockState::Booting, Transition::IgnoredQuirk)]
    #[case(BlockState::Free, BlockState::Booting, Transition::Direct(BlockState::Booting))]
    #[case(BlockState::Booting, BlockState::Initialized, Transition::Direct(BlockState::Initialized))]
    fn test_classify(
        #[case] current: BlockState,
        #[case] reported: BlockState,
        #[case] expected: Transition,
    ) {
        assert_eq!(Transition::classify(current, reported), expected);
    }

    #[test]
    fn test_quirk_keeps_current_state() {
        let t = Transition::classify(BlockState::Terminating, BlockState::Booting);
        assert_eq!(t.resulting_state(BlockState::Terminating), BlockState::Terminating);
        assert!(!t.runs_block_lost());
        assert!(t.is_correction());
    }

    #[test]
    fn test_block_lost_runs_for_terminating_and_missed_dealloc() {
        assert!(Transition::MissedDeallocation.runs_block_lost());
        assert!(Transition::Direct(BlockState::Terminating).runs_block_lost());
        assert!(!Transition::Direct(BlockState::Free).runs_block_lost());
        assert!(!Transition::MissedReboot.runs_block_lost());
    }

    #[test]
    fn test_boot_action_retry_bound() {
        assert_eq!(
            BootAction::decide(BlockState::Free, 0, MAX_BOOT_RETRIES),
            BootAction::Retry { attempt: 1 }
        );
        assert_eq!(
            BootAction::decide(BlockState::Free, MAX_BOOT_RETRIES - 1, MAX_BOOT_RETRIES),
            BootAction::Retry {
                attempt: MAX_BOOT_RETRIES
            }
        );
        assert_eq!(
            BootAction::decide(BlockState::Free, MAX_BOOT_RETRIES, MAX_BOOT_RETRIES),
            BootAction::GiveUp
        );
    }

    #[rstest]
    #[case(BlockState::Booting, BootAction::CheckTarget)]
    #[case(BlockState::Error, BootAction::AwaitRecovery)]
    #[case(BlockState::Initialized, BootAction::Ready)]
    #[case(BlockState::Allocated, BootAction::Ready)]
    #[case(BlockState::Terminating, BootAction::AwaitFree)]
    #[case(BlockState::Unknown, BootAction::Ignore)]
    fn test_boot_action_by_state(#[case] state: BlockState, #[case] expected: BootAction) {
        assert_eq!(BootAction::decide(state, 0, MAX_BOOT_RETRIES), expected);
    }

    #[test]
    fn test_state_parse_roundtrip() {
        for state in BlockState::ALL {
            assert_eq!(state.as_str().parse::<BlockState>().unwrap(), state);
        }
        assert_eq!(
            "rebooting".parse::<BlockState>(),
            Err(ReconcileError::UnknownState("rebooting".to_string()))
        );
        assert_eq!(
            serde_json::to_string(&BlockState::Terminating).unwrap(),
            "\"terminating\""
        );
    }

    fn any_state() -> impl Strategy<Value = BlockState> {
        proptest::sample::select(BlockState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_transitions_land_on_enumerated_state(current in any_state(), reported in any_state()) {
            let t = Transition::classify(current, reported);
            let next = t.resulting_state(current);
            prop_assert!(BlockState::ALL.contains(&next));
            if t == Transition::IgnoredQuirk {
                prop_assert_eq!(next, current);
            } else {
                prop_assert_eq!(next, reported);
            }
        }

        #[test]
        fn prop_never_retries_past_bound(count in 0u32..10) {
            match BootAction::decide(BlockState::Free, count, MAX_BOOT_RETRIES) {
                BootAction::Retry { attempt } => prop_assert!(attempt <= MAX_BOOT_RETRIES),
                BootAction::GiveUp => prop_assert!(count >= MAX_BOOT_RETRIES),
                other => prop_assert!(false, "unexpected action {:?}", other),
            }
        }
    }
}
