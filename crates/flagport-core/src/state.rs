//! Per-resource migration state machine
//!
//! Every resource walks `NotChecked → Exists | NotExists`, then through
//! creation and one patch cycle per destination environment. The
//! orchestrator advances a [`StateTracker`] at each step so an out-of-order
//! step surfaces as a [`StateError`] instead of a silent wrong request.

use crate::error::StateError;
use crate::types::ResourceType;
use serde::Serialize;

/// Lifecycle state of one migrated resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    /// Destination not queried yet
    NotChecked,
    /// Present in destination
    Exists,
    /// Absent from destination
    NotExists,
    /// Creation request in flight
    Create,
    /// Creation skipped (resource already there)
    Skip,
    /// Created by this run
    Created,
    /// Creation hit a key collision
    ConflictRetry,
    /// Creation failed for good
    Failed,
    /// Patch for an environment being prepared or sent
    PatchPending,
    /// Patch applied
    PatchApplied,
    /// Change submitted for approval instead
    ApprovalRequested,
    /// Patch rejected
    PatchFailed,
}

impl MigrationState {
    /// All states, in lifecycle order
    pub const ALL: [MigrationState; 12] = [
        MigrationState::NotChecked,
        MigrationState::Exists,
        MigrationState::NotExists,
        MigrationState::Create,
        MigrationState::Skip,
        MigrationState::Created,
        MigrationState::ConflictRetry,
        MigrationState::Failed,
        MigrationState::PatchPending,
        MigrationState::PatchApplied,
        MigrationState::ApprovalRequested,
        MigrationState::PatchFailed,
    ];

    /// Whether no further transition is possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(self).is_empty()
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: MigrationState) -> Vec<MigrationState> {
    use MigrationState::*;
    match from {
        NotChecked => vec![Exists, NotExists],
        Exists => vec![Skip],
        NotExists => vec![Create],
        Create => vec![Created, ConflictRetry, Failed],
        ConflictRetry => vec![Create, Skip, Failed],
        Skip | Created => vec![PatchPending],
        PatchPending => vec![PatchApplied, ApprovalRequested, PatchFailed],
        PatchApplied | ApprovalRequested | PatchFailed => vec![PatchPending],
        Failed => vec![],
    }
}

/// Validate a single transition
///
/// # Errors
/// `StateError` when `to` is not reachable from `from`
pub fn validate_transition(from: MigrationState, to: MigrationState) -> Result<(), StateError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateError { from, to })
    }
}

/// Current state of one resource
#[derive(Debug, Clone)]
pub struct StateTracker {
    resource_type: ResourceType,
    key: String,
    state: MigrationState,
}

impl StateTracker {
    /// Start tracking `key` in `NotChecked`
    #[must_use]
    pub fn new(resource_type: ResourceType, key: impl Into<String>) -> Self {
        Self {
            resource_type,
            key: key.into(),
            state: MigrationState::NotChecked,
        }
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> MigrationState {
        self.state
    }

    /// Move to `to`
    ///
    /// # Errors
    /// `StateError` on an illegal transition; the state is left unchanged
    pub fn advance(&mut self, to: MigrationState) -> Result<(), StateError> {
        validate_transition(self.state, to)?;
        tracing::trace!(
            resource = %self.resource_type,
            key = %self.key,
            from = ?self.state,
            to = ?to,
            "state transition"
        );
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lookup_branches() {
        assert!(validate_transition(MigrationState::NotChecked, MigrationState::Exists).is_ok());
        assert!(validate_transition(MigrationState::NotChecked, MigrationState::NotExists).is_ok());
        assert!(validate_transition(MigrationState::NotChecked, MigrationState::Create).is_err());
        assert!(validate_transition(MigrationState::Exists, MigrationState::Create).is_err());
    }

    #[test]
    fn conflict_loop_and_terminal_failure() {
        assert!(validate_transition(MigrationState::ConflictRetry, MigrationState::Create).is_ok());
        assert!(validate_transition(MigrationState::ConflictRetry, MigrationState::Skip).is_ok());
        assert!(MigrationState::Failed.is_terminal());
        assert!(!MigrationState::PatchFailed.is_terminal());
    }

    #[test]
    fn tracker_walks_a_created_flag_through_two_environments() {
        let mut tracker = StateTracker::new(ResourceType::Flag, "f1");
        for to in [
            MigrationState::NotExists,
            MigrationState::Create,
            MigrationState::ConflictRetry,
            MigrationState::Create,
            MigrationState::Created,
            MigrationState::PatchPending,
            MigrationState::PatchApplied,
            MigrationState::PatchPending,
            MigrationState::ApprovalRequested,
        ] {
            tracker.advance(to).unwrap();
        }
        assert_eq!(tracker.state(), MigrationState::ApprovalRequested);
    }

    #[test]
    fn tracker_rejects_and_keeps_state() {
        let mut tracker = StateTracker::new(ResourceType::Segment, "vip");
        let err = tracker.advance(MigrationState::PatchPending).unwrap_err();
        assert_eq!(err.from, MigrationState::NotChecked);
        assert_eq!(tracker.state(), MigrationState::NotChecked);
    }

    fn any_state() -> impl Strategy<Value = MigrationState> {
        proptest::sample::select(MigrationState::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_validation_matches_allowed_set(from in any_state(), to in any_state()) {
            let res = validate_transition(from, to);
            let allowed = allowed_transitions(from);
            prop_assert_eq!(res.is_ok(), allowed.contains(&to));
        }

        #[test]
        fn prop_never_returns_to_not_checked(from in any_state()) {
            prop_assert!(!allowed_transitions(from).contains(&MigrationState::NotChecked));
        }
    }
}
