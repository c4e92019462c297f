//! Retrieval task states

use crate::error::StateError;
use std::fmt::{self, Display, Formatter};

/// Where a retrieval task is in its lookup/fetch/populate protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Constructed, not yet started
    Created,
    /// Looking up the result key in memory
    CheckMemory,
    /// Looking up result then source key on disk
    CheckDisk,
    /// Consulting the failure memo
    CheckErrorMemo,
    /// Fetching and decoding from the external source
    FetchExternal,
    /// Running the processor chain
    ApplyProcessors,
    /// Writing memory and disk tiers
    PopulateCaches,
    /// Resolved with an artifact
    Done,
    /// Resolved with a failure
    Failed,
    /// Abandoned; nothing is delivered
    Cancelled,
}

impl TaskState {
    /// Whether no further transition is possible
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::CheckMemory => "CHECK_MEMORY",
            Self::CheckDisk => "CHECK_DISK",
            Self::CheckErrorMemo => "CHECK_ERROR_MEMO",
            Self::FetchExternal => "FETCH_EXTERNAL",
            Self::ApplyProcessors => "APPLY_PROCESSORS",
            Self::PopulateCaches => "POPULATE_CACHES",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Validates a state transition.
///
/// # Errors
/// Returns `StateError::IllegalTransition` if `to` is not reachable from `from`
pub fn validate_transition(from: TaskState, to: TaskState) -> Result<(), StateError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(StateError::IllegalTransition { from, to })
    }
}

/// States reachable in one step from `from`
#[must_use]
pub fn allowed_transitions(from: TaskState) -> Vec<TaskState> {
    use TaskState::*;
    match from {
        Created => vec![CheckMemory, Cancelled],
        CheckMemory => vec![CheckDisk, Done, Cancelled],
        // disk-tier decode can exhaust memory even after the retry
        CheckDisk => vec![CheckErrorMemo, Done, Failed, Cancelled],
        CheckErrorMemo => vec![FetchExternal, Failed, Cancelled],
        FetchExternal => vec![ApplyProcessors, Failed, Cancelled],
        ApplyProcessors => vec![PopulateCaches, Cancelled],
        PopulateCaches => vec![Done, Cancelled],
        Done | Failed | Cancelled => vec![],
    }
}

fn allowed(from: TaskState, to: TaskState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        use TaskState::*;
        let path = [
            Created,
            CheckMemory,
            CheckDisk,
            CheckErrorMemo,
            FetchExternal,
            ApplyProcessors,
            PopulateCaches,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{:?}", pair);
        }
    }

    #[test]
    fn every_live_state_can_cancel() {
        use TaskState::*;
        for state in [
            Created,
            CheckMemory,
            CheckDisk,
            CheckErrorMemo,
            FetchExternal,
            ApplyProcessors,
            PopulateCaches,
        ] {
            assert!(validate_transition(state, Cancelled).is_ok(), "{state}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for state in [TaskState::Done, TaskState::Failed, TaskState::Cancelled] {
            assert!(state.is_terminal());
            assert!(allowed_transitions(state).is_empty());
        }
    }

    #[test]
    fn illegal_transition_rejected() {
        let err = validate_transition(TaskState::Created, TaskState::FetchExternal).unwrap_err();
        assert!(matches!(err, StateError::IllegalTransition { .. }));
        assert!(validate_transition(TaskState::ApplyProcessors, TaskState::Failed).is_err());
    }
}
