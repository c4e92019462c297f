use proptest::prelude::*;
use tessera_task::state::{allowed_transitions, validate_transition};
use tessera_task::{StateError, TaskState};

fn any_state() -> impl Strategy<Value = TaskState> {
    prop_oneof![
        Just(TaskState::Created),
        Just(TaskState::CheckMemory),
        Just(TaskState::CheckDisk),
        Just(TaskState::CheckErrorMemo),
        Just(TaskState::FetchExternal),
        Just(TaskState::ApplyProcessors),
        Just(TaskState::PopulateCaches),
        Just(TaskState::Done),
        Just(TaskState::Failed),
        Just(TaskState::Cancelled),
    ]
}

#[test]
fn test_failure_exits() {
    assert!(validate_transition(TaskState::CheckErrorMemo, TaskState::Failed).is_ok());
    assert!(validate_transition(TaskState::FetchExternal, TaskState::Failed).is_ok());
    assert!(validate_transition(TaskState::CheckDisk, TaskState::Failed).is_ok());

    // Invalid
    assert!(validate_transition(TaskState::CheckMemory, TaskState::Failed).is_err());
    assert!(validate_transition(TaskState::PopulateCaches, TaskState::Failed).is_err());
}

#[test]
fn test_short_paths_to_done() {
    assert!(validate_transition(TaskState::CheckMemory, TaskState::Done).is_ok());
    assert!(validate_transition(TaskState::CheckDisk, TaskState::Done).is_ok());
    assert!(validate_transition(TaskState::CheckErrorMemo, TaskState::Done).is_err());
    assert!(validate_transition(TaskState::FetchExternal, TaskState::Done).is_err());
}

#[test]
fn test_illegal_transition_error() {
    let err = validate_transition(TaskState::Done, TaskState::CheckMemory).unwrap_err();
    let StateError::IllegalTransition { from, to } = err;
    assert_eq!(from, TaskState::Done);
    assert_eq!(to, TaskState::CheckMemory);
}

proptest! {
    #[test]
    fn prop_validation_matches_allowed(from in any_state(), to in any_state()) {
        let allowed = allowed_transitions(from);
        prop_assert_eq!(validate_transition(from, to).is_ok(), allowed.contains(&to));
    }

    #[test]
    fn prop_cancel_reachable_from_every_live_state(state in any_state()) {
        prop_assert_eq!(
            validate_transition(state, TaskState::Cancelled).is_ok(),
            !state.is_terminal()
        );
    }

    #[test]
    fn prop_no_transition_back_to_created(from in any_state()) {
        prop_assert!(validate_transition(from, TaskState::Created).is_err());
    }
}
