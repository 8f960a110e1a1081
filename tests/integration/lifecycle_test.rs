// tests/integration/lifecycle_test.rs

//! Tests for the lifecycle state machine.

use seqdispatch::core::errors::SequencerError;
use seqdispatch::core::lifecycle::{LifecycleAction, LifecycleState};

use LifecycleAction::*;
use LifecycleState::*;

#[test]
fn test_allowed_transitions() {
    assert_eq!(Created.transition(Start), Ok(Running));
    assert_eq!(Running.transition(Stop), Ok(Stopped));
    assert_eq!(Stopped.transition(Start), Ok(Running));
    for state in [Created, Running, Stopped] {
        assert_eq!(state.transition(Shutdown), Ok(ShutDown));
    }
}

#[test]
fn test_rejected_transitions_carry_state_and_action() {
    let rejected = [
        (Created, Stop),
        (Running, Start),
        (Stopped, Stop),
        (ShutDown, Start),
        (ShutDown, Stop),
        (ShutDown, Shutdown),
    ];
    for (state, action) in rejected {
        assert_eq!(
            state.transition(action),
            Err(SequencerError::InvalidTransition { state, action })
        );
    }
}

#[test]
fn test_only_shut_down_is_terminal() {
    assert!(ShutDown.is_terminal());
    assert!(![Created, Running, Stopped].iter().any(|s| s.is_terminal()));
}

#[test]
fn test_error_message_names_state_and_action() {
    let err = ShutDown.transition(Start).unwrap_err();
    assert_eq!(err.to_string(), "cannot start while shut_down");
}
