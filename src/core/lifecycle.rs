// src/core/lifecycle.rs

//! The dispatcher's lifecycle state machine.
//!
//! ```text
//! Created --start--> Running --stop--> Stopped --start--> Running
//!    |                  |                 |
//!    +-----------------shutdown-----------+--> ShutDown (terminal)
//! ```

use crate::core::errors::SequencerError;
use strum_macros::{Display, IntoStaticStr};

/// The state of a dispatcher. Only [`LifecycleState::ShutDown`] is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Running,
    Stopped,
    ShutDown,
}

/// A requested lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleAction {
    Start,
    Stop,
    Shutdown,
}

impl LifecycleState {
    /// Returns the state reached by applying `action`, or an
    /// [`SequencerError::InvalidTransition`] if `action` is not allowed from here.
    pub fn transition(self, action: LifecycleAction) -> Result<LifecycleState, SequencerError> {
        use LifecycleAction::*;
        use LifecycleState::*;

        match (self, action) {
            (Created | Stopped, Start) => Ok(Running),
            (Running, Stop) => Ok(Stopped),
            (Created | Running | Stopped, Shutdown) => Ok(ShutDown),
            (state, action) => Err(SequencerError::InvalidTransition { state, action }),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::ShutDown
    }
}
