// src/core/errors.rs

//! Defines the error types shared by the dispatcher, the session pool and the
//! broker abstraction.

use crate::core::lifecycle::{LifecycleAction, LifecycleState};
use thiserror::Error;

/// Failures reported by a broker transport: connection, session or consumer level.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("connection is not started")]
    ConnectionNotStarted,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("session is closed")]
    SessionClosed,

    #[error("consumer is closed")]
    ConsumerClosed,

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// The main error enum for the dispatcher and its collaborators.
#[derive(Error, Debug, Clone)]
pub enum SequencerError {
    /// A broker-level failure. Inside the intake loop this is recovered locally.
    #[error("Broker Error: {0}")]
    Broker(#[from] BrokerError),

    /// The key extractor could not derive a key from a message.
    #[error("Key extraction failed: {0}")]
    KeyExtraction(String),

    /// The message handler failed in a way the intake loop cannot recover from.
    #[error("Message handler failed: {0}")]
    Handler(String),

    /// The message handler panicked while the intake loop was waiting on it.
    #[error("Message handler panicked: {0}")]
    HandlerPanicked(String),

    /// A lifecycle operation was requested from a state that does not allow it.
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: LifecycleState,
        action: LifecycleAction,
    },

    /// The worker pool no longer accepts tasks.
    #[error("worker pool is closed")]
    WorkerPoolClosed,

    /// The session pool was drained and hands out no more sessions.
    #[error("session pool is drained")]
    PoolDrained,

    /// A session id that the pool does not know about, or that is not leased.
    #[error("session {0} is not leased from this pool")]
    UnknownLease(u64),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl SequencerError {
    /// Returns true for failures the intake loop handles by abandoning the
    /// current session and carrying on with a fresh one.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SequencerError::Broker(_) | SequencerError::KeyExtraction(_)
        )
    }
}

impl PartialEq for SequencerError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SequencerError::Broker(e1), SequencerError::Broker(e2)) => e1 == e2,
            (SequencerError::KeyExtraction(s1), SequencerError::KeyExtraction(s2)) => s1 == s2,
            (SequencerError::Handler(s1), SequencerError::Handler(s2)) => s1 == s2,
            (SequencerError::HandlerPanicked(s1), SequencerError::HandlerPanicked(s2)) => s1 == s2,
            (
                SequencerError::InvalidTransition {
                    state: s1,
                    action: a1,
                },
                SequencerError::InvalidTransition {
                    state: s2,
                    action: a2,
                },
            ) => s1 == s2 && a1 == a2,
            (SequencerError::UnknownLease(i1), SequencerError::UnknownLease(i2)) => i1 == i2,
            (SequencerError::Internal(s1), SequencerError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<serde_json::Error> for SequencerError {
    fn from(e: serde_json::Error) -> Self {
        SequencerError::KeyExtraction(format!("invalid JSON body: {e}"))
    }
}

impl From<std::str::Utf8Error> for SequencerError {
    fn from(e: std::str::Utf8Error) -> Self {
        SequencerError::KeyExtraction(format!("body is not valid UTF-8: {e}"))
    }
}
