// src/core/mod.rs

//! The central module containing the dispatcher's building blocks: the
//! session pool, routing keys, the handler boundary and the worker pool.

pub mod errors;
pub mod handler;
pub mod keys;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod workers;

pub use errors::{BrokerError, SequencerError};
pub use handler::MessageHandler;
pub use keys::{KeyExtractor, KeyedMessage, MessageKey};
pub use lifecycle::LifecycleState;
pub use pool::{SessionLease, SessionPool};
