// src/core/handler/mod.rs

//! The message-handling boundary of the dispatcher.
//!
//! The intake loop calls [`MessageHandler::on_message`] once per received
//! message, in delivery order, and does not receive the next message until the
//! call returns. What the handler does afterwards (process inline, fan out to
//! the worker pool, hold the session open for a deferred commit) is up to it,
//! as long as every lease it is given is eventually settled.

use crate::core::errors::SequencerError;
use crate::core::keys::KeyedMessage;
use crate::core::pool::SessionLease;
use crate::core::workers::WorkerPool;
use async_trait::async_trait;

pub mod key_sequenced;

pub use key_sequenced::{KeySequencedHandler, MessageProcessor};

#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Takes ownership of a received message and of the lease on the session
    /// it was received with.
    ///
    /// A recoverable error (see [`SequencerError::is_recoverable`]) is logged by
    /// the intake loop, which then carries on; any other error shuts the
    /// dispatcher down.
    async fn on_message(
        &self,
        message: KeyedMessage,
        lease: SessionLease,
        workers: &WorkerPool,
    ) -> Result<(), SequencerError>;

    /// Releases whatever the handler still holds. Called once, while the
    /// dispatcher shuts down and before its sessions are closed.
    async fn shutdown(&self);
}
