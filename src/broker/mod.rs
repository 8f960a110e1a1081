// src/broker/mod.rs

//! The broker boundary: the traits a transport has to implement so the
//! dispatcher can drive it, plus the message type that crosses it.
//!
//! Only the operations the dispatcher needs are modelled. A connection creates
//! transacted sessions; a session creates consumers bound to a destination and
//! scopes commit/rollback of everything received through them.

use crate::core::errors::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use std::sync::Arc;

pub mod memory;

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Broker-assigned identifier.
    pub message_id: String,
    /// Application properties (headers), in the order they were set.
    pub properties: IndexMap<String, String>,
    /// The raw payload.
    pub body: Bytes,
    /// True if this message was delivered before and rolled back.
    pub redelivered: bool,
}

impl Message {
    pub fn new(message_id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: message_id.into(),
            properties: IndexMap::new(),
            body: body.into(),
            redelivered: false,
        }
    }

    /// Builder-style helper to attach a property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

/// Supplies connections given broker-specific configuration.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// A live link to the broker.
///
/// Receives only make progress while the connection is started. Stopping it
/// pauses delivery without invalidating its sessions; closing it is final.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn start(&self) -> Result<(), BrokerError>;

    async fn stop(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    /// Creates a new transacted session. Fails unless the connection is started.
    async fn create_session(&self) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

/// A transacted unit of work. Everything received through the session's
/// consumers since the last commit/rollback belongs to the current transaction.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn create_consumer(
        &self,
        destination: &str,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError>;

    async fn commit(&self) -> Result<(), BrokerError>;

    async fn rollback(&self) -> Result<(), BrokerError>;

    /// Closes the session. Uncommitted work is rolled back.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A consumer bound to one destination on one session.
#[async_trait]
pub trait MessageConsumer: Send {
    /// Waits, without timeout, for the next message. `Ok(None)` means the
    /// consumer was closed underneath the caller.
    async fn receive(&mut self) -> Result<Option<Message>, BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}
