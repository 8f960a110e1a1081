// src/core/keys.rs

//! Routing keys and the extractors that derive them from messages.
//!
//! The dispatcher never interprets a key; it only attaches it to the message
//! before the hand-off so the handler can order work per key.

use crate::broker::Message;
use crate::core::errors::SequencerError;
use std::fmt;
use std::sync::Arc;

/// An ordering/routing key derived from a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey(Arc<str>);

impl MessageKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(Arc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageKey {
    fn from(key: &str) -> Self {
        MessageKey::new(key)
    }
}

impl From<String> for MessageKey {
    fn from(key: String) -> Self {
        MessageKey(Arc::from(key))
    }
}

/// A received message together with the key extracted from it. This is the
/// unit the dispatcher hands to the message handler.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedMessage {
    pub message: Message,
    pub key: MessageKey,
}

impl KeyedMessage {
    pub fn new(message: Message, key: MessageKey) -> Self {
        Self { message, key }
    }
}

/// Derives a key from a message. Implementations must not mutate or
/// acknowledge the message.
pub trait KeyExtractor: Send + Sync {
    fn extract_key(&self, message: &Message) -> Result<MessageKey, SequencerError>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&Message) -> Result<MessageKey, SequencerError> + Send + Sync,
{
    fn extract_key(&self, message: &Message) -> Result<MessageKey, SequencerError> {
        self(message)
    }
}

/// Uses the value of a message property as the key.
#[derive(Debug, Clone)]
pub struct PropertyKeyExtractor {
    property: String,
}

impl PropertyKeyExtractor {
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
        }
    }
}

impl KeyExtractor for PropertyKeyExtractor {
    fn extract_key(&self, message: &Message) -> Result<MessageKey, SequencerError> {
        message
            .property(&self.property)
            .map(MessageKey::new)
            .ok_or_else(|| {
                SequencerError::KeyExtraction(format!(
                    "message {} has no '{}' property",
                    message.message_id, self.property
                ))
            })
    }
}

/// Uses a top-level field of a JSON message body as the key. String fields
/// are used verbatim; numbers and booleans use their JSON representation.
#[derive(Debug, Clone)]
pub struct JsonFieldKeyExtractor {
    field: String,
}

impl JsonFieldKeyExtractor {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl KeyExtractor for JsonFieldKeyExtractor {
    fn extract_key(&self, message: &Message) -> Result<MessageKey, SequencerError> {
        let body = std::str::from_utf8(&message.body)?;
        let value: serde_json::Value = serde_json::from_str(body)?;
        match value.get(&self.field) {
            Some(serde_json::Value::String(s)) => Ok(MessageKey::new(s)),
            Some(v @ (serde_json::Value::Number(_) | serde_json::Value::Bool(_))) => {
                Ok(MessageKey::from(v.to_string()))
            }
            Some(_) => Err(SequencerError::KeyExtraction(format!(
                "field '{}' of message {} is not a scalar",
                self.field, message.message_id
            ))),
            None => Err(SequencerError::KeyExtraction(format!(
                "message {} has no '{}' field",
                message.message_id, self.field
            ))),
        }
    }
}
