//! # Task Envelope Codec
//!
//! A task envelope is the only thing that crosses the transport: a type tag
//! selecting the handler and a claim-check pointing at data stored elsewhere.
//! The type tag travels as the transport message type and the claim-check as a
//! small JSON body.
//!
//! Inbound messages decode into the closed [`MessageKind`] set: task envelopes
//! plus the two messages the transport generates itself.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::errors::{EnvelopeError, EnvelopeResult};
use crate::constants::{message_types, transport as limits};

/// Validated task type tag
///
/// 1 to 128 characters from `[A-Za-z0-9_.:/-]`, starting with a letter, and
/// never inside the transport's reserved namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskType(String);

impl TaskType {
    pub fn new(tag: impl Into<String>) -> EnvelopeResult<Self> {
        let tag = tag.into();
        if tag.is_empty() || tag.len() > limits::MAX_TYPE_TAG_LENGTH {
            return Err(EnvelopeError::invalid_type_tag(
                tag,
                "must be between 1 and 128 characters",
            ));
        }
        if !tag.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(EnvelopeError::invalid_type_tag(tag, "must start with a letter"));
        }
        if let Some(bad) = tag
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '/' | '-')))
        {
            return Err(EnvelopeError::invalid_type_tag(
                tag.clone(),
                format!("contains invalid character '{bad}'"),
            ));
        }
        if tag.starts_with(message_types::SYSTEM_PREFIX) {
            return Err(EnvelopeError::invalid_type_tag(
                tag,
                "uses the reserved transport prefix",
            ));
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Registries look handlers up by the raw tag string
impl std::borrow::Borrow<str> for TaskType {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for TaskType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaskType {
    type Error = EnvelopeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.0
    }
}

/// Claim-check payload: where the task data lives, plus small routing hints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimCheck {
    /// Locator of the externally stored task data (URI, row key, object path)
    pub locator: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl ClaimCheck {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Immutable unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnvelope {
    type_tag: TaskType,
    payload: ClaimCheck,
}

/// Transport-ready form of an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEnvelope {
    pub message_type: String,
    pub body: Vec<u8>,
}

impl TaskEnvelope {
    pub fn new(type_tag: TaskType, payload: ClaimCheck) -> Self {
        Self { type_tag, payload }
    }

    /// Build an envelope from a raw tag, validating it
    pub fn for_tag(type_tag: &str, payload: ClaimCheck) -> EnvelopeResult<Self> {
        Ok(Self::new(TaskType::new(type_tag)?, payload))
    }

    pub fn type_tag(&self) -> &TaskType {
        &self.type_tag
    }

    pub fn payload(&self) -> &ClaimCheck {
        &self.payload
    }

    /// Encode for the transport, refusing bodies over `limit_bytes`
    pub fn encode(&self, limit_bytes: usize) -> EnvelopeResult<EncodedEnvelope> {
        if self.payload.locator.is_empty() {
            return Err(EnvelopeError::EmptyLocator);
        }
        let body = serde_json::to_vec(&self.payload)?;
        if body.len() > limit_bytes {
            return Err(EnvelopeError::TooLarge {
                size_bytes: body.len(),
                limit_bytes,
            });
        }
        Ok(EncodedEnvelope {
            message_type: self.type_tag.as_str().to_string(),
            body,
        })
    }

    /// Decode a task message received from the transport
    pub fn decode(message_type: &str, body: &[u8]) -> EnvelopeResult<Self> {
        let type_tag = TaskType::new(message_type)?;
        let payload: ClaimCheck = serde_json::from_slice(body)
            .map_err(|e| EnvelopeError::malformed(message_type, e.to_string()))?;
        if payload.locator.is_empty() {
            return Err(EnvelopeError::EmptyLocator);
        }
        Ok(Self { type_tag, payload })
    }
}

/// Error carried by a transport error message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogError {
    pub code: i32,
    pub description: String,
}

/// Everything a receiver can take off a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Task(TaskEnvelope),
    /// The peer ended the conversation
    EndDialog,
    /// The transport failed the conversation
    Error(DialogError),
}

impl MessageKind {
    pub fn decode(message_type: &str, body: &[u8]) -> EnvelopeResult<Self> {
        match message_type {
            message_types::END_DIALOG => Ok(Self::EndDialog),
            message_types::ERROR => {
                let error: DialogError = serde_json::from_slice(body)
                    .map_err(|e| EnvelopeError::malformed(message_type, e.to_string()))?;
                Ok(Self::Error(error))
            }
            _ => TaskEnvelope::decode(message_type, body).map(Self::Task),
        }
    }
}
