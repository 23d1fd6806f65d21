//! # Envelope Error Types
//!
//! Codec failures. On the receive side every variant marks a poison message.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Invalid task type tag '{tag}': {reason}")]
    InvalidTypeTag { tag: String, reason: String },

    #[error("Claim-check locator must not be empty")]
    EmptyLocator,

    #[error("Malformed {message_type} body: {message}")]
    Malformed {
        message_type: String,
        message: String,
    },

    #[error("Encoded envelope is {size_bytes} bytes, limit is {limit_bytes} bytes")]
    TooLarge {
        size_bytes: usize,
        limit_bytes: usize,
    },

    #[error("Envelope serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EnvelopeError {
    pub fn invalid_type_tag(tag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTypeTag {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(message_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            message_type: message_type.into(),
            message: message.into(),
        }
    }
}

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;
