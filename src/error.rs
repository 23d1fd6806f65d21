//! # Crate Error Types
//!
//! Top-level error taxonomy for producers, dispatcher workers and the sweeper.
//! Layer-specific errors (`TransportError`, `EnvelopeError`, `HandlerError`,
//! `ConfigurationError`) convert into `TaskerError` at the component boundary.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::dispatch::HandlerError;
use crate::messaging::EnvelopeError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum TaskerError {
    /// open/send/receive/commit failed at the transport level. The enclosing
    /// transaction has been rolled back and nothing was observably created.
    #[error("Transport unavailable: {operation}: {source}")]
    TransportUnavailable {
        operation: String,
        #[source]
        source: TransportError,
    },

    /// Envelope could not be decoded or routed. Only surfaced by the
    /// standalone decode/dispatch helpers; the dispatcher swallows it.
    #[error("Poison message on queue {queue_name}: {reason}")]
    PoisonMessage { queue_name: String, reason: String },

    /// A handler returned an error; the receive was rolled back and the
    /// envelope will be redelivered.
    #[error("Handler failure for task type {type_tag}: {source}")]
    HandlerFailure {
        type_tag: String,
        #[source]
        source: HandlerError,
    },

    /// Two writers created a registry row for the same queue. Row locking
    /// prevents this; a store that reports it anyway surfaces it here.
    #[error("Session registry conflict for queue {queue_name}")]
    RegistryConflict { queue_name: String },

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Unknown queue route: {queue_name}")]
    UnknownRoute { queue_name: String },
}

impl TaskerError {
    pub fn transport(operation: impl Into<String>, source: TransportError) -> Self {
        Self::TransportUnavailable {
            operation: operation.into(),
            source,
        }
    }

    pub fn poison(queue_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PoisonMessage {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the whole enqueue or receive attempt can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable { .. } | Self::HandlerFailure { .. }
        )
    }
}

pub type TaskerResult<T> = std::result::Result<T, TaskerError>;
