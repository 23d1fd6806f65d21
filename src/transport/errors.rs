//! # Transport Error Types
//!
//! Structured errors raised by transport implementations. Every variant aborts
//! the enclosing transaction; callers map them onto `TaskerError` at the
//! component boundary.

use thiserror::Error;

use super::types::EndpointHandle;
use crate::state_machine::EndpointState;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport unavailable: {message}")]
    Unavailable { message: String },

    #[error("Database query error: {operation}: {message}")]
    DatabaseQuery { operation: String, message: String },

    #[error("Service not found: {service_name}")]
    ServiceNotFound { service_name: String },

    #[error("Conversation endpoint not found: {handle}")]
    EndpointNotFound { handle: EndpointHandle },

    #[error("Conversation {handle} is {state} and cannot accept messages")]
    DialogClosed {
        handle: EndpointHandle,
        state: EndpointState,
    },

    #[error("Invalid message type '{message_type}': {reason}")]
    InvalidMessageType {
        message_type: String,
        reason: String,
    },

    #[error("Message too large: {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    MessageTooLarge {
        size_bytes: usize,
        limit_bytes: usize,
    },

    #[error("Session record already exists for queue: {queue_name}")]
    RecordExists { queue_name: String },

    #[error("Session record not found for queue: {queue_name}")]
    RecordNotFound { queue_name: String },

    #[error("Transaction already finished")]
    TransactionFinished,

    #[error("Internal transport error: {message}")]
    Internal { message: String },
}

impl TransportError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn database_query(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DatabaseQuery {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn service_not_found(service_name: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            service_name: service_name.into(),
        }
    }

    pub fn endpoint_not_found(handle: EndpointHandle) -> Self {
        Self::EndpointNotFound { handle }
    }

    pub fn dialog_closed(handle: EndpointHandle, state: EndpointState) -> Self {
        Self::DialogClosed { handle, state }
    }

    pub fn invalid_message_type(message_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMessageType {
            message_type: message_type.into(),
            reason: reason.into(),
        }
    }

    pub fn record_exists(queue_name: impl Into<String>) -> Self {
        Self::RecordExists {
            queue_name: queue_name.into(),
        }
    }

    pub fn record_not_found(queue_name: impl Into<String>) -> Self {
        Self::RecordNotFound {
            queue_name: queue_name.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for TransportError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                TransportError::database_query("database", db_err.to_string())
            }
            sqlx::Error::PoolTimedOut => TransportError::unavailable("database pool timed out"),
            sqlx::Error::PoolClosed => TransportError::unavailable("database pool is closed"),
            sqlx::Error::Io(io_err) => TransportError::unavailable(io_err.to_string()),
            _ => TransportError::database_query("query", err.to_string()),
        }
    }
}

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
