//! # Task Handler Registry
//!
//! Maps validated task type tags to handlers. Registration happens before the
//! dispatcher starts; the dispatcher then shares the registry immutably, so a
//! new task type means registering a handler and nothing else.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tasker_session_queue::dispatch::{HandlerContext, HandlerError, TaskHandler, TaskHandlerRegistry};
//! use tasker_session_queue::messaging::{TaskEnvelope, TaskType};
//!
//! struct ResizeImage;
//!
//! #[async_trait]
//! impl TaskHandler for ResizeImage {
//!     async fn handle(
//!         &self,
//!         envelope: &TaskEnvelope,
//!         _ctx: &mut HandlerContext<'_>,
//!     ) -> Result<(), HandlerError> {
//!         println!("resizing {}", envelope.payload().locator);
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = TaskHandlerRegistry::new();
//! registry.register(TaskType::new("resize_image").unwrap(), Arc::new(ResizeImage));
//! assert!(registry.contains("resize_image"));
//! assert!(!registry.contains("crop_image"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::messaging::{TaskEnvelope, TaskType};
use crate::transport::{BrokerTransaction, SessionId, TransportError};

/// Outcome of a failed handler invocation
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The work could not be done now; roll back and let the transport redeliver
    #[error("Handler requested retry: {message}")]
    Retry { message: String },

    /// The handler panicked; treated like a retry
    #[error("Handler panicked: {message}")]
    Panicked { message: String },

    /// A transport call made by the handler inside the receive transaction failed
    #[error("Handler transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No handler registered for task type: {type_tag}")]
    UnknownTypeTag { type_tag: String },
}

impl HandlerError {
    pub fn retry(message: impl Into<String>) -> Self {
        Self::Retry {
            message: message.into(),
        }
    }
}

/// What a handler sees of the receive that delivered its envelope
///
/// Work done through `tx` commits or rolls back together with the dequeue.
pub struct HandlerContext<'a> {
    pub tx: &'a mut dyn BrokerTransaction,
    pub queue_name: &'a str,
    pub session_id: SessionId,
    pub message_id: u64,
    pub worker_id: usize,
}

impl std::fmt::Debug for HandlerContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("queue_name", &self.queue_name)
            .field("session_id", &self.session_id)
            .field("message_id", &self.message_id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Business logic for one task type
///
/// Returning an error rolls the receive back and the envelope is redelivered.
/// Handlers that prefer to drop a failing task log it and return `Ok`.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        envelope: &TaskEnvelope,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), HandlerError>;

    /// Name of this handler for logging purposes
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Task type tag to handler dictionary
#[derive(Clone, Default)]
pub struct TaskHandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for TaskHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandlerRegistry")
            .field("type_tags", &self.type_tags())
            .finish()
    }
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `type_tag`, returning the handler it replaced
    pub fn register(
        &mut self,
        type_tag: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Option<Arc<dyn TaskHandler>> {
        debug!(type_tag = %type_tag, handler = handler.name(), "📚 HANDLER_REGISTRY: Registered handler");
        let previous = self.handlers.insert(type_tag.clone(), handler);
        if previous.is_some() {
            warn!(type_tag = %type_tag, "📚 HANDLER_REGISTRY: Replaced existing handler");
        }
        previous
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.handlers.contains_key(type_tag)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered tags, sorted
    pub fn type_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.handlers.keys().map(|t| t.to_string()).collect();
        tags.sort();
        tags
    }

    /// Run the handler registered for the envelope's type tag
    pub async fn dispatch(
        &self,
        envelope: &TaskEnvelope,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        let handler = self
            .handlers
            .get(envelope.type_tag())
            .ok_or_else(|| HandlerError::UnknownTypeTag {
                type_tag: envelope.type_tag().to_string(),
            })?;
        handler.handle(envelope, ctx).await
    }
}
