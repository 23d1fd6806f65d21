#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Session Queue
//!
//! Fire-and-forget work queue layered on a session-oriented, transactional
//! dialog transport.
//!
//! ## Overview
//!
//! Producers enqueue claim-check task envelopes onto named queues. Every
//! message travels on a conversation (session) between two endpoints, and the
//! transport charges resources per conversation, so the core's job is keeping
//! conversations from leaking: producers pick a session strategy, workers close
//! drained conversations inside the same transaction that consumed their last
//! message, and an operator sweeper reclaims whatever is left.
//!
//! ## Module Organization
//!
//! - [`session`] - Session lifecycle manager and the persisted session registry
//! - [`dispatch`] - Worker pool, task handler registry and cleanup sweeper
//! - [`messaging`] - Task envelope codec
//! - [`transport`] - Dialog transport traits plus in-memory and PostgreSQL brokers
//! - [`state_machine`] - Conversation endpoint states
//! - [`bootstrap`] - Wiring a configured system together
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tasker_session_queue::config::QueueRoute;
//! use tasker_session_queue::messaging::{ClaimCheck, TaskEnvelope};
//! use tasker_session_queue::session::{RouteTable, SessionLifecycleManager, SessionStrategy};
//! use tasker_session_queue::transport::InMemoryBroker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let route = QueueRoute::new("orders", "orders_producer", "orders_worker", "task_contract");
//! let broker = InMemoryBroker::new();
//! broker.ensure_route(&route);
//!
//! let producer = SessionLifecycleManager::new(
//!     Arc::new(broker),
//!     Arc::new(RouteTable::new([route])),
//!     false,
//!     tasker_session_queue::constants::transport::MAX_MESSAGE_BODY_BYTES,
//! );
//! let envelope = TaskEnvelope::for_tag("ship_order", ClaimCheck::new("orders/42"))?;
//! producer
//!     .enqueue("orders", SessionStrategy::time_boxed_seconds(60), &[envelope])
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                   # Unit and in-memory integration tests
//! cargo test -- --ignored      # PostgreSQL transport tests (needs DATABASE_URL)
//! ```

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod session;
pub mod state_machine;
pub mod transport;

pub use bootstrap::{QueueSystem, SystemStatus};
pub use config::{ConfigManager, QueueRoute, TaskerQueueConfig};
pub use dispatch::{
    CleanupSweeper, DispatchOutcome, Dispatcher, HandlerContext, HandlerError, SweepReport,
    TaskHandler, TaskHandlerRegistry,
};
pub use error::{TaskerError, TaskerResult};
pub use messaging::{ClaimCheck, TaskEnvelope, TaskType};
pub use session::{SessionLifecycleManager, SessionRecord, SessionStrategy};
pub use state_machine::{EndpointRole, EndpointState};
pub use transport::{InMemoryBroker, Transport};
