//! # Dispatch
//!
//! Worker side of the queue: the dispatcher's worker pool, the handler registry
//! it routes to, and the operator's cleanup sweeper.

pub mod dispatcher;
pub mod handler_registry;
pub mod sweeper;

pub use dispatcher::{
    DispatchOutcome, Dispatcher, DispatcherStats, DispatcherStatsSnapshot, SessionClosePolicy,
};
pub use handler_registry::{HandlerContext, HandlerError, TaskHandler, TaskHandlerRegistry};
pub use sweeper::{CleanupSweeper, SweepReport};
