//! # Session Management
//!
//! Producer-side conversation handling: the registry of reusable
//! conversations and the lifecycle manager that hands out send handles.

pub mod lifecycle;
pub mod registry;

pub use lifecycle::{RouteTable, SendHandle, SessionLease, SessionLifecycleManager, SessionStrategy};
pub use registry::SessionRecord;
