//! # Messaging Module
//!
//! Task envelope codec: claim-check task descriptors to and from transport
//! message bodies.

pub mod envelope;
pub mod errors;

pub use envelope::{ClaimCheck, DialogError, EncodedEnvelope, MessageKind, TaskEnvelope, TaskType};
pub use errors::{EnvelopeError, EnvelopeResult};
