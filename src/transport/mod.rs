//! # Dialog Transport
//!
//! Contract of the session-oriented transactional transport the queue is built
//! on, plus two implementations:
//!
//! - [`InMemoryBroker`] for tests and development
//! - [`PgBroker`] backed by PostgreSQL (feature `postgres`)

pub mod errors;
pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod traits;
pub mod types;

pub use errors::{TransportError, TransportResult};
pub use in_memory::{InMemoryBroker, InMemoryTransaction};
#[cfg(feature = "postgres")]
pub use postgres::{PgBroker, PgTransaction, ReapReport};
pub use traits::{BrokerTransaction, SessionRecordStore, Transport, TransportTransaction};
pub use types::{
    CloseMode, EndpointHandle, EndpointInfo, OpenRequest, ReceivedMessage, SessionId,
    SessionLifetime,
};
