//! # System Constants
//!
//! Fixed transport properties and message type names shared by the codec,
//! the reference transports and the dispatcher.

use std::time::Duration;

/// Reserved message type names used by the transport itself
pub mod message_types {
    /// Prefix reserved for transport-generated messages. Task type tags may not use it.
    pub const SYSTEM_PREFIX: &str = "tasker/";

    /// Delivered to an endpoint when its peer ends the conversation
    pub const END_DIALOG: &str = "tasker/end_dialog";

    /// Delivered to an endpoint when the conversation fails (e.g. lifetime expired)
    pub const ERROR: &str = "tasker/error";
}

/// Transport limits and timings
pub mod transport {
    use super::Duration;

    /// Time a receiver-closed endpoint lingers before the transport reclaims it
    /// when its peer never answers the close. Owned by the transport.
    pub const RECLAIM_GRACE_PERIOD: Duration = Duration::from_secs(30 * 60);

    /// Maximum message body accepted by `send`
    pub const MAX_MESSAGE_BODY_BYTES: usize = 256 * 1024;

    /// Maximum length of a task type tag / message type name
    pub const MAX_TYPE_TAG_LENGTH: usize = 128;

    /// Error code carried by the error message sent on lifetime expiry
    pub const LIFETIME_EXPIRED_ERROR_CODE: i32 = -8489;

    /// Minimum spacing between expiry/reclaim passes of the database transport
    pub const REAP_INTERVAL: Duration = Duration::from_secs(1);

    /// Endpoints expired per reap pass
    pub const REAP_BATCH_SIZE: i64 = 500;
}

/// Defaults applied when configuration omits a value
pub mod defaults {
    pub const SESSION_LIFETIME_SECONDS: u64 = 60;
    pub const MAX_CONCURRENT_WORKERS: usize = 4;
    pub const RECEIVE_WAIT_MS: u64 = 5_000;
    pub const ERROR_BACKOFF_MS: u64 = 1_000;
    pub const POLL_INTERVAL_MS: u64 = 250;
    pub const MAX_CONNECTIONS: u32 = 10;
    pub const SWEEP_BATCH_SIZE: usize = 100;
    pub const CONFIG_PATH: &str = "config/tasker-queue.toml";
}
