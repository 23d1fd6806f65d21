//! # Transport Types
//!
//! Opaque identifiers and request/response values exchanged with a transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::state_machine::{EndpointRole, EndpointState};

/// Opaque handle of one side of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointHandle(Uuid);

impl EndpointHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EndpointHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EndpointHandle {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier shared by both endpoints of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifetime bound requested when opening a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifetime {
    /// The transport expires the conversation after this long
    Bounded(Duration),
    /// Lives until explicitly closed
    Unbounded,
}

impl SessionLifetime {
    pub fn from_seconds(seconds: u64) -> Self {
        Self::Bounded(Duration::from_secs(seconds))
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Bounded(duration) => Some(*duration),
            Self::Unbounded => None,
        }
    }

    /// Absolute expiry deadline for a conversation opened at `opened_at`
    pub fn deadline_from(&self, opened_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.as_duration()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| opened_at + d)
    }
}

/// Parameters of `open`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub from_service: String,
    pub to_service: String,
    pub contract: String,
    pub lifetime: SessionLifetime,
    pub encryption: bool,
}

/// How `close` ends this side of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Notify the peer and wait for its close (or the grace period)
    Graceful,
    /// Release local resources immediately without telling the peer
    Forced,
}

/// One message taken off a queue by `receive`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: u64,
    /// Receiving endpoint
    pub handle: EndpointHandle,
    pub session_id: SessionId,
    pub queue_name: String,
    pub message_type: String,
    pub body: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// Endpoint metadata exposed by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub handle: EndpointHandle,
    pub session_id: SessionId,
    pub role: EndpointRole,
    pub state: EndpointState,
    pub service_name: String,
    pub far_service: String,
    pub queue_name: String,
    pub contract: String,
    pub peer_handle: Option<EndpointHandle>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetime_deadline() {
        let opened = Utc::now();
        let lifetime = SessionLifetime::from_seconds(60);
        assert_eq!(
            lifetime.deadline_from(opened),
            Some(opened + chrono::Duration::seconds(60))
        );
        assert_eq!(SessionLifetime::Unbounded.deadline_from(opened), None);
    }

    #[test]
    fn test_handles_are_unique_and_transparent() {
        let a = EndpointHandle::new();
        let b = EndpointHandle::new();
        assert_ne!(a, b);

        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, format!("\"{a}\""));
    }
}
