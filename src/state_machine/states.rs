use serde::{Deserialize, Serialize};
use std::fmt;

/// Conversation endpoint states
///
/// ```text
/// Created ──first send──> Active ──close──> Ending ──peer close / grace──> Reclaimed
///    │                      │
///    └────lifetime elapsed──┴──────────────> Expired
/// ```
///
/// Only a receiver may end a conversation; the sender's side follows once the
/// end-of-dialog message reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    /// Opened, nothing sent yet; the peer endpoint does not exist
    Created,
    /// At least one message has crossed; both endpoints exist
    Active,
    /// This side issued a close and waits for its peer or the grace period
    Ending,
    /// Resources released by the transport
    Reclaimed,
    /// Lifetime bound elapsed; the transport retired the endpoint
    Expired,
}

impl EndpointState {
    /// Check if this is a terminal state (endpoint resources are gone)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Reclaimed | Self::Expired)
    }

    /// Check if messages may still be sent from this endpoint
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Created | Self::Active)
    }

    /// Check if the endpoint still holds transport resources
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: EndpointState) -> bool {
        use EndpointState::*;
        match (self, next) {
            (Created, Active) => true,
            (Created | Active, Ending) => true,
            (Created | Active, Expired) => true,
            // Forced close skips the graceful leg
            (Created | Active | Ending, Reclaimed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Active => write!(f, "active"),
            Self::Ending => write!(f, "ending"),
            Self::Reclaimed => write!(f, "reclaimed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for EndpointState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "active" => Ok(Self::Active),
            "ending" => Ok(Self::Ending),
            "reclaimed" => Ok(Self::Reclaimed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid endpoint state: {s}")),
        }
    }
}

impl Default for EndpointState {
    fn default() -> Self {
        Self::Created
    }
}

/// Which side of the conversation an endpoint represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    /// Opened the conversation (producer side)
    Initiator,
    /// Created by the transport on first delivery (worker side)
    Target,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Target => write!(f, "target"),
        }
    }
}

impl std::str::FromStr for EndpointRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiator" => Ok(Self::Initiator),
            "target" => Ok(Self::Target),
            _ => Err(format!("Invalid endpoint role: {s}")),
        }
    }
}
