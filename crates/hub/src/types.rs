//! Public types for the connection hub.

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use c3_protocol::constants::WS_CLOSE_REPLACED;

use crate::HubError;

/// Longest identity accepted from a connecting agent.
const MAX_IDENTITY_LEN: usize = 255;

/// Stable token naming one agent across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Wraps an identity without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Validates an identity claimed by a connecting peer.
    pub fn parse(raw: &str) -> Result<Self, HubError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(HubError::InvalidIdentity("empty".into()));
        }
        if trimmed.len() > MAX_IDENTITY_LEN {
            return Err(HubError::InvalidIdentity(format!(
                "longer than {MAX_IDENTITY_LEN} bytes"
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(HubError::InvalidIdentity("contains control characters".into()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ClientIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle of one connection.
///
/// `Connecting -> Active -> Draining -> Closed`; a connection that never
/// became active goes straight from `Connecting` to `Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Created, not yet registered in a hub.
    Connecting,
    /// Registered and pumping.
    Active,
    /// Teardown started: no sends accepted, pumps stopping.
    Draining,
    /// Both pumps have exited.
    Closed,
}

/// Why a connection was torn down. The first reason recorded wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The peer sent a close frame or the stream ended.
    PeerClosed,
    /// Reading from the transport failed.
    ReadError,
    /// Writing to the transport failed or timed out.
    WriteError,
    /// Nothing arrived from the peer within the read deadline.
    PongTimeout,
    /// A newer connection registered with the same identity.
    Replaced,
    /// Explicit administrative disconnect.
    Unregistered,
    /// The hub or server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// WebSocket close code sent to the peer.
    pub fn close_code(self) -> u16 {
        match self {
            CloseReason::Replaced => WS_CLOSE_REPLACED,
            CloseReason::Shutdown => 1001,
            CloseReason::ReadError | CloseReason::WriteError => 1011,
            CloseReason::PeerClosed | CloseReason::PongTimeout | CloseReason::Unregistered => {
                1000
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::ReadError => "read error",
            CloseReason::WriteError => "write error",
            CloseReason::PongTimeout => "pong timeout",
            CloseReason::Replaced => "replaced by a newer connection",
            CloseReason::Unregistered => "disconnected by server",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry changes published by a [`ConnectionHub`](crate::ConnectionHub).
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// A connection registered for an identity that had none.
    Registered {
        identity: ClientIdentity,
        connection_id: Uuid,
        remote_addr: Option<String>,
    },
    /// A connection registered while another was live for the same identity;
    /// the previous one has been torn down.
    Replaced {
        identity: ClientIdentity,
        previous: Uuid,
        connection_id: Uuid,
        remote_addr: Option<String>,
    },
    /// The identity is no longer reachable.
    Unregistered {
        identity: ClientIdentity,
        connection_id: Uuid,
        reason: CloseReason,
    },
}

impl HubEvent {
    pub fn identity(&self) -> &ClientIdentity {
        match self {
            HubEvent::Registered { identity, .. }
            | HubEvent::Replaced { identity, .. }
            | HubEvent::Unregistered { identity, .. } => identity,
        }
    }
}

/// Point-in-time description of a registered connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub identity: ClientIdentity,
    pub connection_id: Uuid,
    pub remote_addr: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub state: ConnectionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_parse_trims_and_validates() {
        assert_eq!(ClientIdentity::parse("  A1 ").unwrap().as_str(), "A1");
        assert!(ClientIdentity::parse("").is_err());
        assert!(ClientIdentity::parse("   ").is_err());
        assert!(ClientIdentity::parse("a\nb").is_err());
        assert!(ClientIdentity::parse(&"x".repeat(256)).is_err());
        assert!(ClientIdentity::parse(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn identity_serializes_as_plain_string() {
        let json = serde_json::to_string(&ClientIdentity::new("A1")).unwrap();
        assert_eq!(json, "\"A1\"");
    }

    #[test]
    fn close_codes() {
        assert_eq!(CloseReason::Replaced.close_code(), 4002);
        assert_eq!(CloseReason::Shutdown.close_code(), 1001);
        assert_eq!(CloseReason::WriteError.close_code(), 1011);
        assert_eq!(CloseReason::PeerClosed.close_code(), 1000);
    }

    #[test]
    fn event_identity() {
        let ev = HubEvent::Unregistered {
            identity: "A1".into(),
            connection_id: Uuid::nil(),
            reason: CloseReason::PeerClosed,
        };
        assert_eq!(ev.identity().as_str(), "A1");
    }
}
