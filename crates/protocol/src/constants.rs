use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time allowed to write a single WebSocket frame before the link is
/// considered broken.
pub const WS_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Read deadline: if nothing at all arrives from the peer within this
/// window (no pong, no reply, no push) the connection is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often the hub pings each peer. Must stay below [`WS_PONG_WAIT`].
pub const WS_PING_PERIOD: Duration = Duration::from_secs(25);

/// Maximum message size in bytes (16 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default deadline for a correlated command to receive its reply.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Close code: the agent connected without a `client_id` query parameter.
pub const WS_CLOSE_MISSING_CLIENT_ID: u16 = 4000;

/// Close code: the hub failed while setting up the connection.
pub const WS_CLOSE_CONNECTION_ERROR: u16 = 4001;

/// Close code: a newer connection registered with the same identity.
pub const WS_CLOSE_REPLACED: u16 = 4002;

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Hub -> agent, correlated by envelope id.
    #[serde(rename = "command")]
    Command,

    // Agent -> hub replies.
    #[serde(rename = "command_result")]
    CommandResult,
    #[serde(rename = "error")]
    Error,

    // Agent -> hub push events.
    #[serde(rename = "shell_output")]
    ShellOutput,

    // Hub <-> operator console.
    #[serde(rename = "client_status_change")]
    ClientStatusChange,
    #[serde(rename = "list_clients")]
    ListClients,
    #[serde(rename = "client_list")]
    ClientList,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Returns `true` for the types an agent uses to answer a command.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::CommandResult | MessageType::Error)
    }
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
pub const WS_ERR_CODE_BAD_GATEWAY: i32 = 502;
pub const WS_ERR_CODE_UNAVAILABLE: i32 = 503;
pub const WS_ERR_CODE_TIMEOUT: i32 = 504;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_wire_names() {
        let json = serde_json::to_string(&MessageType::CommandResult).unwrap();
        assert_eq!(json, "\"command_result\"");
        let parsed: MessageType = serde_json::from_str("\"client_status_change\"").unwrap();
        assert_eq!(parsed, MessageType::ClientStatusChange);
    }

    #[test]
    fn unknown_message_type_is_tolerated() {
        let parsed: MessageType = serde_json::from_str("\"screenshot_taken\"").unwrap();
        assert_eq!(parsed, MessageType::Unknown);
    }

    #[test]
    fn reply_types() {
        assert!(MessageType::CommandResult.is_reply());
        assert!(MessageType::Error.is_reply());
        assert!(!MessageType::ShellOutput.is_reply());
        assert!(!MessageType::Command.is_reply());
    }

    #[test]
    fn ping_period_below_pong_wait() {
        assert!(WS_PING_PERIOD < WS_PONG_WAIT);
    }
}
