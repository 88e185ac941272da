//! Server side of the C3 agent channel.
//!
//! Agents hold a persistent WebSocket to the hub. The [`ConnectionHub`]
//! is the registry of reachable agents, each backed by a
//! [`ConnectionRecord`] with its own read, write and ping pumps. The
//! [`ResponseRouter`] sends correlated commands to an agent and matches
//! the asynchronous replies back to whoever asked. Operator consoles
//! connect to the same server and live in a second hub.

mod connection;
mod handler;
mod hub;
mod operators;
mod pumps;
mod relay;
mod router;
mod server;
mod store;
mod types;

#[cfg(test)]
mod test_support;

pub use connection::{ConnectionRecord, Sender, attach};
pub use handler::{Dispatch, HandlerFuture, InboundHandler, LogOnly};
pub use hub::{BroadcastReport, ConnectionHub, DEFAULT_TEARDOWN_WAIT};
pub use operators::{OperatorDesk, OperatorForwarder};
pub use relay::spawn_status_relay;
pub use router::{PendingReply, ResponseRouter, RouteOutcome};
pub use server::{HubServer, ServerConfig};
pub use store::{
    EventStore, Journal, JsonlStore, MemoryStore, NullStore, StoreError, StoreEvent,
    StoreFuture, StoreRecord,
};
pub use types::{ClientIdentity, CloseReason, ConnectionInfo, ConnectionState, HubEvent};

use c3_protocol::constants::{
    WS_ERR_CODE_BAD_GATEWAY, WS_ERR_CODE_INTERNAL, WS_ERR_CODE_NOT_FOUND, WS_ERR_CODE_TIMEOUT,
    WS_ERR_CODE_UNAVAILABLE,
};

/// Outbound queue capacity per connection.
///
/// Senders never wait on a full queue; they get [`HubError::QueueFull`]
/// instead, so one stuck agent cannot stall the caller.
pub const SEND_BUFFER_SIZE: usize = 1024;

/// Errors produced by the hub.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("no such client: {0}")]
    NoSuchClient(ClientIdentity),

    #[error("outbound queue closed for client {0}")]
    QueueClosed(ClientIdentity),

    #[error("outbound queue full for client {0}")]
    QueueFull(ClientIdentity),

    #[error("request {correlation_id} to client {client_id} timed out")]
    RequestTimeout {
        client_id: ClientIdentity,
        correlation_id: String,
    },

    #[error("stale reply {correlation_id} from client {client_id}")]
    StaleReply {
        client_id: ClientIdentity,
        correlation_id: String,
    },

    #[error("agent error {code}: {message}")]
    Agent { code: i32, message: String },

    #[error("reply channel dropped")]
    ReplyDropped,

    #[error("hub is shutting down")]
    ShuttingDown,

    #[error("invalid client id: {0}")]
    InvalidIdentity(String),

    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HubError {
    /// Returns `true` when the target agent cannot be reached.
    ///
    /// A send that races with teardown sees `QueueClosed`; callers treat it
    /// exactly like `NoSuchClient`.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, HubError::NoSuchClient(_) | HubError::QueueClosed(_))
    }

    /// Maps the error to the JSON error code reported to operators.
    pub fn wire_code(&self) -> i32 {
        match self {
            HubError::NoSuchClient(_) | HubError::QueueClosed(_) => WS_ERR_CODE_NOT_FOUND,
            HubError::QueueFull(_) | HubError::ShuttingDown => WS_ERR_CODE_UNAVAILABLE,
            HubError::RequestTimeout { .. } => WS_ERR_CODE_TIMEOUT,
            HubError::Agent { .. } => WS_ERR_CODE_BAD_GATEWAY,
            _ => WS_ERR_CODE_INTERNAL,
        }
    }
}
