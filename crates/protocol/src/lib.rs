//! Wire protocol shared by the C3 hub, its agents and operator consoles.
//!
//! Every WebSocket text frame carries one JSON [`Message`] envelope. The
//! envelope `id` is the correlation identifier linking a `command` to the
//! agent's `command_result`.

pub mod constants;
pub mod envelope;
pub mod messages;

pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use messages::{
    ClientList, ClientStatusChange, ClientSummary, OperatorCommand, ShellOutput,
    ShellOutputReport, strip_ansi,
};
