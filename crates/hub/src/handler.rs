//! Dispatch seams between the read pump and the layers above it.
//!
//! [`Dispatch`] receives every parsed inbound message of a connection.
//! The [`ResponseRouter`](crate::ResponseRouter) implements it for agent
//! links and hands anything that is not a correlated reply to an
//! [`InboundHandler`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use c3_protocol::envelope::Message;
use c3_protocol::messages::ShellOutputReport;

use crate::connection::ConnectionRecord;
use crate::types::ClientIdentity;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Receives inbound messages from one connection, one at a time.
///
/// The read pump awaits the returned future before reading the next
/// frame; implementations that need to do slow work should spawn it.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, from: Arc<ConnectionRecord>, msg: Message) -> HandlerFuture<'_>;
}

/// Default handler for agent messages that are not correlated replies.
///
/// Default implementations only log, so implementors override what they
/// care about.
pub trait InboundHandler: Send + Sync + 'static {
    /// Called for `shell_output` pushes, and for unknown message types
    /// whose payload looks like shell output.
    fn on_shell_output(&self, from: ClientIdentity, report: ShellOutputReport) -> HandlerFuture<'_> {
        Box::pin(async move {
            tracing::info!(
                client_id = %from,
                exit_code = ?report.exit_code,
                "shell output received"
            );
        })
    }

    /// Called for every other unsolicited message.
    fn on_unhandled(&self, from: ClientIdentity, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            tracing::warn!(client_id = %from, msg_type = ?msg.msg_type, "unhandled message type");
        })
    }
}

/// Handler that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnly;

impl InboundHandler for LogOnly {}
