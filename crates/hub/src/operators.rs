//! Operator console sessions.
//!
//! Operators connect with `?type=web` and live in their own
//! [`ConnectionHub`]. [`OperatorDesk`] serves their requests against the
//! agent fleet; [`OperatorForwarder`] pushes agent output to all of them.

use std::sync::Arc;

use tracing::{debug, warn};

use c3_protocol::MessageType;
use c3_protocol::constants::{WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED};
use c3_protocol::envelope::Message;
use c3_protocol::messages::{ClientList, ClientSummary, OperatorCommand, ShellOutput, ShellOutputReport};

use crate::HubError;
use crate::connection::ConnectionRecord;
use crate::handler::{Dispatch, HandlerFuture, InboundHandler};
use crate::hub::ConnectionHub;
use crate::router::ResponseRouter;
use crate::types::ClientIdentity;

/// Broadcasts agent shell output to every operator session.
pub struct OperatorForwarder {
    operators: Arc<ConnectionHub>,
}

impl OperatorForwarder {
    pub fn new(operators: Arc<ConnectionHub>) -> Self {
        Self { operators }
    }
}

impl InboundHandler for OperatorForwarder {
    fn on_shell_output(&self, from: ClientIdentity, report: ShellOutputReport) -> HandlerFuture<'_> {
        Box::pin(async move {
            let output = ShellOutput::from_report(from.as_str(), report);
            debug!(
                client_id = %from,
                exit_code = output.exit_code,
                bytes = output.output.len(),
                "forwarding shell output"
            );
            let msg = match Message::push(MessageType::ShellOutput, &output) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(client_id = %from, "failed to encode shell output: {e}");
                    return;
                }
            };
            if let Err(e) = self.operators.broadcast(|_| true, &msg).await {
                warn!(client_id = %from, "failed to broadcast shell output: {e}");
            }
        })
    }
}

/// Serves requests arriving on operator sessions.
pub struct OperatorDesk {
    router: Arc<ResponseRouter>,
}

impl OperatorDesk {
    pub fn new(router: Arc<ResponseRouter>) -> Self {
        Self { router }
    }

    /// Runs the command on its agent and answers the operator.
    ///
    /// Spawned so a slow agent never blocks the operator's read pump.
    fn forward_command(&self, operator: Arc<ConnectionRecord>, request: Message) {
        let cmd = match request.parse_payload::<OperatorCommand>() {
            Ok(Some(cmd)) => cmd,
            Ok(None) => {
                reply(&operator, request.reply_error(WS_ERR_CODE_BAD_REQUEST, "missing payload"));
                return;
            }
            Err(e) => {
                reply(
                    &operator,
                    request.reply_error(WS_ERR_CODE_BAD_REQUEST, format!("invalid command: {e}")),
                );
                return;
            }
        };

        let router = Arc::clone(&self.router);
        tokio::spawn(async move {
            debug!(
                operator = %operator.identity(),
                client_id = %cmd.client_id,
                "operator command"
            );
            let answer = match router.request(&cmd.client_id, &cmd.command).await {
                Ok(mut result) => {
                    result.id = request.id.clone();
                    result.msg_type = MessageType::CommandResult;
                    result
                }
                Err(e) => {
                    warn!(
                        operator = %operator.identity(),
                        client_id = %cmd.client_id,
                        "operator command failed: {e}"
                    );
                    request.reply_error(e.wire_code(), e.to_string())
                }
            };
            reply(&operator, answer);
        });
    }

    async fn list_clients(&self, operator: &ConnectionRecord, request: &Message) {
        let clients = self
            .router
            .hub()
            .snapshot()
            .await
            .into_iter()
            .map(|info| ClientSummary {
                client_id: info.identity.to_string(),
                remote_addr: info.remote_addr,
                connected_at: info.connected_at.to_rfc3339(),
            })
            .collect();

        match request.reply(MessageType::ClientList, Some(&ClientList { clients })) {
            Ok(msg) => reply(operator, msg),
            Err(e) => warn!(operator = %operator.identity(), "failed to encode client list: {e}"),
        }
    }
}

impl Dispatch for OperatorDesk {
    fn dispatch(&self, from: Arc<ConnectionRecord>, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            match msg.msg_type {
                MessageType::Command => self.forward_command(from, msg),
                MessageType::ListClients => self.list_clients(&from, &msg).await,
                _ => {
                    debug!(operator = %from.identity(), msg_type = ?msg.msg_type, "unsupported operator request");
                    reply(
                        &from,
                        msg.reply_error(WS_ERR_CODE_NOT_IMPLEMENTED, "unsupported message type"),
                    );
                }
            }
        })
    }
}

fn reply(operator: &ConnectionRecord, msg: Message) {
    if let Err(e) = operator.sender().send_msg(&msg) {
        match e {
            HubError::QueueClosed(_) => {
                debug!(operator = %operator.identity(), "operator gone before reply")
            }
            e => warn!(operator = %operator.identity(), "failed to answer operator: {e}"),
        }
    }
}
