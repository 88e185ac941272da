//! Correlated request/response over agent connections.
//!
//! A command goes out with a fresh correlation id in the envelope `id`.
//! The agent echoes it back on its `command_result` (or `error`), and the
//! router completes the waiting caller. Every pending request ends
//! exactly once: with the reply, or with a timeout. Replies arriving
//! after that are stale and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use c3_protocol::MessageType;
use c3_protocol::constants::WS_REQUEST_TIMEOUT;
use c3_protocol::envelope::Message;
use c3_protocol::messages::ShellOutputReport;

use crate::HubError;
use crate::connection::ConnectionRecord;
use crate::handler::{Dispatch, HandlerFuture, InboundHandler};
use crate::hub::ConnectionHub;
use crate::store::{Journal, StoreEvent};
use crate::types::ClientIdentity;

type ReplySink = oneshot::Sender<Result<Message, HubError>>;
type PendingMap = Arc<Mutex<HashMap<String, PendingRequest>>>;

struct PendingRequest {
    target: ClientIdentity,
    sent_at: DateTime<Utc>,
    sink: ReplySink,
    expiry: Option<AbortHandle>,
}

/// What [`ResponseRouter::route`] did with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Matched a pending request and completed it.
    Delivered,
    /// Looked like a reply but nothing was waiting for it.
    Stale,
    /// Not a reply; handed to the inbound handler.
    Unsolicited,
}

/// A sent request whose reply has not been awaited yet.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: String,
    target: ClientIdentity,
    rx: oneshot::Receiver<Result<Message, HubError>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn target(&self) -> &ClientIdentity {
        &self.target
    }

    /// Waits for the reply.
    ///
    /// An `error` envelope from the agent comes back as
    /// [`HubError::Agent`].
    pub async fn wait(self) -> Result<Message, HubError> {
        let reply = self.rx.await.map_err(|_| HubError::ReplyDropped)??;
        if let Some(err) = &reply.error {
            return Err(HubError::Agent {
                code: err.code,
                message: err.message.clone(),
            });
        }
        Ok(reply)
    }
}

/// Sends correlated commands and routes agent replies back to callers.
pub struct ResponseRouter {
    hub: Arc<ConnectionHub>,
    pending: PendingMap,
    handler: Arc<dyn InboundHandler>,
    journal: Arc<Journal>,
    timeout: Duration,
}

impl ResponseRouter {
    pub fn new(
        hub: Arc<ConnectionHub>,
        handler: Arc<dyn InboundHandler>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            hub,
            pending: Arc::new(Mutex::new(HashMap::new())),
            handler,
            journal,
            timeout: WS_REQUEST_TIMEOUT,
        }
    }

    /// Sets the default request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of requests still waiting for a reply.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Sends `payload` as a command to `identity` with the default timeout.
    ///
    /// Fails immediately with [`HubError::NoSuchClient`] if the agent is
    /// not connected; never waits for it to appear.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        identity: &str,
        payload: &T,
    ) -> Result<PendingReply, HubError> {
        self.send_with_timeout(identity, payload, self.timeout).await
    }

    pub async fn send_with_timeout<T: Serialize + ?Sized>(
        &self,
        identity: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<PendingReply, HubError> {
        let record = self.hub.lookup(identity).await?;
        let target = record.identity().clone();
        let body = serde_json::to_value(payload)?;
        let (tx, rx) = oneshot::channel();

        let correlation_id = {
            let mut pending = self.pending.lock().await;
            let id = loop {
                let candidate = Uuid::new_v4().to_string();
                if !pending.contains_key(&candidate) {
                    break candidate;
                }
            };
            pending.insert(
                id.clone(),
                PendingRequest {
                    target: target.clone(),
                    sent_at: Utc::now(),
                    sink: tx,
                    expiry: None,
                },
            );
            id
        };

        let msg = match Message::new(correlation_id.clone(), MessageType::Command, Some(&body)) {
            Ok(msg) => msg,
            Err(e) => {
                self.pending.lock().await.remove(&correlation_id);
                return Err(e.into());
            }
        };

        // Recorded before the frame leaves; its result must never precede it.
        self.journal
            .record(
                &target,
                StoreEvent::Command {
                    correlation_id: correlation_id.clone(),
                    payload: body,
                },
            )
            .await;

        if let Err(e) = record.sender().send_msg(&msg) {
            self.pending.lock().await.remove(&correlation_id);
            warn!(client_id = %target, %correlation_id, "command not sent: {e}");
            self.journal
                .record(
                    &target,
                    StoreEvent::Result {
                        correlation_id: correlation_id.clone(),
                        payload: None,
                        error: Some(e.to_string()),
                    },
                )
                .await;
            return Err(e);
        }

        let expiry = self.spawn_expiry(correlation_id.clone(), timeout);
        match self.pending.lock().await.get_mut(&correlation_id) {
            Some(request) => request.expiry = Some(expiry),
            // Already answered.
            None => expiry.abort(),
        }

        debug!(client_id = %target, %correlation_id, timeout_ms = timeout.as_millis() as u64, "command sent");

        Ok(PendingReply {
            correlation_id,
            target,
            rx,
        })
    }

    /// Sends a command and waits for its reply.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        identity: &str,
        payload: &T,
    ) -> Result<Message, HubError> {
        self.send(identity, payload).await?.wait().await
    }

    /// Fails every pending request with [`HubError::ShuttingDown`].
    pub async fn cancel_all(&self) {
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().await.drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "cancelling pending requests");
        }
        for (_, request) in drained {
            if let Some(expiry) = &request.expiry {
                expiry.abort();
            }
            let _ = request.sink.send(Err(HubError::ShuttingDown));
        }
    }

    /// Routes one inbound message from `from`.
    ///
    /// `command_result` and `error` messages carrying a correlation id
    /// are replies. Everything else goes to the inbound handler.
    pub async fn route(&self, from: &ClientIdentity, msg: Message) -> RouteOutcome {
        if msg.is_correlated() && msg.msg_type.is_reply() {
            let correlation_id = msg.id.clone();
            return match self.complete(from, msg).await {
                Ok(()) => RouteOutcome::Delivered,
                Err(e) => {
                    warn!(client_id = %from, %correlation_id, "discarding reply: {e}");
                    RouteOutcome::Stale
                }
            };
        }

        self.dispatch_unsolicited(from, msg).await;
        RouteOutcome::Unsolicited
    }

    async fn complete(&self, from: &ClientIdentity, msg: Message) -> Result<(), HubError> {
        let request = {
            let mut pending = self.pending.lock().await;
            match pending.get(&msg.id).map(|r| r.target.clone()) {
                Some(target) if target == *from => pending.remove(&msg.id),
                Some(target) => {
                    debug!(
                        client_id = %from,
                        expected = %target,
                        correlation_id = %msg.id,
                        "reply from unexpected client"
                    );
                    None
                }
                None => None,
            }
        };

        let Some(request) = request else {
            return Err(HubError::StaleReply {
                client_id: from.clone(),
                correlation_id: msg.id,
            });
        };

        if let Some(expiry) = &request.expiry {
            expiry.abort();
        }

        let latency = Utc::now() - request.sent_at;
        debug!(
            client_id = %from,
            correlation_id = %msg.id,
            latency_ms = latency.num_milliseconds(),
            "reply matched"
        );

        let event = StoreEvent::Result {
            correlation_id: msg.id.clone(),
            payload: msg
                .payload_json()
                .and_then(|raw| serde_json::from_str(raw).ok()),
            error: msg.error.as_ref().map(|e| format!("{}: {}", e.code, e.message)),
        };

        if request.sink.send(Ok(msg)).is_err() {
            debug!(client_id = %from, "requester gave up before the reply arrived");
        }
        self.journal.record(from, event).await;
        Ok(())
    }

    async fn dispatch_unsolicited(&self, from: &ClientIdentity, msg: Message) {
        match msg.msg_type {
            MessageType::ShellOutput => match msg.parse_payload::<ShellOutputReport>() {
                Ok(report) => {
                    self.handler
                        .on_shell_output(from.clone(), report.unwrap_or_default())
                        .await
                }
                Err(e) => warn!(client_id = %from, "malformed shell_output payload: {e}"),
            },
            // Older agents push results under their own type names.
            MessageType::Unknown => match msg.parse_payload::<ShellOutputReport>() {
                Ok(Some(report)) if report.has_content() => {
                    self.handler.on_shell_output(from.clone(), report).await
                }
                _ => self.handler.on_unhandled(from.clone(), msg).await,
            },
            _ => self.handler.on_unhandled(from.clone(), msg).await,
        }
    }

    fn spawn_expiry(&self, correlation_id: String, timeout: Duration) -> AbortHandle {
        let pending = Arc::clone(&self.pending);
        let journal = Arc::clone(&self.journal);

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(request) = pending.lock().await.remove(&correlation_id) else {
                return;
            };

            warn!(client_id = %request.target, %correlation_id, "request timed out");
            let target = request.target.clone();
            let _ = request.sink.send(Err(HubError::RequestTimeout {
                client_id: request.target,
                correlation_id: correlation_id.clone(),
            }));
            journal
                .record(&target, StoreEvent::Timeout { correlation_id })
                .await;
        })
        .abort_handle()
    }
}

impl Dispatch for ResponseRouter {
    fn dispatch(&self, from: Arc<ConnectionRecord>, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.route(from.identity(), msg).await;
        })
    }
}
