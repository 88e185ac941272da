//! Connection records: outbound queue, lifecycle state and pump supervision.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Sink, Stream};
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use c3_protocol::envelope::Message;

use crate::handler::Dispatch;
use crate::hub::ConnectionHub;
use crate::pumps;
use crate::types::{ClientIdentity, CloseReason, ConnectionInfo, ConnectionState};
use crate::{HubError, SEND_BUFFER_SIZE};

/// Handle for enqueueing messages on one connection's outbound queue.
///
/// Cloneable and cheap. Sending never waits: a full queue yields
/// [`HubError::QueueFull`], a connection in teardown yields
/// [`HubError::QueueClosed`].
#[derive(Clone)]
pub struct Sender {
    identity: ClientIdentity,
    tx: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    pub fn send_msg(&self, msg: &Message) -> Result<(), HubError> {
        let json = serde_json::to_string(msg)?;
        self.send_frame(WsMessage::Text(json.into()))
    }

    pub(crate) fn send_frame(&self, frame: WsMessage) -> Result<(), HubError> {
        if self.cancel.is_cancelled() {
            return Err(HubError::QueueClosed(self.identity.clone()));
        }
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => {
                warn!(client_id = %self.identity, "send buffer full, dropping message");
                HubError::QueueFull(self.identity.clone())
            }
            TrySendError::Closed(_) => HubError::QueueClosed(self.identity.clone()),
        })
    }

    /// Returns `true` while the connection still accepts messages.
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }
}

/// State for one live connection.
///
/// Owned by the hub once registered; the pumps hold clones of the `Arc`
/// for as long as they run. Teardown happens once: the first
/// [`close`](Self::close) records the reason, stops accepting sends and
/// cancels the pumps.
pub struct ConnectionRecord {
    id: Uuid,
    identity: ClientIdentity,
    remote_addr: Option<String>,
    connected_at: DateTime<Utc>,
    sender: Sender,
    state: watch::Sender<ConnectionState>,
    close_reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
}

impl ConnectionRecord {
    /// Creates a record in `Connecting` state together with the receiving
    /// end of its outbound queue.
    pub(crate) fn new(
        identity: ClientIdentity,
        remote_addr: Option<String>,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        let cancel = parent.child_token();
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let record = Arc::new(Self {
            id: Uuid::new_v4(),
            sender: Sender {
                identity: identity.clone(),
                tx,
                cancel: cancel.clone(),
            },
            identity,
            remote_addr,
            connected_at: Utc::now(),
            state,
            close_reason: OnceLock::new(),
            cancel,
        });
        (record, rx)
    }

    /// Unique id of this connection (distinct across reconnects).
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Returns a sender for the outbound queue.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            identity: self.identity.clone(),
            connection_id: self.id,
            remote_addr: self.remote_addr.clone(),
            connected_at: self.connected_at,
            state: self.state(),
        }
    }

    /// Starts teardown. Idempotent; only the first reason is kept.
    pub fn close(&self, reason: CloseReason) {
        if self.close_reason.set(reason).is_ok() {
            debug!(
                client_id = %self.identity,
                connection_id = %self.id,
                %reason,
                "closing connection"
            );
        }
        self.state.send_if_modified(|s| match s {
            ConnectionState::Connecting | ConnectionState::Active => {
                *s = ConnectionState::Draining;
                true
            }
            _ => false,
        });
        self.cancel.cancel();
    }

    /// Resolves once both pumps have exited.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Closes the connection and waits up to `wait` for the pumps to finish.
    ///
    /// Returns `false` if the pumps were still running when `wait` elapsed.
    pub async fn close_and_wait(&self, reason: CloseReason, wait: Duration) -> bool {
        self.close(reason);
        tokio::time::timeout(wait, self.closed()).await.is_ok()
    }

    pub(crate) fn mark_active(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Connecting {
                *s = ConnectionState::Active;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Registers a new connection in `hub` and starts its pumps.
///
/// The record enters `Active` only once registration succeeded; any
/// previous connection for the same identity has been torn down by then.
/// Inbound messages are handed to `dispatch` one at a time, in arrival
/// order.
pub async fn attach<R, W>(
    hub: &Arc<ConnectionHub>,
    identity: ClientIdentity,
    remote_addr: Option<String>,
    read: R,
    write: W,
    dispatch: Arc<dyn Dispatch>,
) -> Result<Arc<ConnectionRecord>, HubError>
where
    R: Stream<Item = Result<WsMessage, tungstenite::Error>> + Send + Unpin + 'static,
    W: Sink<WsMessage, Error = tungstenite::Error> + Send + Unpin + 'static,
{
    let (record, outbound) = ConnectionRecord::new(identity, remote_addr, hub.shutdown_token());
    if let Err(e) = hub.register(Arc::clone(&record)).await {
        record.close(CloseReason::Shutdown);
        record.mark_closed();
        return Err(e);
    }

    spawn_pumps(hub, &record, outbound, read, write, dispatch);
    Ok(record)
}

/// Spawns the read, write and ping pumps plus the task that joins them.
///
/// Whichever side stops first cancels the connection token; the
/// supervisor then drops the record from the hub, waits for both pumps
/// and marks the record `Closed`.
fn spawn_pumps<R, W>(
    hub: &Arc<ConnectionHub>,
    record: &Arc<ConnectionRecord>,
    outbound: mpsc::Receiver<WsMessage>,
    read: R,
    write: W,
    dispatch: Arc<dyn Dispatch>,
) where
    R: Stream<Item = Result<WsMessage, tungstenite::Error>> + Send + Unpin + 'static,
    W: Sink<WsMessage, Error = tungstenite::Error> + Send + Unpin + 'static,
{
    let cancel = record.cancel_token().clone();

    let write_handle = tokio::spawn(pumps::write::write_pump(
        write,
        outbound,
        Arc::clone(record),
    ));
    let read_handle = tokio::spawn(pumps::read::read_pump(read, Arc::clone(record), dispatch));
    let ping_handle = tokio::spawn(pumps::ping::ping_pump(record.sender(), cancel.clone()));

    let hub = Arc::clone(hub);
    let record = Arc::clone(record);
    tokio::spawn(async move {
        cancel.cancelled().await;
        // Cancelled through the parent token (hub shutdown) leaves no reason yet.
        record.close(CloseReason::Shutdown);
        hub.release(&record).await;

        let _ = tokio::join!(read_handle, write_handle);
        ping_handle.abort();
        record.mark_closed();

        info!(
            client_id = %record.identity(),
            connection_id = %record.id(),
            reason = %record.close_reason().unwrap_or(CloseReason::Shutdown),
            "connection closed"
        );
    });
}
