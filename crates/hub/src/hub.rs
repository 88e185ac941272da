//! The connection hub: single registry of reachable peers.
//!
//! Multi-step mutations (register with replacement, administrative
//! unregister) are serialized per identity, so draining a replaced
//! connection only holds up later registrations of that same identity.
//! Every individual map change happens under the map's write lock, and a
//! pump tearing down its own connection never waits behind a registration
//! in progress. Lookups only take the read lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use c3_protocol::envelope::Message;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::HubError;
use crate::connection::ConnectionRecord;
use crate::types::{ClientIdentity, CloseReason, ConnectionInfo, HubEvent};

/// How long registration waits for a replaced connection to drain.
pub const DEFAULT_TEARDOWN_WAIT: Duration = Duration::from_secs(5);

/// Size of the broadcast channel for hub events.
const EVENT_BUFFER_SIZE: usize = 256;

/// Outcome of [`ConnectionHub::broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<(ClientIdentity, HubError)>,
}

/// Per-identity serialization held for the duration of one mutation.
struct IdentitySlot {
    identity: ClientIdentity,
    lock: Arc<Mutex<()>>,
    guard: OwnedMutexGuard<()>,
}

/// Registry mapping identity to the live [`ConnectionRecord`].
///
/// At most one record per identity is registered at any instant. A new
/// registration for an identity that is already live replaces it: the
/// old connection is closed and drained before the new one is inserted.
pub struct ConnectionHub {
    label: &'static str,
    clients: RwLock<HashMap<ClientIdentity, Arc<ConnectionRecord>>>,
    identity_locks: Mutex<HashMap<ClientIdentity, Arc<Mutex<()>>>>,
    events: broadcast::Sender<HubEvent>,
    shutdown: CancellationToken,
    teardown_wait: Duration,
}

impl ConnectionHub {
    /// Creates an empty hub. `label` tags log lines ("agents", "operators").
    pub fn new(label: &'static str) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            label,
            clients: RwLock::new(HashMap::new()),
            identity_locks: Mutex::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
            teardown_wait: DEFAULT_TEARDOWN_WAIT,
        }
    }

    /// Overrides how long a replacement waits for the old connection.
    pub fn with_teardown_wait(mut self, wait: Duration) -> Self {
        self.teardown_wait = wait;
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Subscribes to registration events.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Registers `record`, replacing and tearing down any live record for
    /// the same identity. On success the record is `Active`.
    ///
    /// Only registrations and unregistrations of the same identity wait
    /// for a replaced connection to drain.
    pub async fn register(&self, record: Arc<ConnectionRecord>) -> Result<(), HubError> {
        let slot = self.lock_identity(record.identity()).await;
        let result = self.register_locked(record).await;
        self.unlock_identity(slot).await;
        result
    }

    async fn register_locked(&self, record: Arc<ConnectionRecord>) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::ShuttingDown);
        }

        let identity = record.identity().clone();
        let previous = self.clients.read().await.get(&identity).cloned();

        if let Some(old) = &previous {
            warn!(
                hub = self.label,
                client_id = %identity,
                previous = %old.id(),
                connection_id = %record.id(),
                "duplicate registration, replacing existing connection"
            );
            if !old
                .close_and_wait(CloseReason::Replaced, self.teardown_wait)
                .await
            {
                warn!(
                    hub = self.label,
                    client_id = %identity,
                    previous = %old.id(),
                    "previous connection did not drain in time"
                );
            }
        }

        {
            let mut clients = self.clients.write().await;
            // Checked under the write lock so shutdown never misses an entry.
            if self.shutdown.is_cancelled() {
                return Err(HubError::ShuttingDown);
            }
            clients.insert(identity.clone(), Arc::clone(&record));
        }
        record.mark_active();

        let event = match previous {
            Some(old) => HubEvent::Replaced {
                identity: identity.clone(),
                previous: old.id(),
                connection_id: record.id(),
                remote_addr: record.remote_addr().map(str::to_owned),
            },
            None => HubEvent::Registered {
                identity: identity.clone(),
                connection_id: record.id(),
                remote_addr: record.remote_addr().map(str::to_owned),
            },
        };
        info!(
            hub = self.label,
            client_id = %identity,
            connection_id = %record.id(),
            remote_addr = record.remote_addr().unwrap_or("-"),
            "client registered"
        );
        let _ = self.events.send(event);
        Ok(())
    }

    /// Removes and closes the connection for `identity`.
    ///
    /// Idempotent: returns `false` if nothing was registered.
    pub async fn unregister(&self, identity: &str) -> bool {
        let slot = self.lock_identity(&ClientIdentity::new(identity)).await;
        let removed = self.clients.write().await.remove(identity);
        self.unlock_identity(slot).await;

        match removed {
            Some(record) => {
                record.close(CloseReason::Unregistered);
                let reason = record.close_reason().unwrap_or(CloseReason::Unregistered);
                info!(
                    hub = self.label,
                    client_id = %identity,
                    connection_id = %record.id(),
                    %reason,
                    "client unregistered"
                );
                let _ = self.events.send(HubEvent::Unregistered {
                    identity: record.identity().clone(),
                    connection_id: record.id(),
                    reason,
                });
                true
            }
            None => {
                debug!(hub = self.label, client_id = %identity, "unregister: not registered");
                false
            }
        }
    }

    async fn lock_identity(&self, identity: &ClientIdentity) -> IdentitySlot {
        let lock = Arc::clone(
            self.identity_locks
                .lock()
                .await
                .entry(identity.clone())
                .or_default(),
        );
        let guard = Arc::clone(&lock).lock_owned().await;
        IdentitySlot {
            identity: identity.clone(),
            lock,
            guard,
        }
    }

    async fn unlock_identity(&self, slot: IdentitySlot) {
        let IdentitySlot {
            identity,
            lock,
            guard,
        } = slot;
        drop(guard);

        let mut locks = self.identity_locks.lock().await;
        // The map and `lock` are the only holders: nobody else is queued.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&identity);
        }
    }

    /// Drops `record` from the registry if it is still the current entry
    /// for its identity. Called from the connection's own teardown.
    pub(crate) async fn release(&self, record: &ConnectionRecord) {
        let removed = {
            let mut clients = self.clients.write().await;
            let is_current = clients
                .get(record.identity())
                .is_some_and(|current| current.id() == record.id());
            if is_current {
                clients.remove(record.identity())
            } else {
                None
            }
        };

        if removed.is_none() {
            return;
        }

        let reason = record.close_reason().unwrap_or(CloseReason::Shutdown);
        // The replacing registration publishes its own event.
        if reason == CloseReason::Replaced {
            return;
        }
        info!(
            hub = self.label,
            client_id = %record.identity(),
            connection_id = %record.id(),
            %reason,
            "client disconnected"
        );
        let _ = self.events.send(HubEvent::Unregistered {
            identity: record.identity().clone(),
            connection_id: record.id(),
            reason,
        });
    }

    /// Looks up the live record for `identity`.
    ///
    /// The record may be torn down right after this returns; sends on it
    /// then fail with [`HubError::QueueClosed`].
    pub async fn lookup(&self, identity: &str) -> Result<Arc<ConnectionRecord>, HubError> {
        self.clients
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| HubError::NoSuchClient(ClientIdentity::new(identity)))
    }

    /// Enqueues `msg` on the connection for `identity`, without correlation.
    pub async fn send(&self, identity: &str, msg: &Message) -> Result<(), HubError> {
        self.lookup(identity).await?.sender().send_msg(msg)
    }

    /// Enqueues `msg` on every connection matching `predicate`.
    ///
    /// A full or closed queue is recorded in the report and skipped; it
    /// never stops delivery to the others.
    pub async fn broadcast<F>(&self, predicate: F, msg: &Message) -> Result<BroadcastReport, HubError>
    where
        F: Fn(&ConnectionRecord) -> bool,
    {
        let frame = WsMessage::Text(serde_json::to_string(msg)?.into());
        let targets: Vec<Arc<ConnectionRecord>> = self
            .clients
            .read()
            .await
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect();

        let mut report = BroadcastReport::default();
        for record in targets {
            match record.sender().send_frame(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(hub = self.label, client_id = %record.identity(), "broadcast send failed: {e}");
                    report.failed.push((record.identity().clone(), e));
                }
            }
        }
        Ok(report)
    }

    /// Returns `true` if `identity` is registered and still accepting sends.
    pub async fn is_online(&self, identity: &str) -> bool {
        self.clients
            .read()
            .await
            .get(identity)
            .is_some_and(|r| r.sender().is_open())
    }

    /// Identities currently registered and accepting sends, sorted.
    pub async fn online_clients(&self) -> Vec<ClientIdentity> {
        let mut ids: Vec<ClientIdentity> = self
            .clients
            .read()
            .await
            .values()
            .filter(|r| r.sender().is_open())
            .map(|r| r.identity().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Describes every registered connection, sorted by identity.
    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> =
            self.clients.read().await.values().map(|r| r.info()).collect();
        infos.sort_by(|a, b| a.identity.cmp(&b.identity));
        infos
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Closes every connection and refuses further registrations.
    ///
    /// Waits up to the teardown wait for each connection to drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let records: Vec<Arc<ConnectionRecord>> =
            self.clients.read().await.values().cloned().collect();

        info!(hub = self.label, count = records.len(), "closing all connections");
        let waits = records.iter().map(|record| {
            record.close_and_wait(CloseReason::Shutdown, self.teardown_wait)
        });
        let drained = futures_util::future::join_all(waits).await;
        let stuck = drained.iter().filter(|ok| !**ok).count();
        if stuck > 0 {
            warn!(hub = self.label, stuck, "connections still draining after shutdown wait");
        }
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new("agents")
    }
}
