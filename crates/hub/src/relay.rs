//! Presence relay from the agent hub to operators and the journal.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use c3_protocol::MessageType;
use c3_protocol::envelope::Message;
use c3_protocol::messages::ClientStatusChange;

use crate::hub::ConnectionHub;
use crate::store::{Journal, StoreEvent};
use crate::types::{ClientIdentity, HubEvent};

/// Follows `agents` and reports every online/offline transition.
///
/// Operators receive a `client_status_change` push; the journal gets an
/// `online` or `offline` record. The task ends when the agent hub is
/// dropped.
pub fn spawn_status_relay(
    agents: &ConnectionHub,
    operators: Arc<ConnectionHub>,
    journal: Arc<Journal>,
) -> JoinHandle<()> {
    let mut events = agents.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => relay(&event, &operators, &journal).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("status relay lagged, missed {n} hub events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("status relay stopped");
    })
}

async fn relay(event: &HubEvent, operators: &ConnectionHub, journal: &Journal) {
    let online = match event {
        HubEvent::Registered { remote_addr, .. } | HubEvent::Replaced { remote_addr, .. } => {
            journal
                .record(
                    event.identity(),
                    StoreEvent::Online {
                        remote_addr: remote_addr.clone(),
                    },
                )
                .await;
            true
        }
        HubEvent::Unregistered { reason, .. } => {
            journal
                .record(event.identity(), StoreEvent::Offline { reason: *reason })
                .await;
            false
        }
    };
    notify_operators(operators, event.identity(), online).await;
}

async fn notify_operators(operators: &ConnectionHub, client_id: &ClientIdentity, online: bool) {
    let change = ClientStatusChange {
        client_id: client_id.to_string(),
        online,
    };
    let msg = match Message::push(MessageType::ClientStatusChange, &change) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(%client_id, "failed to encode status change: {e}");
            return;
        }
    };
    match operators.broadcast(|_| true, &msg).await {
        Ok(report) => debug!(
            %client_id,
            online,
            delivered = report.delivered,
            failed = report.failed.len(),
            "status change relayed"
        ),
        Err(e) => warn!(%client_id, "failed to relay status change: {e}"),
    }
}
