//! WebSocket write pump: drains the outbound queue onto the transport.

use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error};

use c3_protocol::constants::WS_WRITE_WAIT;

use crate::connection::ConnectionRecord;
use crate::types::CloseReason;

/// Writes queued frames in FIFO order until the connection is cancelled
/// or a write fails.
///
/// On exit the queue is closed, anything still queued is discarded, and a
/// close frame carrying the close reason is sent before the sink is
/// closed.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut outbound: mpsc::Receiver<tungstenite::Message>,
    record: Arc<ConnectionRecord>,
) -> CloseReason
where
    S: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let cancel = record.cancel_token().clone();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                match tokio::time::timeout(WS_WRITE_WAIT, write.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(client_id = %record.identity(), "WebSocket write error: {e}");
                        record.close(CloseReason::WriteError);
                        break;
                    }
                    Err(_) => {
                        error!(client_id = %record.identity(), "WebSocket write timed out");
                        record.close(CloseReason::WriteError);
                        break;
                    }
                }
            }
        }
    }

    outbound.close();
    let mut dropped = 0usize;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        debug!(client_id = %record.identity(), dropped, "discarded unsent messages");
    }

    record.close(CloseReason::Shutdown);
    let reason = record.close_reason().unwrap_or(CloseReason::Shutdown);
    let frame = CloseFrame {
        code: CloseCode::from(reason.close_code()),
        reason: reason.as_str().to_string().into(),
    };

    // Best-effort close; after a write error the transport is already broken.
    let _ = tokio::time::timeout(WS_WRITE_WAIT, async {
        if reason != CloseReason::WriteError {
            let _ = write.send(tungstenite::Message::Close(Some(frame))).await;
        }
        let _ = write.close().await;
    })
    .await;

    reason
}
