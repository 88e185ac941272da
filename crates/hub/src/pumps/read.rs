//! WebSocket read pump: hands inbound messages to the dispatcher.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite;
use tracing::{debug, trace, warn};

use c3_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use c3_protocol::envelope::Message;

use crate::connection::ConnectionRecord;
use crate::handler::Dispatch;
use crate::types::CloseReason;

/// Reads frames until the transport fails, the peer closes, or the
/// connection is cancelled.
///
/// Each text message is fully dispatched before the next read, so
/// messages from one connection are handled in arrival order. Any
/// incoming frame resets the read deadline; [`WS_PONG_WAIT`] of silence
/// closes the connection.
pub(crate) async fn read_pump<S>(
    mut read: S,
    record: Arc<ConnectionRecord>,
    dispatch: Arc<dyn Dispatch>,
) -> CloseReason
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let cancel = record.cancel_token().clone();
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,

            () = &mut deadline => {
                warn!(client_id = %record.identity(), "no traffic within read deadline, closing");
                break Some(CloseReason::PongTimeout);
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                        match frame {
                            tungstenite::Message::Text(text) => {
                                handle_text(&record, &dispatch, &text).await;
                            }
                            tungstenite::Message::Binary(data) => {
                                debug!(client_id = %record.identity(), len = data.len(), "ignoring binary frame");
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = record.sender().send_frame(tungstenite::Message::Pong(data));
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(frame) => {
                                debug!(client_id = %record.identity(), ?frame, "received close frame");
                                break Some(CloseReason::PeerClosed);
                            }
                            tungstenite::Message::Frame(_) => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!(client_id = %record.identity(), "WebSocket read error: {e}");
                        break Some(CloseReason::ReadError);
                    }
                    None => {
                        debug!(client_id = %record.identity(), "WebSocket stream ended");
                        break Some(CloseReason::PeerClosed);
                    }
                }
            }
        }
    };

    if let Some(reason) = outcome {
        record.close(reason);
    }
    record.close_reason().unwrap_or(CloseReason::Shutdown)
}

/// Parses one text frame and dispatches it.
async fn handle_text(record: &Arc<ConnectionRecord>, dispatch: &Arc<dyn Dispatch>, text: &str) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!(client_id = %record.identity(), len = text.len(), "message too large, dropping");
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(client_id = %record.identity(), "failed to parse message: {e}");
            return;
        }
    };

    trace!(client_id = %record.identity(), msg_type = ?msg.msg_type, id = %msg.id, "received message");
    dispatch.dispatch(Arc::clone(record), msg).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures_util::stream;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::handler::HandlerFuture;
    use c3_protocol::MessageType;

    /// Records the ids of every dispatched message.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Dispatch for Recorder {
        fn dispatch(&self, _from: Arc<ConnectionRecord>, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                // Yield so a reordering bug would show up.
                tokio::task::yield_now().await;
                self.seen.lock().unwrap().push(msg.id);
            })
        }
    }

    fn text(id: &str) -> Result<tungstenite::Message, tungstenite::Error> {
        let msg = Message::new::<()>(id, MessageType::CommandResult, None).unwrap();
        Ok(tungstenite::Message::Text(
            serde_json::to_string(&msg).unwrap().into(),
        ))
    }

    fn record() -> Arc<ConnectionRecord> {
        ConnectionRecord::new("A1".into(), None, &CancellationToken::new()).0
    }

    #[tokio::test]
    async fn inbound_order_is_preserved() {
        let recorder = Arc::new(Recorder::default());
        let frames = stream::iter(vec![text("m1"), text("m2"), text("m3")]);

        let reason = read_pump(frames, record(), recorder.clone()).await;

        assert_eq!(reason, CloseReason::PeerClosed);
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn malformed_and_binary_frames_are_skipped() {
        let recorder = Arc::new(Recorder::default());
        let frames = stream::iter(vec![
            Ok(tungstenite::Message::Text("not json {{{".to_string().into())),
            Ok(tungstenite::Message::Binary(vec![1, 2, 3].into())),
            text("ok"),
        ]);

        read_pump(frames, record(), recorder.clone()).await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["ok"]);
    }

    #[tokio::test]
    async fn read_error_is_terminal() {
        let recorder = Arc::new(Recorder::default());
        let rec = record();
        let frames = stream::iter(vec![
            Err(tungstenite::Error::ConnectionClosed),
            text("never"),
        ]);

        let reason = read_pump(frames, rec.clone(), recorder.clone()).await;

        assert_eq!(reason, CloseReason::ReadError);
        assert!(recorder.seen.lock().unwrap().is_empty());
        assert!(!rec.sender().is_open());
    }

    #[tokio::test]
    async fn close_frame_ends_pump() {
        let recorder = Arc::new(Recorder::default());
        let frames = stream::iter(vec![Ok(tungstenite::Message::Close(None)), text("late")]);

        let reason = read_pump(frames, record(), recorder.clone()).await;
        assert_eq!(reason, CloseReason::PeerClosed);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_unblocks_pending_read() {
        let recorder = Arc::new(Recorder::default());
        let rec = record();
        let frames = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();

        let handle = tokio::spawn(read_pump(frames, rec.clone(), recorder));
        rec.close(CloseReason::Unregistered);

        let reason = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
        assert_eq!(reason, CloseReason::Unregistered);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_triggers_pong_timeout() {
        let recorder = Arc::new(Recorder::default());
        let frames = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();

        let reason = read_pump(frames, record(), recorder).await;
        assert_eq!(reason, CloseReason::PongTimeout);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let recorder = Arc::new(Recorder::default());
        let (rec, mut outbound) =
            ConnectionRecord::new("A1".into(), None, &CancellationToken::new());
        let frames = stream::iter(vec![Ok(tungstenite::Message::Ping(vec![7].into()))]);

        read_pump(frames, rec, recorder).await;

        let frame = outbound.try_recv().expect("pong queued");
        assert!(matches!(frame, tungstenite::Message::Pong(ref d) if d[..] == [7u8]));
    }
}
