//! In-memory transports and helpers shared by the unit tests.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::BoxStream;
use futures_util::{Sink, StreamExt, sink, stream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use c3_protocol::envelope::Message;

use crate::connection::{ConnectionRecord, attach};
use crate::handler::{Dispatch, LogOnly};
use crate::hub::ConnectionHub;
use crate::router::ResponseRouter;
use crate::store::Journal;

pub(crate) type FakeRead = BoxStream<'static, Result<WsMessage, tungstenite::Error>>;
pub(crate) type FakeWrite = Pin<Box<dyn Sink<WsMessage, Error = tungstenite::Error> + Send>>;

const RECV_WAIT: Duration = Duration::from_secs(2);

/// Agent side of an in-memory link.
pub(crate) struct FakeAgent {
    inbound: mpsc::UnboundedSender<Result<WsMessage, tungstenite::Error>>,
    outbound: mpsc::UnboundedReceiver<WsMessage>,
}

/// Builds a read stream and write sink backed by channels, plus the
/// agent-side handle that drives them.
pub(crate) fn fake_transport() -> (FakeRead, FakeWrite, FakeAgent) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<WsMessage>();

    let read = stream::unfold(in_rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    })
    .boxed();
    let write: FakeWrite = Box::pin(sink::unfold(out_tx, |tx, msg: WsMessage| async move {
        tx.send(msg)
            .map_err(|_| tungstenite::Error::ConnectionClosed)?;
        Ok::<_, tungstenite::Error>(tx)
    }));

    (
        read,
        write,
        FakeAgent {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}

impl FakeAgent {
    pub(crate) fn send_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(Ok(WsMessage::Text(text.into().into())));
    }

    pub(crate) fn send_msg(&self, msg: &Message) {
        self.send_text(serde_json::to_string(msg).unwrap());
    }

    /// Ends the inbound stream and stops reading outbound frames.
    pub(crate) fn hang_up(self) {
        drop(self.inbound);
    }

    /// Next non-ping frame sent by the hub.
    pub(crate) async fn next_frame(&mut self) -> WsMessage {
        loop {
            let frame = tokio::time::timeout(RECV_WAIT, self.outbound.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("transport closed");
            if !matches!(frame, WsMessage::Ping(_)) {
                return frame;
            }
        }
    }

    pub(crate) async fn next_text(&mut self) -> String {
        match self.next_frame().await {
            WsMessage::Text(text) => text.as_str().to_owned(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    pub(crate) async fn next_msg(&mut self) -> Message {
        serde_json::from_str(&self.next_text().await).unwrap()
    }

    /// Reads until a close frame arrives. `None` if the transport ended
    /// without one.
    pub(crate) async fn expect_close(&mut self) -> Option<CloseFrame> {
        loop {
            let frame = tokio::time::timeout(RECV_WAIT, self.outbound.recv())
                .await
                .expect("timed out waiting for close")?;
            if let WsMessage::Close(frame) = frame {
                return frame;
            }
        }
    }

    /// Like [`expect_close`](Self::expect_close) but only looks at frames
    /// already sent.
    pub(crate) fn try_close_frame(&mut self) -> Option<CloseFrame> {
        while let Ok(frame) = self.outbound.try_recv() {
            if let WsMessage::Close(frame) = frame {
                return frame;
            }
        }
        None
    }
}

/// Agent hub with a router that only logs unsolicited traffic.
pub(crate) fn test_hub() -> (Arc<ConnectionHub>, Arc<ResponseRouter>) {
    let hub = Arc::new(ConnectionHub::new("agents").with_teardown_wait(RECV_WAIT));
    let router = Arc::new(ResponseRouter::new(
        Arc::clone(&hub),
        Arc::new(LogOnly),
        Arc::new(Journal::disabled()),
    ));
    (hub, router)
}

/// Attaches a fake agent to `hub`, routing its messages through `router`.
pub(crate) async fn connect(
    hub: &Arc<ConnectionHub>,
    router: &Arc<ResponseRouter>,
    identity: &str,
) -> (Arc<ConnectionRecord>, FakeAgent) {
    let dispatch: Arc<dyn Dispatch> = Arc::clone(router) as Arc<dyn Dispatch>;
    connect_with(hub, dispatch, identity).await
}

pub(crate) async fn connect_with(
    hub: &Arc<ConnectionHub>,
    dispatch: Arc<dyn Dispatch>,
    identity: &str,
) -> (Arc<ConnectionRecord>, FakeAgent) {
    let (read, write, agent) = fake_transport();
    let record = attach(
        hub,
        identity.into(),
        Some("127.0.0.1:9".to_string()),
        read,
        write,
        dispatch,
    )
    .await
    .expect("attach");
    (record, agent)
}
