//! WebSocket ping pump: periodic keepalive pings.

use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;

use c3_protocol::constants::WS_PING_PERIOD;

use crate::connection::Sender;

/// Enqueues a ping every [`WS_PING_PERIOD`] until cancelled or the
/// outbound queue refuses it.
pub(crate) async fn ping_pump(sender: Sender, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(WS_PING_PERIOD);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let ping = tungstenite::Message::Ping(Vec::new().into());
                if sender.send_frame(ping).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connection::ConnectionRecord;

    #[tokio::test]
    async fn ping_pump_stops_on_cancel() {
        let parent = CancellationToken::new();
        let (record, _rx) = ConnectionRecord::new("A1".into(), None, &parent);
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        let handle = tokio::spawn(ping_pump(record.sender(), c));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("should stop")
            .expect("no panic");
    }

    #[tokio::test(start_paused = true)]
    async fn ping_pump_enqueues_pings() {
        let parent = CancellationToken::new();
        let (record, mut rx) = ConnectionRecord::new("A1".into(), None, &parent);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(ping_pump(record.sender(), cancel.clone()));

        let frame = tokio::time::timeout(WS_PING_PERIOD * 2, rx.recv())
            .await
            .expect("ping within period")
            .expect("queue open");
        assert!(matches!(frame, tungstenite::Message::Ping(_)));

        cancel.cancel();
        handle.await.unwrap();
    }
}
