//! WebSocket front door for agents and operator consoles.
//!
//! Agents connect with `?client_id=<id>`; operator consoles connect with
//! `?type=web`. Each upgraded connection is attached to the matching hub.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage, WebSocketConfig};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async_with_config};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use c3_protocol::constants::{
    WS_CLOSE_CONNECTION_ERROR, WS_CLOSE_MISSING_CLIENT_ID, WS_MAX_MESSAGE_SIZE,
};

use crate::HubError;
use crate::connection::attach;
use crate::handler::Dispatch;
use crate::hub::ConnectionHub;
use crate::operators::OperatorDesk;
use crate::router::ResponseRouter;
use crate::types::ClientIdentity;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
        }
    }
}

/// Who is on the other end of a new connection, per its query string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerKind {
    Agent(ClientIdentity),
    Operator,
    /// No usable `client_id`; carries the reason for the close frame.
    Rejected(String),
}

fn classify(query: Option<&str>) -> PeerKind {
    let mut client_id = None;
    let mut peer_type = None;
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        match key.as_ref() {
            "client_id" => client_id = Some(value.into_owned()),
            "type" => peer_type = Some(value.into_owned()),
            _ => {}
        }
    }

    if peer_type.as_deref() == Some("web") {
        return PeerKind::Operator;
    }
    match client_id {
        None => PeerKind::Rejected("client_id required".into()),
        Some(raw) => match ClientIdentity::parse(&raw) {
            Ok(id) => PeerKind::Agent(id),
            Err(e) => PeerKind::Rejected(e.to_string()),
        },
    }
}

/// Accepts WebSocket connections and hands them to the agent or operator
/// hub.
pub struct HubServer {
    config: ServerConfig,
    router: Arc<ResponseRouter>,
    operators: Arc<ConnectionHub>,
    desk: Arc<OperatorDesk>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HubServer {
    /// Creates a server. Agents are attached to `router`'s hub.
    pub fn new(
        config: ServerConfig,
        router: Arc<ResponseRouter>,
        operators: Arc<ConnectionHub>,
    ) -> Arc<Self> {
        let desk = Arc::new(OperatorDesk::new(Arc::clone(&router)));
        Arc::new(Self {
            config,
            router,
            operators,
            desk,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn agents(&self) -> &Arc<ConnectionHub> {
        self.router.hub()
    }

    pub fn operators(&self) -> &Arc<ConnectionHub> {
        &self.operators
    }

    pub fn router(&self) -> &Arc<ResponseRouter> {
        &self.router
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Stops accepting; [`run`](Self::run) then closes every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), HubError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("hub server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }

        drop(listener);
        self.operators.shutdown().await;
        self.agents().shutdown().await;
        self.router.cancel_all().await;
        Ok(())
    }

    /// Upgrades one TCP connection and attaches it to a hub.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), HubError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);

        let mut query = None;
        let capture_query = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            query = req.uri().query().map(str::to_owned);
            Ok(resp)
        };
        let ws_stream = accept_hdr_async_with_config(stream, capture_query, Some(ws_config)).await?;

        let (identity, hub, dispatch): (ClientIdentity, &Arc<ConnectionHub>, Arc<dyn Dispatch>) =
            match classify(query.as_deref()) {
                PeerKind::Agent(id) => (
                    id,
                    self.router.hub(),
                    Arc::clone(&self.router) as Arc<dyn Dispatch>,
                ),
                PeerKind::Operator => (
                    ClientIdentity::new(format!("operator-{}", Uuid::new_v4())),
                    &self.operators,
                    Arc::clone(&self.desk) as Arc<dyn Dispatch>,
                ),
                PeerKind::Rejected(reason) => {
                    tracing::warn!(%peer_addr, %reason, "rejecting connection");
                    reject(ws_stream, WS_CLOSE_MISSING_CLIENT_ID, reason).await;
                    return Ok(());
                }
            };

        tracing::info!(%peer_addr, client_id = %identity, hub = hub.label(), "WebSocket connection established");

        if hub.shutdown_token().is_cancelled() {
            reject(ws_stream, WS_CLOSE_CONNECTION_ERROR, "server shutting down".into()).await;
            return Ok(());
        }

        let (write, read) = ws_stream.split();
        if let Err(e) = attach(hub, identity.clone(), Some(peer_addr.to_string()), read, write, dispatch).await {
            tracing::warn!(%peer_addr, client_id = %identity, "attach failed: {e}");
            return Err(e);
        }
        Ok(())
    }
}

async fn reject(mut ws: WebSocketStream<TcpStream>, code: u16, reason: String) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    let _ = ws.send(WsMessage::Close(Some(frame))).await;
    // Let the peer's close reply arrive so the handshake completes.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), ws.next()).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use c3_protocol::MessageType;
    use c3_protocol::envelope::Message;
    use tokio_tungstenite::MaybeTlsStream;

    use super::*;
    use crate::handler::LogOnly;
    use crate::store::Journal;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start() -> (Arc<HubServer>, tokio::task::JoinHandle<()>, u16) {
        let agents = Arc::new(ConnectionHub::new("agents"));
        let operators = Arc::new(ConnectionHub::new("operators"));
        let router = Arc::new(ResponseRouter::new(
            agents,
            Arc::new(LogOnly),
            Arc::new(Journal::disabled()),
        ));
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        };
        let server = HubServer::new(config, router, operators);
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        let mut port = 0;
        for _ in 0..50 {
            port = server.port().await;
            if port > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(port > 0, "should have bound to a dynamic port");
        (server, handle, port)
    }

    async fn next_msg(ws: &mut Client) -> Message {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn wait_online(server: &HubServer, id: &str) {
        for _ in 0..100 {
            if server.agents().is_online(id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{id} never came online");
    }

    #[test]
    fn classify_query_strings() {
        assert_eq!(
            classify(Some("client_id=A1")),
            PeerKind::Agent(ClientIdentity::new("A1"))
        );
        assert_eq!(
            classify(Some("client_id=host%20one&x=1")),
            PeerKind::Agent(ClientIdentity::new("host one"))
        );
        assert_eq!(classify(Some("type=web")), PeerKind::Operator);
        assert_eq!(classify(Some("type=web&client_id=A1")), PeerKind::Operator);
        assert!(matches!(classify(None), PeerKind::Rejected(_)));
        assert!(matches!(classify(Some("client_id=")), PeerKind::Rejected(_)));
        assert!(matches!(classify(Some("type=agent")), PeerKind::Rejected(_)));
    }

    #[tokio::test]
    async fn missing_client_id_is_closed_with_4000() {
        let (server, handle, port) = start().await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/"))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), WS_CLOSE_MISSING_CLIENT_ID)
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert!(server.agents().is_empty().await);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn agent_registers_and_answers_commands() {
        let (server, handle, port) = start().await;

        let (mut agent, _) =
            tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/?client_id=A1"))
                .await
                .unwrap();
        wait_online(&server, "A1").await;

        let router = Arc::clone(server.router());
        let request = tokio::spawn(async move { router.request("A1", "list_files").await });

        let cmd = next_msg(&mut agent).await;
        assert_eq!(cmd.msg_type, MessageType::Command);
        let reply = Message::new(cmd.id, MessageType::CommandResult, Some(&["a.txt", "b.txt"]))
            .unwrap();
        agent
            .send(WsMessage::Text(serde_json::to_string(&reply).unwrap().into()))
            .await
            .unwrap();

        let result = request.await.unwrap().unwrap();
        assert_eq!(result.payload_json(), Some(r#"["a.txt","b.txt"]"#));

        server.shutdown();
        handle.await.unwrap();
        assert!(server.agents().is_empty().await);
    }

    #[tokio::test]
    async fn operator_drives_agent_through_server() {
        let (server, handle, port) = start().await;

        let (mut agent, _) =
            tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/?client_id=A1"))
                .await
                .unwrap();
        wait_online(&server, "A1").await;
        let (mut operator, _) =
            tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/?type=web"))
                .await
                .unwrap();

        let request = serde_json::json!({
            "id": "op-1",
            "type": "command",
            "payload": {"client_id": "A1", "command": {"action": "whoami"}}
        });
        operator
            .send(WsMessage::Text(request.to_string().into()))
            .await
            .unwrap();

        let cmd = next_msg(&mut agent).await;
        assert_eq!(cmd.payload_json(), Some(r#"{"action":"whoami"}"#));
        let reply = Message::new(cmd.id, MessageType::CommandResult, Some("root")).unwrap();
        agent
            .send(WsMessage::Text(serde_json::to_string(&reply).unwrap().into()))
            .await
            .unwrap();

        let answer = next_msg(&mut operator).await;
        assert_eq!(answer.id, "op-1");
        assert_eq!(answer.payload_json(), Some("\"root\""));
        assert_eq!(server.operators().len().await, 1);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_socket() {
        let (server, handle, port) = start().await;
        let url = format!("ws://127.0.0.1:{port}/?client_id=A1");

        let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        wait_online(&server, "A1").await;
        let first_id = server.agents().lookup("A1").await.unwrap().id();

        let (_second, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(2), first.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(frame, WsMessage::Close(Some(ref f)) if u16::from(f.code) == 4002));

        for _ in 0..100 {
            if let Ok(record) = server.agents().lookup("A1").await {
                if record.id() != first_id {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_ne!(server.agents().lookup("A1").await.unwrap().id(), first_id);
        assert_eq!(server.agents().len().await, 1);

        server.shutdown();
        handle.await.unwrap();
    }
}
