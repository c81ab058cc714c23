//! WebSocket gateway.
//!
//! Authenticates sockets, binds them as sessions and turns inbound frames
//! into [`ChatService`] calls. Each connection is one task: inbound frames
//! are handled one at a time in arrival order, while live pushes from the
//! session outbox and heartbeats are multiplexed with `select!`.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::rest::{self, header_token, ApiError};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    Caller, ChatError, ChatResult, ChatService, ConnectionId, Identity, MessageStore, Session,
    SessionRegistry, TokenValidator,
};
use parley_protocol::{codec, Frame, ProtocolError, WireFormat, PROTOCOL_VERSION};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Messaging operations.
    pub service: ChatService,
    /// Credential verification.
    pub validator: Arc<dyn TokenValidator>,
    /// Server configuration.
    pub config: Config,
    /// Sockets open right now, handshaking or bound.
    connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Create new app state with a fresh session registry.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn MessageStore>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let service = ChatService::new(store, sessions)
            .with_max_text_length(config.limits.max_text_length)
            .with_inbox_preview(config.limits.inbox_preview);

        Self {
            service,
            validator,
            config,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of open sockets, including those still in the handshake.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Take a connection slot, or `None` once `max_connections` are open.
    fn reserve_connection(&self) -> Option<ConnectionSlot> {
        let limit = self.config.limits.max_connections;
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < limit).then_some(open + 1)
            })
            .ok()
            .map(|_| ConnectionSlot(Arc::clone(&self.connections)))
    }
}

/// One reserved connection; the slot is released on drop.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP application: WebSocket endpoint, REST API and health.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .nest("/api/v1", rest::routes())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = &state.config;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, build_app(Arc::clone(&state))).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.service.sessions().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.open_connections(),
        "sessions": stats.session_count,
        "users": stats.user_count,
    }))
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Bearer credential, as an alternative to the `Authorization` header.
    pub token: Option<String>,
    /// Outbound frame encoding.
    #[serde(default)]
    pub encoding: WireFormat,
}

/// WebSocket upgrade handler.
///
/// A credential on the upgrade request is checked before upgrading; a bad
/// one never gets a socket.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(slot) = state.reserve_connection() else {
        warn!(open = state.open_connections(), "Connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    let identity = match params.token.or_else(|| header_token(&headers)) {
        Some(token) => match state.validator.validate(&token).await {
            Ok(identity) => Some(identity),
            Err(err) => {
                debug!(error = %err, "Upgrade rejected");
                metrics::record_handshake_failure();
                return ApiError::from(err).into_response();
            }
        },
        None => None,
    };

    let format = params.encoding;
    ws.on_upgrade(move |socket| async move {
        handle_websocket(socket, state, identity, format).await;
        drop(slot);
    })
}

/// Write half of a socket, encoding frames in the negotiated format.
struct Outlet {
    sink: SplitSink<WebSocket, Message>,
    format: WireFormat,
}

impl Outlet {
    /// Send one frame. A frame that cannot be encoded is replaced by an
    /// error frame under the same request id; only socket failures are
    /// returned.
    async fn send(&mut self, frame: &Frame) -> Result<()> {
        let message = match self.encode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(frame = %frame.frame_type(), error = %e, "Reply could not be encoded");
                let err = ChatError::validation(format!(
                    "{} reply could not be encoded: {}",
                    frame.frame_type(),
                    e
                ));
                metrics::record_error(err.kind());
                self.encode(&err.to_frame(frame.request_id()))?
            }
        };
        metrics::record_frame(payload_len(&message), "outbound");
        self.sink.send(message).await?;
        Ok(())
    }

    fn encode(&self, frame: &Frame) -> Result<Message, ProtocolError> {
        Ok(match self.format {
            WireFormat::Json => Message::Text(codec::encode_json(frame)?),
            WireFormat::Msgpack => Message::Binary(codec::encode(frame)?.to_vec()),
        })
    }
}

/// An inbound frame that failed to decode, with whatever request id could
/// still be read from it.
#[derive(Debug)]
struct Rejected {
    id: u64,
    error: ChatError,
}

impl Rejected {
    fn new(id: Option<u64>, error: ChatError) -> Self {
        Self {
            id: id.unwrap_or(0),
            error,
        }
    }
}

/// Read side decoding: JSON text messages and length-prefixed MessagePack
/// binary messages, which may split or batch frames.
struct Inbound {
    buffer: BytesMut,
    max_message_size: usize,
}

impl Inbound {
    fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }

    /// Decode every complete frame carried by `message`, in order.
    fn decode(&mut self, message: &Message) -> Vec<Result<Frame, Rejected>> {
        let size = payload_len(message);
        if size > self.max_message_size {
            let error = ChatError::validation(format!(
                "message of {} bytes exceeds the {} byte limit",
                size, self.max_message_size
            ));
            return vec![Err(Rejected::new(None, error))];
        }

        match message {
            Message::Text(text) => {
                metrics::record_frame(size, "inbound");
                let decoded = codec::decode_json(text).map_err(|e| {
                    let id = codec::request_id_hint(text.as_bytes(), WireFormat::Json);
                    Rejected::new(id, malformed(e))
                });
                vec![decoded]
            }
            Message::Binary(data) => {
                metrics::record_frame(size, "inbound");
                self.buffer.extend_from_slice(data);
                let mut frames = Vec::new();
                loop {
                    match codec::next_payload(&mut self.buffer) {
                        Ok(Some(payload)) => {
                            let decoded = codec::decode_payload(&payload).map_err(|e| {
                                let id = codec::request_id_hint(&payload, WireFormat::Msgpack);
                                Rejected::new(id, malformed(e))
                            });
                            frames.push(decoded);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            self.buffer.clear();
                            frames.push(Err(Rejected::new(None, malformed(e))));
                            break;
                        }
                    }
                }
                frames
            }
            _ => Vec::new(),
        }
    }
}

fn malformed(err: ProtocolError) -> ChatError {
    ChatError::validation(format!("malformed frame: {}", err))
}

fn payload_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

/// Handle a WebSocket connection from upgrade to close.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Option<Identity>,
    format: WireFormat,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = ConnectionId::generate();
    let (sink, mut stream) = socket.split();
    let mut outlet = Outlet { sink, format };
    let mut inbound = Inbound::new(state.config.limits.max_message_size);

    let identity = match identity {
        Some(identity) => identity,
        None => match await_connect(&mut stream, &mut inbound, &state).await {
            Ok(identity) => identity,
            Err(err) => {
                info!(connection = %connection_id, error = %err, "Handshake failed");
                metrics::record_handshake_failure();
                if outlet.send(&err.to_frame(0)).await.is_ok() {
                    let _ = outlet.sink.send(Message::Close(None)).await;
                }
                return;
            }
        },
    };
    let user_id = identity.user_id;

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(
        connection_id.as_str(),
        user_id.clone(),
        PROTOCOL_VERSION.major,
        heartbeat,
    );
    if outlet.send(&connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        return;
    }

    let (tx, mut outbox) = mpsc::unbounded_channel();
    let sessions = state.service.sessions();
    sessions.bind(Session::new(connection_id.clone(), user_id.clone(), tx));
    metrics::set_active_sessions(sessions.session_count());
    info!(connection = %connection_id, user = %user_id, "Session established");

    let caller = Caller::connection(&user_id, &connection_id);
    let inbox = match state.service.load_inbox(caller).await {
        Ok(threads) => Frame::Inbox { id: 0, threads },
        Err(err) => err.to_frame(0),
    };

    if outlet.send(&inbox).await.is_ok() {
        let session = serve_session(
            &state,
            caller,
            &mut outlet,
            &mut stream,
            &mut inbound,
            &mut outbox,
        );
        if let Err(e) = session.await {
            debug!(connection = %connection_id, error = %e, "Socket write failed");
        }
    }

    sessions.unbind(&connection_id);
    metrics::set_active_sessions(sessions.session_count());
    debug!(connection = %connection_id, user = %user_id, "WebSocket disconnected");
}

/// Wait for the `connect` frame of a socket that had no upgrade credential.
async fn await_connect(
    stream: &mut SplitStream<WebSocket>,
    inbound: &mut Inbound,
    state: &AppState,
) -> ChatResult<Identity> {
    let deadline = Duration::from_millis(state.config.handshake.timeout_ms);
    let frame = tokio::time::timeout(deadline, first_frame(stream, inbound))
        .await
        .map_err(|_| ChatError::Authentication("handshake timed out".into()))??;

    match frame {
        Frame::Connect { version, token } => {
            if !PROTOCOL_VERSION.accepts_major(version) {
                return Err(ChatError::Authentication(format!(
                    "unsupported protocol version {}, server speaks {}",
                    version, PROTOCOL_VERSION
                )));
            }
            let token =
                token.ok_or_else(|| ChatError::Authentication("missing credential".into()))?;
            state.validator.validate(&token).await
        }
        other => Err(ChatError::Authentication(format!(
            "expected connect, got {}",
            other.frame_type()
        ))),
    }
}

async fn first_frame(
    stream: &mut SplitStream<WebSocket>,
    inbound: &mut Inbound,
) -> ChatResult<Frame> {
    while let Some(Ok(message)) = stream.next().await {
        if let Message::Close(_) = message {
            break;
        }
        if let Some(decoded) = inbound.decode(&message).into_iter().next() {
            return decoded.map_err(|r| ChatError::Authentication(r.error.to_string()));
        }
    }
    Err(ChatError::Authentication(
        "connection closed before connect".into(),
    ))
}

/// Message loop of an established session. Returns when the peer goes away.
async fn serve_session(
    state: &AppState,
    caller: Caller<'_>,
    outlet: &mut Outlet,
    stream: &mut SplitStream<WebSocket>,
    inbound: &mut Inbound,
    outbox: &mut mpsc::UnboundedReceiver<Arc<Frame>>,
) -> Result<()> {
    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat =
        tokio::time::interval(Duration::from_millis(state.config.heartbeat.interval_ms));
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            Some(frame) = outbox.recv() => {
                outlet.send(&frame).await?;
            }

            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        warn!(user = %caller.user_id, error = %e, "WebSocket error");
                        return Ok(());
                    }
                    None => return Ok(()),
                };
                last_seen = Instant::now();

                match message {
                    Message::Ping(data) => outlet.sink.send(Message::Pong(data)).await?,
                    Message::Pong(_) => {}
                    Message::Close(_) => {
                        debug!(user = %caller.user_id, "Received close frame");
                        return Ok(());
                    }
                    message => {
                        for decoded in inbound.decode(&message) {
                            if let Some(reply) = dispatch(state, caller, decoded).await {
                                outlet.send(&reply).await?;
                            }
                        }
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= idle_timeout {
                    info!(user = %caller.user_id, "Closing idle connection");
                    let _ = outlet.sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                outlet.sink.send(Message::Ping(Vec::new())).await?;
            }
        }
    }
}

/// Run one inbound request and produce the reply for its origin, if any.
async fn dispatch(
    state: &AppState,
    caller: Caller<'_>,
    decoded: Result<Frame, Rejected>,
) -> Option<Frame> {
    let frame = match decoded {
        Ok(frame) => frame,
        Err(Rejected { id, error }) => {
            debug!(user = %caller.user_id, id, error = %error, "Malformed frame");
            metrics::record_error(error.kind());
            return Some(error.to_frame(id));
        }
    };

    let id = frame.request_id();
    let request = frame.frame_type().as_str();
    let start = Instant::now();
    let service = &state.service;

    let result = match frame {
        Frame::SendMessage {
            id,
            recipient_id,
            text,
        } => service
            .send(caller, &recipient_id, &text)
            .await
            .map(|sent| {
                metrics::record_message(sent.delivery.total());
                Some(Frame::Sent {
                    id,
                    message: sent.message,
                })
            }),

        Frame::LoadConversation { id, recipient_id } => service
            .load_conversation(caller, &recipient_id)
            .await
            .map(|messages| {
                Some(Frame::Conversation {
                    id,
                    recipient_id,
                    messages,
                })
            }),

        Frame::LoadInbox { id } => service
            .load_inbox(caller)
            .await
            .map(|threads| Some(Frame::Inbox { id, threads })),

        Frame::MarkRead { id, sender_id } => service
            .mark_read(caller, &sender_id)
            .await
            .map(|updated| Some(Frame::ack_updated(id, updated))),

        Frame::DeleteMessage { id, message_id } => service
            .delete(caller, message_id)
            .await
            .map(|_| Some(Frame::ack(id))),

        Frame::Ping { timestamp } => Ok(Some(Frame::pong(timestamp))),

        Frame::Pong { .. } => Ok(None),

        Frame::Connect { version, .. } => {
            debug!(user = %caller.user_id, version, "Connect frame (already connected)");
            Ok(None)
        }

        other => Err(ChatError::validation(format!(
            "unexpected frame type {}",
            other.frame_type()
        ))),
    };

    metrics::record_latency(request, start.elapsed().as_secs_f64());

    match result {
        Ok(reply) => reply,
        Err(err) => {
            warn!(user = %caller.user_id, request, kind = %err.kind(), error = %err, "Request failed");
            metrics::record_error(err.kind());
            Some(err.to_frame(id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{JwtValidator, MemoryStore};
    use parley_protocol::{ErrorKind, UserId};
    use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    const SECRET: &str = "gateway-test-secret";

    type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn spawn_server(config: Config) -> (String, Arc<AppState>) {
        spawn_server_with(config, Arc::new(MemoryStore::new())).await
    }

    async fn spawn_server_with(config: Config, store: Arc<MemoryStore>) -> (String, Arc<AppState>) {
        let state = Arc::new(AppState::new(
            config,
            store,
            Arc::new(JwtValidator::new(SECRET)),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_app(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{}/ws", addr), state)
    }

    fn token(user: &str) -> String {
        JwtValidator::new(SECRET)
            .issue(&Identity::new(user), chrono::Duration::minutes(5))
            .unwrap()
    }

    async fn next_frame(client: &mut Client) -> Frame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .unwrap();
            match message {
                WsMessage::Text(text) => return codec::decode_json(&text).unwrap(),
                WsMessage::Binary(data) => return codec::decode(&data).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send(client: &mut Client, frame: &Frame) {
        client
            .send(WsMessage::Text(codec::encode_json(frame).unwrap()))
            .await
            .unwrap();
    }

    /// Connect with a query token and consume `connected` and `inbox`.
    async fn join(url: &str, user: &str) -> Client {
        let (mut client, _) = connect_async(format!("{}?token={}", url, token(user)))
            .await
            .unwrap();
        assert!(matches!(next_frame(&mut client).await, Frame::Connected { .. }));
        assert!(matches!(next_frame(&mut client).await, Frame::Inbox { .. }));
        client
    }

    async fn assert_silent(client: &mut Client) {
        let next = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
        assert!(next.is_err(), "unexpected frame: {:?}", next);
    }

    #[tokio::test]
    async fn test_connected_then_inbox() {
        let (url, _) = spawn_server(Config::default()).await;
        let (mut client, _) = connect_async(format!("{}?token={}", url, token("u1")))
            .await
            .unwrap();

        match next_frame(&mut client).await {
            Frame::Connected {
                user_id, version, ..
            } => {
                assert_eq!(user_id, UserId::new("u1"));
                assert_eq!(version, PROTOCOL_VERSION.major);
            }
            other => panic!("expected connected, got {:?}", other),
        }
        match next_frame(&mut client).await {
            Frame::Inbox { id, threads } => {
                assert_eq!(id, 0);
                assert!(threads.is_empty());
            }
            other => panic!("expected inbox, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_token_rejected_before_upgrade() {
        let (url, state) = spawn_server(Config::default()).await;
        match connect_async(format!("{}?token=garbage", url)).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
            other => panic!("expected HTTP 401, got {:?}", other.map(|(_, r)| r.status())),
        }
        assert_eq!(state.service.sessions().session_count(), 0);
    }

    #[tokio::test]
    async fn test_late_handshake() {
        let (url, state) = spawn_server(Config::default()).await;
        let (mut client, _) = connect_async(url.as_str()).await.unwrap();

        send(&mut client, &Frame::connect(1, Some(token("u7")))).await;
        assert!(matches!(
            next_frame(&mut client).await,
            Frame::Connected { user_id, .. } if user_id == UserId::new("u7")
        ));
        assert!(matches!(next_frame(&mut client).await, Frame::Inbox { .. }));
        assert!(state.service.sessions().is_online(&"u7".into()));
    }

    #[tokio::test]
    async fn test_request_before_handshake_is_rejected() {
        let (url, state) = spawn_server(Config::default()).await;
        let (mut client, _) = connect_async(url.as_str()).await.unwrap();

        send(&mut client, &Frame::send_message(1, "u2", "hi")).await;
        match next_frame(&mut client).await {
            Frame::Error { kind, code, .. } => {
                assert_eq!(kind, ErrorKind::AuthenticationError);
                assert_eq!(code, 4001);
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(state.service.sessions().session_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let mut config = Config::default();
        config.handshake.timeout_ms = 100;
        let (url, _) = spawn_server(config).await;
        let (mut client, _) = connect_async(url.as_str()).await.unwrap();

        assert!(matches!(
            next_frame(&mut client).await,
            Frame::Error {
                kind: ErrorKind::AuthenticationError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_send_and_live_delivery() {
        let (url, _) = spawn_server(Config::default()).await;
        let mut alice = join(&url, "u1").await;
        let mut bob = join(&url, "u2").await;

        send(&mut alice, &Frame::send_message(1, "u2", "hi")).await;

        let stored = match next_frame(&mut alice).await {
            Frame::Sent { id, message } => {
                assert_eq!(id, 1);
                message
            }
            other => panic!("expected sent, got {:?}", other),
        };
        assert_eq!(stored.sender_id, UserId::new("u1"));
        assert!(!stored.read);

        match next_frame(&mut bob).await {
            Frame::Message { message } => assert_eq!(message, stored),
            other => panic!("expected message, got {:?}", other),
        }
        assert_silent(&mut alice).await;
    }

    #[tokio::test]
    async fn test_sender_other_sessions_receive_copy() {
        let (url, _) = spawn_server(Config::default()).await;
        let mut phone = join(&url, "u1").await;
        let mut laptop = join(&url, "u1").await;

        send(&mut phone, &Frame::send_message(3, "u2", "from phone")).await;
        assert!(matches!(next_frame(&mut phone).await, Frame::Sent { id: 3, .. }));
        assert!(matches!(
            next_frame(&mut laptop).await,
            Frame::Message { message } if message.text == "from phone"
        ));
    }

    #[tokio::test]
    async fn test_conversation_order_and_validation() {
        let (url, _) = spawn_server(Config::default()).await;
        let mut alice = join(&url, "u1").await;

        send(&mut alice, &Frame::send_message(1, "u2", "")).await;
        assert!(matches!(
            next_frame(&mut alice).await,
            Frame::Error {
                id: 1,
                kind: ErrorKind::ValidationError,
                code: 4000,
                ..
            }
        ));

        send(&mut alice, &Frame::send_message(2, "u2", "first")).await;
        send(&mut alice, &Frame::send_message(3, "u2", "second")).await;
        assert!(matches!(next_frame(&mut alice).await, Frame::Sent { id: 2, .. }));
        assert!(matches!(next_frame(&mut alice).await, Frame::Sent { id: 3, .. }));

        send(&mut alice, &Frame::load_conversation(4, "u2")).await;
        match next_frame(&mut alice).await {
            Frame::Conversation { id, messages, .. } => {
                assert_eq!(id, 4);
                let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
                assert_eq!(texts, ["first", "second"]);
            }
            other => panic!("expected conversation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mark_read_and_receipt() {
        let (url, _) = spawn_server(Config::default()).await;
        let mut alice = join(&url, "u1").await;
        let mut bob = join(&url, "u2").await;

        for (id, text) in [(1, "one"), (2, "two")] {
            send(&mut alice, &Frame::send_message(id, "u2", text)).await;
            assert!(matches!(next_frame(&mut alice).await, Frame::Sent { .. }));
            assert!(matches!(next_frame(&mut bob).await, Frame::Message { .. }));
        }

        send(&mut bob, &Frame::mark_read(9, "u1")).await;
        assert_eq!(next_frame(&mut bob).await, Frame::ack_updated(9, 2));
        match next_frame(&mut alice).await {
            Frame::MessagesRead {
                sender_id,
                reader_id,
                updated,
            } => {
                assert_eq!((sender_id.as_str(), reader_id.as_str(), updated), ("u1", "u2", 2));
            }
            other => panic!("expected messages-read, got {:?}", other),
        }

        send(&mut bob, &Frame::mark_read(10, "u1")).await;
        assert_eq!(next_frame(&mut bob).await, Frame::ack_updated(10, 0));
        assert_silent(&mut alice).await;
    }

    #[tokio::test]
    async fn test_delete_notifies_participants_only() {
        let (url, _) = spawn_server(Config::default()).await;
        let mut alice = join(&url, "u1").await;
        let mut bob = join(&url, "u2").await;
        let mut carol = join(&url, "u3").await;

        send(&mut alice, &Frame::send_message(1, "u2", "oops")).await;
        let id = match next_frame(&mut alice).await {
            Frame::Sent { message, .. } => message.id,
            other => panic!("expected sent, got {:?}", other),
        };
        assert!(matches!(next_frame(&mut bob).await, Frame::Message { .. }));

        send(&mut carol, &Frame::delete_message(5, id)).await;
        assert!(matches!(
            next_frame(&mut carol).await,
            Frame::Error {
                id: 5,
                kind: ErrorKind::NotFoundError,
                ..
            }
        ));

        send(&mut alice, &Frame::delete_message(2, id)).await;
        let mut alice_frames = vec![next_frame(&mut alice).await, next_frame(&mut alice).await];
        alice_frames.sort_by_key(|f| f.frame_type().as_str());
        assert!(matches!(alice_frames[0], Frame::Ack { id: 2, .. }));
        assert!(matches!(alice_frames[1], Frame::MessageDeleted { message_id, .. } if message_id == id));

        assert!(matches!(
            next_frame(&mut bob).await,
            Frame::MessageDeleted { message_id, .. } if message_id == id
        ));
        assert_silent(&mut carol).await;

        send(&mut alice, &Frame::delete_message(3, id)).await;
        assert!(matches!(
            next_frame(&mut alice).await,
            Frame::Error {
                id: 3,
                kind: ErrorKind::NotFoundError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_msgpack_encoding() {
        let (url, _) = spawn_server(Config::default()).await;
        let (mut client, _) =
            connect_async(format!("{}?token={}&encoding=msgpack", url, token("u1")))
                .await
                .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match first {
            WsMessage::Binary(data) => {
                assert!(matches!(codec::decode(&data).unwrap(), Frame::Connected { .. }));
            }
            other => panic!("expected binary frame, got {:?}", other),
        }
        assert!(matches!(next_frame(&mut client).await, Frame::Inbox { .. }));

        let request = codec::encode(&Frame::load_conversation(7, "u2")).unwrap();
        client.send(WsMessage::Binary(request.to_vec())).await.unwrap();
        assert!(matches!(
            next_frame(&mut client).await,
            Frame::Conversation { id: 7, .. }
        ));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let mut config = Config::default();
        config.limits.max_message_size = 256;
        let (url, _) = spawn_server(config).await;
        let mut alice = join(&url, "u1").await;

        let frame = Frame::send_message(1, "u2", "x".repeat(1024));
        send(&mut alice, &frame).await;
        assert!(matches!(
            next_frame(&mut alice).await,
            Frame::Error {
                kind: ErrorKind::ValidationError,
                ..
            }
        ));

        send(&mut alice, &Frame::ping()).await;
        assert!(matches!(next_frame(&mut alice).await, Frame::Pong { .. }));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let (url, _) = spawn_server(config).await;
        let _alice = join(&url, "u1").await;

        match connect_async(format!("{}?token={}", url, token("u2"))).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
            other => panic!("expected HTTP 503, got {:?}", other.map(|(_, r)| r.status())),
        }
    }

    #[tokio::test]
    async fn test_connection_limit_counts_handshaking_sockets() {
        let mut config = Config::default();
        config.limits.max_connections = 1;
        let (url, state) = spawn_server(config).await;

        let (pending, _) = connect_async(url.as_str()).await.unwrap();
        assert_eq!(state.open_connections(), 1);
        assert_eq!(state.service.sessions().session_count(), 0);

        match connect_async(format!("{}?token={}", url, token("u2"))).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
            other => panic!("expected HTTP 503, got {:?}", other.map(|(_, r)| r.status())),
        }

        drop(pending);
        for _ in 0..100 {
            if state.open_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state.open_connections(), 0);
        let _bob = join(&url, "u2").await;
    }

    #[tokio::test]
    async fn test_handshaking_socket_gets_no_fan_out() {
        let (url, state) = spawn_server(Config::default()).await;
        let (mut pending, _) = connect_async(url.as_str()).await.unwrap();
        let mut alice = join(&url, "u1").await;

        send(&mut alice, &Frame::send_message(1, "u2", "early")).await;
        assert!(matches!(next_frame(&mut alice).await, Frame::Sent { id: 1, .. }));
        assert_silent(&mut pending).await;
        assert!(!state.service.sessions().is_online(&"u2".into()));

        send(&mut pending, &Frame::connect(1, Some(token("u2")))).await;
        assert!(matches!(next_frame(&mut pending).await, Frame::Connected { .. }));
        match next_frame(&mut pending).await {
            Frame::Inbox { threads, .. } => assert_eq!(threads[0].messages[0].text, "early"),
            other => panic!("expected inbox, got {:?}", other),
        }
        assert_silent(&mut pending).await;
    }

    #[tokio::test]
    async fn test_malformed_request_answered_under_its_id() {
        let (url, _) = spawn_server(Config::default()).await;
        let mut alice = join(&url, "u1").await;

        let bad_id = r#"{"type":"delete-message","id":42,"messageId":"abc"}"#;
        alice.send(WsMessage::Text(bad_id.into())).await.unwrap();
        assert!(matches!(
            next_frame(&mut alice).await,
            Frame::Error {
                id: 42,
                kind: ErrorKind::ValidationError,
                ..
            }
        ));

        alice.send(WsMessage::Text("not json".into())).await.unwrap();
        assert!(matches!(next_frame(&mut alice).await, Frame::Error { id: 0, .. }));
    }

    #[tokio::test]
    async fn test_history_beyond_frame_limit_keeps_session() {
        let store = Arc::new(MemoryStore::new());
        let text = "x".repeat(4096);
        for _ in 0..4200 {
            store.create(&"u1".into(), &"u2".into(), &text).await.unwrap();
        }
        let (url, state) = spawn_server_with(Config::default(), store).await;

        let (mut bob, _) =
            connect_async(format!("{}?token={}&encoding=msgpack", url, token("u2")))
                .await
                .unwrap();
        assert!(matches!(next_frame(&mut bob).await, Frame::Connected { .. }));
        match next_frame(&mut bob).await {
            Frame::Inbox { threads, .. } => {
                assert_eq!(threads[0].messages.len(), 50);
                assert_eq!(threads[0].unread_count, 4200);
            }
            other => panic!("expected inbox, got {:?}", other),
        }

        let request = codec::encode(&Frame::load_conversation(7, "u1")).unwrap();
        bob.send(WsMessage::Binary(request.to_vec())).await.unwrap();
        assert!(matches!(
            next_frame(&mut bob).await,
            Frame::Error {
                id: 7,
                kind: ErrorKind::ValidationError,
                ..
            }
        ));

        let ping = codec::encode(&Frame::ping()).unwrap();
        bob.send(WsMessage::Binary(ping.to_vec())).await.unwrap();
        assert!(matches!(next_frame(&mut bob).await, Frame::Pong { .. }));
        assert!(state.service.sessions().is_online(&"u2".into()));
    }

    #[tokio::test]
    async fn test_disconnect_unbinds_session() {
        let (url, state) = spawn_server(Config::default()).await;
        let alice = join(&url, "u1").await;
        assert_eq!(state.service.sessions().session_count(), 1);

        drop(alice);
        for _ in 0..100 {
            if state.service.sessions().session_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session still bound after disconnect");
    }
}
