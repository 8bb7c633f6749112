use axum::extract::ws;
use axum::http::HeaderMap;
use serde::Serialize;
use smol_str::SmolStr;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc::UnboundedSender, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::dialect::Dialect;
use crate::executor::Executor;
use crate::hooks::{Hooks, SessionContext};
use crate::protocol::types as protocol;
use crate::registry::Registry;

/// Transport configuration, one instance per server.
#[derive(Clone, Debug, Default)]
pub struct WebSocketOptions {
    /// Bounds the time between upgrade and a valid `connection_init`.
    /// `None` waits forever.
    pub init_timeout: Option<Duration>,
    /// Enables the legacy `ka` heartbeat loop at the given interval.
    /// Ignored on the graphql-transport-ws dialect.
    pub keep_alive_interval: Option<Duration>,
    /// Enables the server-initiated `ping` loop at the given interval.
    /// Ignored on the graphql-ws dialect.
    pub ping_pong_interval: Option<Duration>,
    /// When true, a ping that goes unanswered does not terminate the
    /// connection.
    pub missing_pong_ok: bool,
    /// Emits unsolicited `pong` heartbeats at the given interval.
    /// Ignored on the graphql-ws dialect.
    pub pong_only_interval: Option<Duration>,
}

/// Context required to handle a WebSocket connection.
#[derive(Clone)] // Cheap to clone as heavy fields are wrapped in `Arc`
pub struct Context<M> {
    pub executor: Arc<dyn Executor>,
    pub hooks: Arc<dyn Hooks>,
    pub options: WebSocketOptions,
    pub metrics: M,
    /// Headers of the HTTP upgrade request; carried into every operation's
    /// session context.
    pub handshake_headers: Arc<HeaderMap>,
}

/// Represents a WebSocket connection ID.
#[derive(Clone, Serialize, PartialEq, Eq, Hash, derive_more::Display)]
pub struct WebSocketId(SmolStr);

impl WebSocketId {
    /// Creates a new WebSocket connection ID.
    pub fn new() -> Self {
        Self(SmolStr::new(uuid::Uuid::new_v4().to_string()))
    }
}

impl Default for WebSocketId {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutable and freely clone-able collection of WebSocket connections.
#[derive(Clone)]
pub struct Connections<M>(pub Arc<RwLock<HashMap<WebSocketId, Connection<M>>>>);

impl<M> Connections<M> {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(HashMap::new())))
    }

    pub(crate) async fn new_connection(
        &self,
        id: WebSocketId,
        dialect: &'static dyn Dialect,
        context: Context<M>,
        channel: UnboundedSender<Message>,
    ) -> Connection<M>
    where
        M: Clone,
    {
        let new_connection = Connection::new(id, dialect, context, channel);
        let mut map = self.0.write().await;
        map.insert(new_connection.id.clone(), new_connection.clone());
        new_connection
    }

    pub(crate) async fn drop(&self, id: &WebSocketId) {
        let mut map = self.0.write().await;
        if let Some(connection) = map.remove(id) {
            // Make sure no producer outlives the connection entry.
            connection.operations.cancel_all().await;
        }
    }
}

impl<M> Default for Connections<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Represents an internal WebSocket connection.
/// Designed for efficient cloning, as all contained fields are inexpensive to
/// clone.
#[derive(Clone)]
pub struct Connection<M> {
    /// Unique WebSocket connection ID.
    pub id: WebSocketId,
    /// The negotiated wire dialect.
    pub(crate) dialect: &'static dyn Dialect,
    /// Shared connection context.
    pub context: Context<M>,
    /// Handshake state of the protocol.
    pub(crate) protocol_state: Arc<RwLock<protocol::ConnectionInitState>>,
    /// Session context in effect before init completes; used for hooks that
    /// fire on connections that were never initialized.
    pub(crate) handshake_session: Arc<SessionContext>,
    /// Channel for sending messages over the WebSocket. Unbounded so that
    /// producers can never deadlock against cancellation while the writer
    /// shuts down.
    send_channel: UnboundedSender<Message>,
    /// Live operations keyed by client-chosen ID.
    pub(crate) operations: Arc<Registry>,
    /// Producer tasks; drained on shutdown.
    pub(crate) producers: TaskTracker,
    /// Cancelled when the session is going away; every producer and timer
    /// loop is a child of this token.
    pub(crate) cancellation: CancellationToken,
    /// Set while an emitted ping awaits its pong; cleared by the reader.
    pub(crate) pending_pong: Arc<AtomicBool>,
    /// The close code the connection ended with; first writer wins.
    close_code: Arc<OnceLock<u16>>,
    /// Flipped once the init handshake has been accepted and acked.
    initialized: Arc<watch::Sender<bool>>,
}

/// A snapshot of an active WebSocket connection, for monitoring purposes.
#[derive(Serialize)]
pub struct ActiveConnection {
    /// The connection ID.
    pub connection_id: WebSocketId,
    /// The negotiated subprotocol.
    pub subprotocol: &'static str,
    /// A list of operations currently live on the connection.
    pub active_operations: Vec<protocol::OperationId>,
}

impl<M> Connection<M> {
    pub(crate) fn new(
        id: WebSocketId,
        dialect: &'static dyn Dialect,
        context: Context<M>,
        channel: UnboundedSender<Message>,
    ) -> Self {
        let handshake_session = Arc::new(SessionContext::new(context.handshake_headers.clone()));
        let (initialized, _) = watch::channel(false);
        Self {
            id,
            dialect,
            context,
            protocol_state: Arc::new(RwLock::new(protocol::ConnectionInitState::NotInitialized)),
            handshake_session,
            send_channel: channel,
            operations: Arc::new(Registry::new()),
            producers: TaskTracker::new(),
            cancellation: CancellationToken::new(),
            pending_pong: Arc::new(AtomicBool::new(false)),
            close_code: Arc::new(OnceLock::new()),
            initialized: Arc::new(initialized),
        }
    }

    pub(crate) async fn to_active_connection(&self) -> ActiveConnection {
        ActiveConnection {
            connection_id: self.id.clone(),
            subprotocol: self.dialect.subprotocol(),
            active_operations: self.operations.active_ids().await,
        }
    }

    /// The IDs of the operations currently live on this connection.
    pub async fn active_operations(&self) -> Vec<protocol::OperationId> {
        self.operations.active_ids().await
    }

    /// Sends a message over the WebSocket. If the writer has already gone
    /// away, the message is dropped; the connection is closing anyway.
    pub(crate) fn send(&self, message: Message) {
        let _ = self.send_channel.send(message);
    }

    /// The session context in effect: the one produced by the init hook, or
    /// the handshake context while the connection is uninitialized.
    pub(crate) async fn session(&self) -> Arc<SessionContext> {
        match &*self.protocol_state.read().await {
            protocol::ConnectionInitState::Initialized { session } => session.clone(),
            protocol::ConnectionInitState::NotInitialized => self.handshake_session.clone(),
        }
    }

    /// Marks the handshake as complete, waking the init watchdog.
    pub(crate) fn notify_initialized(&self) {
        self.initialized.send_replace(true);
    }

    pub(crate) async fn is_initialized(&self) -> bool {
        matches!(
            &*self.protocol_state.read().await,
            protocol::ConnectionInitState::Initialized { .. }
        )
    }

    /// Resolves once the init handshake has been accepted.
    pub(crate) async fn wait_initialized(&self) {
        let mut receiver = self.initialized.subscribe();
        // Only fails if the sender is dropped, which this connection holds.
        let _ = receiver.wait_for(|ready| *ready).await;
    }

    /// Records the close code the connection ends with. Only the first code
    /// sticks: a close frame already sent or received wins over later
    /// shutdown paths.
    pub(crate) fn record_close_code(&self, code: u16) {
        let _ = self.close_code.set(code);
    }

    /// The recorded close code, defaulting to 1006 (abnormal closure) when
    /// the connection ended without any close frame.
    pub(crate) fn close_code(&self) -> u16 {
        self.close_code.get().copied().unwrap_or(1006)
    }
}

/// Represents a message that can be sent over a WebSocket connection.
pub enum Message {
    /// Represents a raw WebSocket message.
    Raw(ws::Message),
    /// Represents a message using the protocol server format.
    Protocol(Box<protocol::ServerMessage>),
}

impl Message {
    /// Creates a close message with the given code and reason.
    fn close_message(code: u16, reason: impl Into<Cow<'static, str>>) -> Message {
        Message::Raw(close_ws_message(code, reason))
    }

    /// Clean closure after a client `connection_terminate` or an observed
    /// client close frame (1000).
    pub(crate) fn terminated() -> Self {
        Self::close_message(1000, "terminated")
    }

    /// A protocol violation observed before the connection was acknowledged
    /// (1011).
    pub(crate) fn protocol_error() -> Self {
        Self::close_message(1011, "Protocol error")
    }

    /// The init hook rejected the connection (4403).
    pub(crate) fn forbidden() -> Self {
        Self::close_message(4403, "Forbidden")
    }

    /// A second `connection_init` arrived on an initialized connection
    /// (4429).
    pub(crate) fn too_many_init_requests() -> Self {
        Self::close_message(4429, "Too many initialization requests")
    }

    /// A `start`/`subscribe` reused an ID that is still live (4409).
    pub(crate) fn subscriber_already_exists(operation_id: &protocol::OperationId) -> Self {
        let message = format!("Subscriber for {} already exists", operation_id.0);
        Self::close_message(4409, message)
    }

    /// No `connection_init` arrived within the configured window (4408).
    pub(crate) fn conn_init_timeout() -> Self {
        Self::close_message(4408, "Connection initialization timeout")
    }

    /// An emitted ping went unanswered for a full interval (4499).
    pub(crate) fn pong_timeout() -> Self {
        Self::close_message(4499, "Pong timeout")
    }

    /// The session deadline attached by the init hook elapsed (1013).
    pub(crate) fn session_expired() -> Self {
        Self::close_message(1013, "Session expired")
    }

    /// Force re-connect with a message (1012).
    pub(crate) fn force_reconnect(message: &'static str) -> Self {
        Self::close_message(1012, message)
    }
}

/// Creates a close WebSocket message with the specified code and reason.
fn close_ws_message(code: u16, reason: impl Into<Cow<'static, str>>) -> ws::Message {
    ws::Message::Close(Some(ws::CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Returns a WebSocket message indicating an internal server error (1011).
pub(crate) fn internal_server_message_ws() -> ws::Message {
    close_ws_message(1011, "Internal Server Error")
}
