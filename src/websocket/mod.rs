pub mod tasks;
pub mod types;

use axum::extract::ws;
use axum::response::Response;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::dialect;
use crate::metrics::WebSocketMetrics;

pub static SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";
static SEC_WEBSOCKET_ID: &str = "Sec-WebSocket-Id";

/// GraphQL WebSocket server implementation.
pub struct WebSocketServer<M> {
    pub connections: types::Connections<M>,
}

impl<M> WebSocketServer<M> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            connections: types::Connections::new(), // Initialize an empty map of active connections
        }
    }

    /// Shuts down all active WebSocket connections.
    pub async fn shutdown(&self, reason: &'static str) {
        let mut map = self.connections.0.write().await;
        for (_, connection) in map.drain() {
            // A close frame through the writer lane ends the connection.
            connection.send(types::Message::force_reconnect(reason));
        }
    }

    /// Snapshots the active connections, for monitoring purposes.
    pub async fn active_connections(&self) -> Vec<types::ActiveConnection> {
        let map = self.connections.0.read().await;
        let mut active = Vec::with_capacity(map.len());
        for connection in map.values() {
            active.push(connection.to_active_connection().await);
        }
        active
    }

    /// Handles the GraphQL WebSocket connection upgrade request.
    ///
    /// Both subprotocols are offered during negotiation; a client that
    /// requests neither is served the legacy `graphql-ws` dialect.
    pub fn upgrade_and_handle_websocket(
        &self,
        ws_upgrade: ws::WebSocketUpgrade,
        context: types::Context<M>,
    ) -> Response
    where
        M: WebSocketMetrics,
    {
        let websocket_id = types::WebSocketId::new();
        let connections = self.connections.clone();
        let session_websocket_id = websocket_id.clone();
        let mut response = ws_upgrade
            .protocols([
                dialect::GRAPHQL_TRANSPORT_WS_PROTOCOL,
                dialect::GRAPHQL_WS_PROTOCOL,
            ])
            .on_upgrade(move |socket| {
                start_websocket_session(socket, session_websocket_id, context, connections)
            });
        if let Ok(header_value) = websocket_id.to_string().parse() {
            response.headers_mut().insert(SEC_WEBSOCKET_ID, header_value);
        }
        response
    }
}

/// How the handshake phase of a session ended.
enum Handshake {
    /// A valid `connection_init` was accepted and acked.
    Initialized,
    /// The init window elapsed first.
    TimedOut,
    /// The socket went away (or was rejected) before initialization.
    /// `writer_done` records whether it was the writer lane that exited; its
    /// join handle must not be polled again in that case.
    SocketClosed { writer_done: bool },
}

/// Runs one WebSocket session from upgrade to release.
async fn start_websocket_session<M: WebSocketMetrics>(
    socket: ws::WebSocket,
    websocket_id: types::WebSocketId,
    context: types::Context<M>,
    connections: types::Connections<M>,
) {
    let subprotocol = socket
        .protocol()
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let dialect = dialect::negotiate(subprotocol.as_deref());
    let span = tracing::info_span!(
        "websocket_session",
        websocket_id = %websocket_id,
        subprotocol = dialect.subprotocol(),
    );
    run_session(socket, websocket_id, dialect, context, connections)
        .instrument(span)
        .await;
}

async fn run_session<M: WebSocketMetrics>(
    socket: ws::WebSocket,
    websocket_id: types::WebSocketId,
    dialect: &'static dyn dialect::Dialect,
    context: types::Context<M>,
    connections: types::Connections<M>,
) {
    // Split the socket into a sender and receiver
    let (websocket_sender, websocket_receiver) = socket.split();

    // Create a channel for communicating with the WebSocket connection
    let (channel_sender, channel_receiver) = tokio::sync::mpsc::unbounded_channel();

    // Create a new WebSocket connection instance
    let connection = connections
        .new_connection(websocket_id, dialect, context, channel_sender)
        .await;
    connection.context.metrics.record_connection_init();
    tracing::debug!("websocket session started");

    // The writer lane: exactly one task writes frames, in channel order.
    let mut outgoing_task = tokio::spawn(
        tasks::manage_outgoing_messages(connection.clone(), websocket_sender, channel_receiver)
            .in_current_span(),
    );

    // The single reader: decodes frames and dispatches them.
    let mut incoming_task = tokio::spawn(
        tasks::process_incoming_messages(connection.clone(), websocket_receiver).in_current_span(),
    );

    // Handshake phase, bounded by the init timeout when one is configured.
    let handshake = tokio::select! {
        () = connection.wait_initialized() => Handshake::Initialized,
        () = sleep_or_pending(connection.context.options.init_timeout) => Handshake::TimedOut,
        _ = &mut incoming_task => Handshake::SocketClosed { writer_done: false },
        _ = &mut outgoing_task => Handshake::SocketClosed { writer_done: true },
    };

    match handshake {
        Handshake::TimedOut => {
            tracing::debug!("connection was not initialized in time");
            // The client never completed the handshake: close the socket and
            // return without running any hook.
            connection.send(types::Message::conn_init_timeout());
            connection.cancellation.cancel();
            let _ = outgoing_task.await;
            incoming_task.abort();
            connections.drop(&connection.id).await;
            connection.context.metrics.record_connection_drop();
            return;
        }
        Handshake::SocketClosed { writer_done } => {
            let outgoing_task = (!writer_done).then_some(outgoing_task);
            finish_session(connection, connections, incoming_task, outgoing_task).await;
            return;
        }
        Handshake::Initialized => {}
    }

    // Steady state. Timer loops are constructed only for capabilities the
    // negotiated dialect actually has; the loops themselves never check.
    let options = connection.context.options.clone();
    if dialect.keep_alive() {
        if let Some(interval) = options.keep_alive_interval {
            tokio::spawn(tasks::send_keepalive(connection.clone(), interval).in_current_span());
        }
    }
    if dialect.ping_pong() {
        if let Some(interval) = options.ping_pong_interval {
            tokio::spawn(
                tasks::send_pings(connection.clone(), interval, options.missing_pong_ok)
                    .in_current_span(),
            );
        }
        if let Some(interval) = options.pong_only_interval {
            tokio::spawn(tasks::send_pongs(connection.clone(), interval).in_current_span());
        }
    }
    if let Some(deadline) = connection.session().await.deadline() {
        tokio::spawn(tasks::wait_until_expiry(connection.clone(), deadline).in_current_span());
    }

    // Both socket tasks are essential for the connection to work. When
    // either completes the session is over.
    let writer_done = tokio::select! {
        _ = &mut incoming_task => false,
        _ = &mut outgoing_task => true,
    };
    let outgoing_task = (!writer_done).then_some(outgoing_task);
    finish_session(connection, connections, incoming_task, outgoing_task).await;
}

/// Tears a session down: stop producers, drain them, flush the writer, then
/// notify. No frame follows the close hook.
async fn finish_session<M: WebSocketMetrics>(
    connection: types::Connection<M>,
    connections: types::Connections<M>,
    incoming_task: JoinHandle<()>,
    outgoing_task: Option<JoinHandle<()>>,
) {
    // Producers observing this cancellation end silently.
    connection.cancellation.cancel();
    connection.operations.cancel_all().await;
    connection.producers.close();
    connection.producers.wait().await;

    // Put a close frame on the wire unless one already went out; the send is
    // a no-op once the writer lane has exited.
    connection.send(types::Message::terminated());
    if let Some(outgoing_task) = outgoing_task {
        let _ = outgoing_task.await;
    }
    incoming_task.abort();

    connections.drop(&connection.id).await;
    connection.context.metrics.record_connection_drop();

    let session = connection.session().await;
    let close_code = connection.close_code();
    tracing::debug!(close_code, "websocket session finished");
    connection.context.hooks.on_close(&session, close_code);
}

/// Sleeps for the given duration, or forever when none is configured.
async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
