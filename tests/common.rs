use axum::http::HeaderMap;
use axum::{extract::State, response::IntoResponse, routing::get};
use futures_util::future::BoxFuture;
use futures_util::{stream, SinkExt, StreamExt};
use nonempty::{nonempty, NonEmpty};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest},
    MaybeTlsStream, WebSocketStream,
};

use graphql_ws_transport::graphql;
use graphql_ws_transport::{
    Connections, Context, Execution, Executor, Hooks, InitError, InitPayload,
    NoOpWebSocketMetrics, OperationKind, SessionContext, SocketError, WebSocketOptions,
    WebSocketServer, SEC_WEBSOCKET_PROTOCOL,
};

/// A typed value attached to the session context by test init hooks.
#[derive(Clone, Debug, PartialEq)]
#[allow(dead_code)]
pub(crate) struct TestTag(pub String);

#[allow(dead_code)]
pub(crate) type InitFn = Arc<
    dyn Fn(
            SessionContext,
            Option<InitPayload>,
        ) -> Result<(SessionContext, Option<InitPayload>), InitError>
        + Send
        + Sync,
>;

/// Hooks implementation that forwards every callback into channels the test
/// can assert on.
pub(crate) struct TestHooks {
    init: Option<InitFn>,
    close_sender: mpsc::UnboundedSender<u16>,
    error_sender: mpsc::UnboundedSender<String>,
}

impl Hooks for TestHooks {
    fn on_init(
        &self,
        ctx: SessionContext,
        payload: Option<InitPayload>,
    ) -> BoxFuture<'static, Result<(SessionContext, Option<InitPayload>), InitError>> {
        let result = match &self.init {
            Some(init) => init(ctx, payload),
            None => Ok((ctx, None)),
        };
        Box::pin(async move { result })
    }

    fn on_error(&self, _ctx: &SessionContext, error: &SocketError) {
        let _ = self.error_sender.send(error.to_string());
    }

    fn on_close(&self, _ctx: &SessionContext, close_code: u16) {
        let _ = self.close_sender.send(close_code);
    }
}

/// Executor used by the test server.
///
/// `subscription` queries yield every payload later published through
/// [`publish_next`]; a query containing `!` fails to parse; anything else is
/// a one-shot query answering `{"name": "test"}`.
pub(crate) struct TestExecutor {
    publisher: broadcast::Sender<graphql::Response>,
    session_sender: mpsc::UnboundedSender<Arc<SessionContext>>,
}

impl Executor for TestExecutor {
    fn execute(
        &self,
        session: Arc<SessionContext>,
        request: graphql::RawRequest,
    ) -> BoxFuture<'static, Result<Execution, NonEmpty<graphql::GraphQLError>>> {
        let _ = self.session_sender.send(session);
        let publisher = self.publisher.clone();
        Box::pin(async move {
            let query = request.query.trim();
            if query.contains('!') {
                return Err(nonempty![graphql::GraphQLError {
                    message: "Unexpected !".to_string(),
                    locations: Some(vec![graphql::Location { line: 1, column: 1 }]),
                    path: None,
                    extensions: None,
                }]);
            }
            if query.starts_with("subscription") {
                let receiver = publisher.subscribe();
                let responses = stream::unfold(receiver, |mut receiver| async move {
                    receiver.recv().await.ok().map(|response| (response, receiver))
                });
                Ok(Execution::new(
                    OperationKind::Subscription,
                    Box::pin(responses),
                ))
            } else {
                let response = graphql::Response::ok(serde_json::json!({"name": "test"}));
                Ok(Execution::new(
                    OperationKind::Query,
                    Box::pin(stream::iter([response])),
                ))
            }
        })
    }
}

#[allow(dead_code)]
pub(crate) struct ServerState {
    pub(crate) ws_server: WebSocketServer<NoOpWebSocketMetrics>,
    pub(crate) context: Context<NoOpWebSocketMetrics>,
}

#[allow(dead_code)]
pub(crate) struct TestServer {
    pub(crate) connections: Connections<NoOpWebSocketMetrics>,
    pub(crate) socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub(crate) server_handle: JoinHandle<()>,
    pub(crate) state: Arc<ServerState>,
    /// Feeds payloads to every live subscription.
    pub(crate) publisher: broadcast::Sender<graphql::Response>,
    /// Close codes observed by the close hook.
    pub(crate) close_codes: mpsc::UnboundedReceiver<u16>,
    /// Error strings observed by the error hook.
    pub(crate) errors: mpsc::UnboundedReceiver<String>,
    /// Session contexts the executor was invoked with.
    pub(crate) sessions: mpsc::UnboundedReceiver<Arc<SessionContext>>,
}

/// Publishes the next payload to live subscriptions, waiting for at least
/// one subscriber to exist first.
#[allow(dead_code)]
pub(crate) async fn publish_next(
    publisher: &broadcast::Sender<graphql::Response>,
    response: graphql::Response,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while publisher.receiver_count() == 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no subscriber showed up to publish to"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let _ = publisher.send(response);
}

/// Per-test server configuration.
#[derive(Default)]
#[allow(dead_code)]
pub(crate) struct TestConfig {
    pub(crate) options: WebSocketOptions,
    pub(crate) subprotocol: Option<&'static str>,
    pub(crate) init: Option<InitFn>,
    pub(crate) headers: HeaderMap,
}

#[allow(dead_code)]
pub(crate) async fn start_websocket_server() -> TestServer {
    start_websocket_server_with(TestConfig::default()).await
}

#[allow(dead_code)]
pub(crate) async fn start_websocket_server_with(config: TestConfig) -> TestServer {
    // Create a TCP listener
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (publisher, _) = broadcast::channel(16);
    let (close_sender, close_codes) = mpsc::unbounded_channel();
    let (error_sender, errors) = mpsc::unbounded_channel();
    let (session_sender, sessions) = mpsc::unbounded_channel();

    let context = Context {
        executor: Arc::new(TestExecutor {
            publisher: publisher.clone(),
            session_sender,
        }),
        hooks: Arc::new(TestHooks {
            init: config.init,
            close_sender,
            error_sender,
        }),
        options: config.options,
        metrics: NoOpWebSocketMetrics,
        handshake_headers: Arc::new(HeaderMap::new()), // Will be populated in "ws_handler"
    };

    let connections = Connections::new();
    let ws_server = WebSocketServer {
        connections: connections.clone(),
    };
    // Spawn a server
    let state = Arc::new(ServerState { ws_server, context });
    let router_state = state.clone();
    let server_handle = tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/ws", get(ws_handler))
            .with_state(router_state);
        axum::serve(listener, app).await.unwrap();
    });

    let url = format!("ws://{addr}/ws");
    let mut request = url.into_client_request().unwrap();
    if let Some(subprotocol) = config.subprotocol {
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, subprotocol.parse().unwrap());
    }
    request.headers_mut().extend(config.headers);
    let (socket, _response) = connect_async(request)
        .await
        .expect("Failed to connect to WebSocket server");

    TestServer {
        connections,
        socket,
        server_handle,
        state,
        publisher,
        close_codes,
        errors,
        sessions,
    }
}

async fn ws_handler(
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
    ws: axum::extract::ws::WebSocketUpgrade,
) -> impl IntoResponse {
    let mut context = state.context.clone();
    context.handshake_headers = Arc::new(headers);
    state
        .ws_server
        .upgrade_and_handle_websocket(ws, context)
        .into_response()
}

#[allow(dead_code)]
pub(crate) async fn assert_zero_connections_timeout(
    connections: Connections<NoOpWebSocketMetrics>,
) {
    // Closure of a websocket connection is not immediate. So, we keep
    // checking zero connections for at most 5 seconds.
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let conns = connections.0.read().await.len();
            if conns == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Connections are not empty");
}

#[allow(dead_code)]
pub(crate) async fn assert_zero_operations_timeout(
    connections: &Connections<NoOpWebSocketMetrics>,
) {
    // One connection should be present in an active test
    let connection = {
        let connections = connections.0.read().await;
        let (_, connection) = connections.iter().next().unwrap();
        connection.clone()
    };
    // Removal of an operation is not immediate. So, we keep checking zero
    // operations for at most 5 seconds.
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if connection.active_operations().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Operations are not empty");
}

#[allow(dead_code)]
pub(crate) async fn expect_close_message(
    socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> tungstenite::Message {
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a close message")
        .unwrap();
    let message = message.unwrap();
    // Check close message
    assert!(message.is_close(), "Expected close message");
    message
}

#[allow(dead_code)]
pub(crate) async fn expect_text_message(
    socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> String {
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for a text message")
        .unwrap();
    let message = message.unwrap();
    // Check text message
    let tungstenite::Message::Text(text_message) = message else {
        panic!("Expected text message, got {message:?}");
    };
    text_message
}

/// Reads one frame and parses it as JSON.
#[allow(dead_code)]
pub(crate) async fn expect_json_message(
    socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
) -> serde_json::Value {
    let message = expect_text_message(socket).await;
    serde_json::from_str(message.as_str()).expect("Expected a valid JSON")
}

/// Asserts that no frame arrives within the given window.
#[allow(dead_code)]
pub(crate) async fn expect_no_message(
    socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    window: Duration,
) {
    let result = tokio::time::timeout(window, socket.next()).await;
    if let Ok(Some(message)) = result {
        panic!("expected silence, got {message:?}");
    }
}

/// Sends `connection_init` and waits for the ack frame.
#[allow(dead_code)]
pub(crate) async fn graphql_ws_connection_init(
    socket: &mut WebSocketStream<MaybeTlsStream<TcpStream>>,
    init_message: serde_json::Value,
) {
    let json_message = serde_json::to_string(&init_message).unwrap();
    socket
        .send(tungstenite::Message::Text(json_message))
        .await
        .unwrap();
    // Wait for a text message
    let message_json = expect_json_message(socket).await;
    // Check for connection_ack message
    assert_eq!(message_json, serde_json::json!({"type": "connection_ack"}));
}

#[allow(dead_code)]
pub(crate) fn connection_init() -> serde_json::Value {
    serde_json::json!({"type": "connection_init"})
}

#[allow(dead_code)]
pub(crate) fn subscribe_name(kind: &str, operation_id: &str) -> serde_json::Value {
    serde_json::json!({
        "type": kind,
        "id": operation_id,
        "payload": {
            "query": "subscription { name }"
        }
    })
}

#[allow(dead_code)]
pub(crate) fn name_payload() -> graphql::Response {
    graphql::Response::ok(serde_json::json!({"name": "test"}))
}
