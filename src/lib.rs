pub(crate) mod dialect;
pub(crate) mod executor;
pub mod graphql;
pub(crate) mod hooks;
pub(crate) mod metrics;
pub(crate) mod protocol;
pub(crate) mod registry;
pub(crate) mod websocket;

pub use dialect::{GRAPHQL_TRANSPORT_WS_PROTOCOL, GRAPHQL_WS_PROTOCOL};
pub use executor::{Execution, Executor, OperationKind, ResponseStream};
pub use hooks::{
    append_close_reason, Hooks, InitError, NoOpHooks, SessionContext, SocketError,
};
pub use metrics::{NoOpWebSocketMetrics, WebSocketMetrics};
pub use protocol::types::{InitPayload, OperationId};
pub use websocket::{
    WebSocketServer, SEC_WEBSOCKET_PROTOCOL,
    types::{ActiveConnection, Connection, Connections, Context, WebSocketId, WebSocketOptions},
};
