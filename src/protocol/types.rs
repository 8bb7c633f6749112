use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::sync::Arc;

use crate::graphql;
use crate::hooks::SessionContext;

/// A unique identifier for a GraphQL operation.
/// Chosen by the client with the `start`/`subscribe` message and used by the
/// server to identify the operation; opaque to the transport.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Hash)]
pub struct OperationId(pub String);

/// The payload of the `connection_init` message: an opaque JSON object the
/// client uses for authentication or connection decoration. Also the shape of
/// the optional `connection_ack` payload.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct InitPayload(serde_json::Map<String, serde_json::Value>);

impl InitPayload {
    pub fn new(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Returns the value for `key` when it is a JSON string.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(serde_json::Value::as_str)
    }

    /// Shorthand for the conventional `Authorization` entry.
    pub fn authorization(&self) -> Option<&str> {
        self.get_string("Authorization")
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for InitPayload {
    fn from(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(fields)
    }
}

/// Messages that the client can send to the server, decoded from either wire
/// dialect into a single internal shape.
#[derive(Debug)]
pub enum ClientMessage {
    /// First message sent by the client over an established WebSocket.
    ConnectionInit { payload: Option<InitPayload> },

    /// Start a GraphQL operation (`start` on graphql-ws, `subscribe` on
    /// graphql-transport-ws). The payload is kept raw; the request is parsed
    /// when the operation is started. A frame without an id starts an
    /// operation under the empty id.
    Start {
        id: OperationId,
        payload: Option<Box<RawValue>>,
    },

    /// Cancel a running operation (`stop` on graphql-ws, client-originated
    /// `complete` on graphql-transport-ws).
    Stop { id: OperationId },

    /// Orderly connection shutdown. graphql-ws only.
    ConnectionTerminate,

    /// Liveness probe, to be answered with a pong. graphql-transport-ws only.
    Ping { payload: Option<Box<RawValue>> },

    /// A response to a `ping` message. graphql-transport-ws only.
    Pong,
}

/// Messages that the server can send to the client. Encoding to wire frames
/// is dialect-specific.
#[derive(Debug)]
pub enum ServerMessage {
    /// Acknowledges the `connection_init` message. The payload, when present,
    /// comes from the init hook.
    ConnectionAck { payload: Option<InitPayload> },

    /// A connection-scoped error, sent before closing the socket.
    ConnectionError { payload: ErrorPayload },

    /// An execution result for a running operation (`data` on graphql-ws,
    /// `next` on graphql-transport-ws).
    Data {
        id: OperationId,
        payload: graphql::Response,
    },

    /// Operation-terminating errors resulting from a requested operation.
    Error {
        id: OperationId,
        payload: NonEmpty<graphql::GraphQLError>,
    },

    /// The operation identified by `id` has finished.
    Complete { id: OperationId },

    /// Idle heartbeat (`ka`). graphql-ws only.
    KeepAlive,

    /// Liveness probe. graphql-transport-ws only.
    Ping { payload: Option<Box<RawValue>> },

    /// Answer to a client ping, or an unsolicited server heartbeat.
    /// graphql-transport-ws only.
    Pong { payload: Option<Box<RawValue>> },
}

impl ServerMessage {
    /// Returns the operation id if the message terminates an operation's
    /// frame sequence.
    pub fn is_complete_or_error(&self) -> Option<&OperationId> {
        match self {
            Self::Error { id, .. } | Self::Complete { id } => Some(id),
            _ => None,
        }
    }
}

/// The `{"message": ...}` payload of a `connection_error` frame.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The state of the protocol handshake for one connection.
/// Updated when the server accepts the `connection_init` message.
#[derive(Debug)]
pub enum ConnectionInitState {
    /// The connection has not been initialized. Default state.
    NotInitialized,
    /// The connection has been initialized. Holds the session context used
    /// for subsequent operations, as returned by the init hook.
    Initialized { session: Arc<SessionContext> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_payload_accessors() {
        let payload: InitPayload = serde_json::from_str(
            r#"{"Authorization": "Bearer token", "region": "eu", "count": 3}"#,
        )
        .unwrap();
        assert_eq!(payload.authorization(), Some("Bearer token"));
        assert_eq!(payload.get_string("region"), Some("eu"));
        assert_eq!(payload.get_string("count"), None);
        assert_eq!(payload.get("count"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn test_error_payload_shape() {
        let payload = ErrorPayload::new("invalid json");
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({"message": "invalid json"})
        );
    }
}
