//! Wire dialects for GraphQL over WebSocket.
//!
//! Two incompatible subprotocols are supported; the negotiated
//! `Sec-WebSocket-Protocol` value selects one per connection. Frame names and
//! decode tables are private to each dialect module; the connection talks to
//! a dialect only through the [`Dialect`] trait.

mod graphql_transport_ws;
mod graphql_ws;

use crate::protocol::types::{ClientMessage, ServerMessage};

/// Subprotocol name of the legacy dialect.
pub static GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";

/// Subprotocol name of the modern dialect.
/// ref: <https://github.com/enisdenjo/graphql-ws/blob/master/PROTOCOL.md#communication>
pub static GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

/// Decoding failures, phrased the way they are reported to the client in a
/// `connection_error` payload.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum DecodeError {
    /// The frame is not a JSON object of the expected shape.
    #[error("invalid json")]
    InvalidJson,
    /// The frame kind is not part of this dialect, or is client-illegal.
    #[error("unexpected message {0}")]
    UnexpectedMessage(String),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EncodeError {
    #[error("unable to serialize message into JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The message has no frame in this dialect. Timer-loop construction is
    /// gated on the dialect capabilities, so hitting this is a logic error.
    #[error("{frame} frame is not part of the {dialect} dialect")]
    UnsupportedFrame {
        frame: &'static str,
        dialect: &'static str,
    },
}

/// The capability surface a connection needs from a negotiated subprotocol.
pub(crate) trait Dialect: Send + Sync {
    /// The `Sec-WebSocket-Protocol` value this dialect answers to.
    fn subprotocol(&self) -> &'static str;

    /// Whether the dialect carries the server→client `ka` idle heartbeat.
    fn keep_alive(&self) -> bool;

    /// Whether the dialect carries bidirectional `ping`/`pong` liveness
    /// frames.
    fn ping_pong(&self) -> bool;

    /// Decodes a text frame into the internal client message shape.
    fn decode(&self, text: &str) -> Result<ClientMessage, DecodeError>;

    /// Encodes an internal server message into a text frame.
    fn encode(&self, message: &ServerMessage) -> Result<String, EncodeError>;

    /// The wire name this dialect uses for a decoded client message.
    fn client_message_name(&self, message: &ClientMessage) -> &'static str;
}

/// Selects the dialect for a negotiated subprotocol. Absence (or an empty
/// value) selects the legacy `graphql-ws` dialect.
pub(crate) fn negotiate(subprotocol: Option<&str>) -> &'static dyn Dialect {
    match subprotocol {
        Some(value) if value == GRAPHQL_TRANSPORT_WS_PROTOCOL => {
            &graphql_transport_ws::GraphqlTransportWs
        }
        _ => &graphql_ws::GraphqlWs,
    }
}
