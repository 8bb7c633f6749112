//! The modern `graphql-transport-ws` dialect.
//! ref: <https://github.com/enisdenjo/graphql-ws/blob/master/PROTOCOL.md>

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::{Dialect, DecodeError, EncodeError, GRAPHQL_TRANSPORT_WS_PROTOCOL};
use crate::protocol::types::{ClientMessage, OperationId, ServerMessage};

const CONNECTION_INIT: &str = "connection_init"; // Client -> Server
const SUBSCRIBE: &str = "subscribe"; // Client -> Server
const CONNECTION_ACK: &str = "connection_ack"; // Server -> Client
const CONNECTION_ERROR: &str = "connection_error"; // Server -> Client
const NEXT: &str = "next"; // Server -> Client
const ERROR: &str = "error"; // Server -> Client
const COMPLETE: &str = "complete"; // Bidirectional
const PING: &str = "ping"; // Bidirectional
const PONG: &str = "pong"; // Bidirectional

/// The physical JSON envelope shared by every frame of this dialect.
#[derive(Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Box<RawValue>>,
}

impl Frame {
    fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            id: None,
            payload: None,
        }
    }

    fn with_id(kind: &str, id: &OperationId) -> Self {
        Self {
            kind: kind.to_string(),
            id: Some(id.0.clone()),
            payload: None,
        }
    }

    fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, EncodeError> {
        self.payload = Some(serde_json::value::to_raw_value(payload)?);
        Ok(self)
    }

    fn raw_payload(mut self, payload: Option<Box<RawValue>>) -> Self {
        self.payload = payload;
        self
    }
}

pub(super) struct GraphqlTransportWs;

impl Dialect for GraphqlTransportWs {
    fn subprotocol(&self) -> &'static str {
        GRAPHQL_TRANSPORT_WS_PROTOCOL
    }

    fn keep_alive(&self) -> bool {
        false
    }

    fn ping_pong(&self) -> bool {
        true
    }

    fn decode(&self, text: &str) -> Result<ClientMessage, DecodeError> {
        let frame: Frame = serde_json::from_str(text).map_err(|err| {
            tracing::debug!("undecodable graphql-transport-ws frame: {err}");
            DecodeError::InvalidJson
        })?;
        match frame.kind.as_str() {
            CONNECTION_INIT => Ok(ClientMessage::ConnectionInit {
                payload: decode_init_payload(frame.payload)?,
            }),
            SUBSCRIBE => Ok(ClientMessage::Start {
                id: OperationId(frame.id.unwrap_or_default()),
                payload: frame.payload,
            }),
            // Client-originated complete cancels the operation.
            COMPLETE => Ok(ClientMessage::Stop {
                id: OperationId(frame.id.unwrap_or_default()),
            }),
            PING => Ok(ClientMessage::Ping {
                payload: frame.payload,
            }),
            PONG => Ok(ClientMessage::Pong),
            other => Err(DecodeError::UnexpectedMessage(other.to_string())),
        }
    }

    fn encode(&self, message: &ServerMessage) -> Result<String, EncodeError> {
        let frame = match message {
            ServerMessage::ConnectionAck { payload } => match payload {
                Some(payload) => Frame::new(CONNECTION_ACK).payload(payload)?,
                None => Frame::new(CONNECTION_ACK),
            },
            ServerMessage::ConnectionError { payload } => {
                Frame::new(CONNECTION_ERROR).payload(payload)?
            }
            ServerMessage::Data { id, payload } => Frame::with_id(NEXT, id).payload(payload)?,
            ServerMessage::Error { id, payload } => Frame::with_id(ERROR, id).payload(payload)?,
            ServerMessage::Complete { id } => Frame::with_id(COMPLETE, id),
            ServerMessage::Ping { payload } => Frame::new(PING).raw_payload(payload.clone()),
            ServerMessage::Pong { payload } => Frame::new(PONG).raw_payload(payload.clone()),
            ServerMessage::KeepAlive => {
                return Err(EncodeError::UnsupportedFrame {
                    frame: "ka",
                    dialect: GRAPHQL_TRANSPORT_WS_PROTOCOL,
                })
            }
        };
        Ok(serde_json::to_string(&frame)?)
    }

    fn client_message_name(&self, message: &ClientMessage) -> &'static str {
        match message {
            ClientMessage::ConnectionInit { .. } => CONNECTION_INIT,
            ClientMessage::Start { .. } => SUBSCRIBE,
            ClientMessage::Stop { .. } => COMPLETE,
            ClientMessage::Ping { .. } => PING,
            ClientMessage::Pong => PONG,
            // Unreachable from decode; named for completeness.
            ClientMessage::ConnectionTerminate => "connection_terminate",
        }
    }
}

fn decode_init_payload(
    payload: Option<Box<RawValue>>,
) -> Result<Option<crate::protocol::types::InitPayload>, DecodeError> {
    payload
        .map(|raw| serde_json::from_str(raw.get()).map_err(|_| DecodeError::InvalidJson))
        .transpose()
}
