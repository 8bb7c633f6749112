//! The legacy `graphql-ws` dialect, as spoken by subscriptions-transport-ws
//! clients. Selected when no subprotocol (or an unknown one) is negotiated.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::{Dialect, DecodeError, EncodeError, GRAPHQL_WS_PROTOCOL};
use crate::protocol::types::{ClientMessage, OperationId, ServerMessage};

const CONNECTION_INIT: &str = "connection_init"; // Client -> Server
const CONNECTION_TERMINATE: &str = "connection_terminate"; // Client -> Server
const START: &str = "start"; // Client -> Server
const STOP: &str = "stop"; // Client -> Server
const CONNECTION_ACK: &str = "connection_ack"; // Server -> Client
const CONNECTION_ERROR: &str = "connection_error"; // Server -> Client
const DATA: &str = "data"; // Server -> Client
const ERROR: &str = "error"; // Server -> Client
const COMPLETE: &str = "complete"; // Server -> Client
const KEEP_ALIVE: &str = "ka"; // Server -> Client

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
}

pub(super) struct GraphqlWs;

impl Dialect for GraphqlWs {
    fn subprotocol(&self) -> &'static str {
        GRAPHQL_WS_PROTOCOL
    }

    fn keep_alive(&self) -> bool {
        true
    }

    fn ping_pong(&self) -> bool {
        false
    }

    fn decode(&self, text: &str) -> Result<ClientMessage, DecodeError> {
        let frame: Frame = serde_json::from_str(text).map_err(|err| {
            tracing::debug!("undecodable graphql-ws frame: {err}");
            DecodeError::InvalidJson
        })?;
        match frame.kind.as_str() {
            CONNECTION_INIT => Ok(ClientMessage::ConnectionInit {
                payload: decode_init_payload(frame.payload)?,
            }),
            START => Ok(ClientMessage::Start {
                id: OperationId(frame.id.unwrap_or_default()),
                payload: frame.payload,
            }),
            STOP => Ok(ClientMessage::Stop {
                id: OperationId(frame.id.unwrap_or_default()),
            }),
            CONNECTION_TERMINATE => Ok(ClientMessage::ConnectionTerminate),
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
            ServerMessage::Data { id, payload } => Frame::with_id(DATA, id).payload(payload)?,
            ServerMessage::Error { id, payload } => Frame::with_id(ERROR, id).payload(payload)?,
            ServerMessage::Complete { id } => Frame::with_id(COMPLETE, id),
            ServerMessage::KeepAlive => Frame::new(KEEP_ALIVE),
            ServerMessage::Ping { .. } => {
                return Err(EncodeError::UnsupportedFrame {
                    frame: "ping",
                    dialect: GRAPHQL_WS_PROTOCOL,
                })
            }
            ServerMessage::Pong { .. } => {
                return Err(EncodeError::UnsupportedFrame {
                    frame: "pong",
                    dialect: GRAPHQL_WS_PROTOCOL,
                })
            }
        };
        Ok(serde_json::to_string(&frame)?)
    }

    fn client_message_name(&self, message: &ClientMessage) -> &'static str {
        match message {
            ClientMessage::ConnectionInit { .. } => CONNECTION_INIT,
            ClientMessage::Start { .. } => START,
            ClientMessage::Stop { .. } => STOP,
            ClientMessage::ConnectionTerminate => CONNECTION_TERMINATE,
            // Unreachable from decode; named for completeness.
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Pong => "pong",
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
