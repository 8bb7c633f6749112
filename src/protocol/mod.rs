pub mod init;
pub mod subscribe;
pub mod types;

use std::sync::atomic::Ordering;

use crate::dialect::DecodeError;
use crate::hooks::SocketError;
use crate::metrics::WebSocketMetrics;
use crate::websocket::types as ws;
use types::{ClientMessage, ErrorPayload, ServerMessage};

/// Whether the reader loop should continue after handling a frame.
#[derive(PartialEq)]
pub(crate) enum BreakLoop {
    /// Indicates the loop should break.
    Break,
    /// Indicates the loop should continue.
    Dont,
}

/// Decodes one inbound text frame through the negotiated dialect and
/// dispatches it onto the connection.
pub(crate) async fn handle_client_message<M: WebSocketMetrics>(
    connection: &ws::Connection<M>,
    text: &str,
) -> BreakLoop {
    let message = match connection.dialect.decode(text) {
        Ok(message) => message,
        Err(err) => return handle_decode_error(connection, err).await,
    };
    let message_type = connection.dialect.client_message_name(&message);
    tracing::debug!(message_type, "handling client message");

    if !connection.is_initialized().await {
        return handle_before_init(connection, message).await;
    }

    match message {
        ClientMessage::ConnectionInit { payload } => {
            init::handle_connection_init(connection, payload).await;
            BreakLoop::Dont
        }
        ClientMessage::Start { id, payload } => {
            subscribe::handle_start(connection, id, payload).await;
            BreakLoop::Dont
        }
        ClientMessage::Stop { id } => {
            // The producer answers the cancellation with a complete frame;
            // nothing is sent in direct response to the stop. An unknown ID
            // is ignored.
            if let Some(operation) = connection.operations.remove(&id).await {
                operation.stop();
            }
            BreakLoop::Dont
        }
        ClientMessage::ConnectionTerminate => {
            connection.send(ws::Message::terminated());
            BreakLoop::Break
        }
        ClientMessage::Ping { payload } => {
            connection.send(ws::Message::Protocol(Box::new(ServerMessage::Pong {
                payload,
            })));
            BreakLoop::Dont
        }
        ClientMessage::Pong => {
            connection.pending_pong.store(false, Ordering::Relaxed);
            BreakLoop::Dont
        }
    }
}

/// Before the handshake completes only `connection_init` (and, on the legacy
/// dialect, `connection_terminate`) are legal; anything else is a protocol
/// violation that closes the connection.
async fn handle_before_init<M: WebSocketMetrics>(
    connection: &ws::Connection<M>,
    message: ClientMessage,
) -> BreakLoop {
    match message {
        ClientMessage::ConnectionInit { payload } => {
            init::handle_connection_init(connection, payload).await;
            BreakLoop::Dont
        }
        ClientMessage::ConnectionTerminate => {
            connection.send(ws::Message::terminated());
            BreakLoop::Break
        }
        other => {
            let name = connection.dialect.client_message_name(&other);
            send_connection_error(connection, format!("unexpected message {name}"));
            connection.send(ws::Message::protocol_error());
            BreakLoop::Break
        }
    }
}

/// Applies the error taxonomy for undecodable frames. Init-path errors never
/// reach the error hook.
pub(crate) async fn handle_decode_error<M: WebSocketMetrics>(
    connection: &ws::Connection<M>,
    err: DecodeError,
) -> BreakLoop {
    let initialized = connection.is_initialized().await;
    match err {
        DecodeError::InvalidJson => {
            send_connection_error(connection, "invalid json");
            if initialized {
                let error = SocketError::Read("invalid message received".to_string());
                let session = connection.session().await;
                connection.context.hooks.on_error(&session, &error);
            }
            connection.send(ws::Message::protocol_error());
            BreakLoop::Break
        }
        DecodeError::UnexpectedMessage(kind) => {
            send_connection_error(connection, format!("unexpected message {kind}"));
            if initialized {
                // A well-formed frame of a foreign kind is reported but does
                // not take the connection down.
                BreakLoop::Dont
            } else {
                connection.send(ws::Message::protocol_error());
                BreakLoop::Break
            }
        }
    }
}

fn send_connection_error<M>(connection: &ws::Connection<M>, message: impl Into<String>) {
    connection.send(ws::Message::Protocol(Box::new(
        ServerMessage::ConnectionError {
            payload: ErrorPayload::new(message),
        },
    )));
}
