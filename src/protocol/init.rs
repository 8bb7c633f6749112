use std::sync::Arc;

use super::types::{ConnectionInitState, ErrorPayload, InitPayload, ServerMessage};
use crate::metrics::WebSocketMetrics;
use crate::websocket::types as ws;

/// Handles the connection initialization message from the client.
///
/// The init hook is the authoritative gate: it runs before any ack is sent
/// and may replace the session context or reject the connection outright.
pub async fn handle_connection_init<M: WebSocketMetrics>(
    connection: &ws::Connection<M>,
    payload: Option<InitPayload>,
) {
    let mut state = connection.protocol_state.write().await;
    match *state {
        ConnectionInitState::Initialized { .. } => {
            // A second connection_init closes the connection.
            connection.send(ws::Message::too_many_init_requests());
        }
        ConnectionInitState::NotInitialized => {
            let handshake_ctx = connection.handshake_session.as_ref().clone();
            match connection
                .context
                .hooks
                .on_init(handshake_ctx, payload)
                .await
            {
                Ok((session, ack_payload)) => {
                    *state = ConnectionInitState::Initialized {
                        session: Arc::new(session),
                    };
                    drop(state);
                    connection.send(ws::Message::Protocol(Box::new(
                        ServerMessage::ConnectionAck {
                            payload: ack_payload,
                        },
                    )));
                    // One heartbeat directly after the ack, independent of the
                    // keep-alive interval; legacy clients use it to confirm
                    // the connection is live.
                    if connection.dialect.keep_alive() {
                        connection.send(ws::Message::Protocol(Box::new(ServerMessage::KeepAlive)));
                    }
                    connection.notify_initialized();
                }
                Err(err) => {
                    drop(state);
                    tracing::debug!("connection rejected by init hook: {err}");
                    // The rejection reaches the client as a connection_error;
                    // the error hook stays silent on this path.
                    connection.send(ws::Message::Protocol(Box::new(
                        ServerMessage::ConnectionError {
                            payload: ErrorPayload::new(err.to_string()),
                        },
                    )));
                    connection.send(ws::Message::forbidden());
                }
            }
        }
    }
}
