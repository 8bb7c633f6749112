use axum::extract::ws;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use tokio::time::Duration;

use super::types;
use crate::dialect::{DecodeError, EncodeError};
use crate::hooks::SocketError;
use crate::metrics::WebSocketMetrics;
use crate::protocol;
use crate::protocol::types::ServerMessage;

/// Handles incoming WebSocket messages from the client.
/// Runs until the client goes away, a fatal frame is handled, or the session
/// is cancelled.
pub(crate) async fn process_incoming_messages<M: WebSocketMetrics>(
    connection: types::Connection<M>,
    mut websocket_receiver: futures_util::stream::SplitStream<ws::WebSocket>,
) {
    loop {
        let message = tokio::select! {
            () = connection.cancellation.cancelled() => break,
            message = websocket_receiver.next() => message,
        };
        // The stream ends when the socket is gone.
        let Some(message) = message else { break };

        let break_loop = match message {
            Err(err) => {
                tracing::debug!("unable to receive message from client: {err}");
                if connection.is_initialized().await {
                    let error = SocketError::Read(err.to_string());
                    let session = connection.session().await;
                    connection.context.hooks.on_error(&session, &error);
                }
                protocol::BreakLoop::Break
            }
            Ok(ws::Message::Close(frame)) => {
                // Abnormal closes surface through the close code handed to
                // the close hook; 1005 marks a close frame without a status.
                let code = frame.map_or(1005, |frame| frame.code);
                connection.record_close_code(code);
                tracing::debug!("received close frame from client");
                protocol::BreakLoop::Break
            }
            // Transport-level ping/pong frames are answered by the socket
            // layer itself.
            Ok(ws::Message::Ping(_) | ws::Message::Pong(_)) => protocol::BreakLoop::Dont,
            Ok(ws::Message::Text(text)) => {
                protocol::handle_client_message(&connection, &text).await
            }
            Ok(ws::Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => protocol::handle_client_message(&connection, &text).await,
                Err(_) => {
                    protocol::handle_decode_error(&connection, DecodeError::InvalidJson).await
                }
            },
        };
        if break_loop == protocol::BreakLoop::Break {
            break;
        }
    }
}

/// Manages outgoing WebSocket messages: the single writer lane.
/// Serializes protocol messages through the negotiated dialect and sends them
/// to the client; exits after a close frame or a write failure.
pub(crate) async fn manage_outgoing_messages<M: WebSocketMetrics>(
    connection: types::Connection<M>,
    mut websocket_sender: futures_util::stream::SplitSink<ws::WebSocket, ws::Message>,
    mut channel_receiver: tokio::sync::mpsc::UnboundedReceiver<types::Message>,
) {
    while let Some(message) = channel_receiver.recv().await {
        match message {
            // Raw messages pass through untouched; a close frame ends the lane.
            types::Message::Raw(msg) => {
                if let ws::Message::Close(Some(frame)) = &msg {
                    connection.record_close_code(frame.code);
                }
                let is_close = matches!(msg, ws::Message::Close(_));
                if let Err(err) = websocket_sender.send(msg).await {
                    report_write_error(&connection, &err).await;
                    break;
                }
                if is_close {
                    break;
                }
            }
            // Protocol messages are serialized into dialect frames.
            types::Message::Protocol(msg) => {
                let text = match connection.dialect.encode(&msg) {
                    Ok(text) => text,
                    Err(err @ EncodeError::UnsupportedFrame { .. }) => {
                        // Timer construction is gated on dialect capabilities,
                        // so this indicates a logic error; drop the frame.
                        tracing::warn!("dropping outbound frame: {err}");
                        continue;
                    }
                    Err(err) => {
                        tracing::error!("unable to serialize message into JSON: {err}");
                        connection.record_close_code(1011);
                        let _ = websocket_sender
                            .send(types::internal_server_message_ws())
                            .await;
                        break;
                    }
                };
                if let Err(err) = websocket_sender.send(ws::Message::Text(text)).await {
                    report_write_error(&connection, &err).await;
                    break;
                }
                // A terminator frame retires the operation's registry entry.
                if let Some(operation_id) = msg.is_complete_or_error() {
                    if let Some(operation) = connection.operations.remove(operation_id).await {
                        operation.stop();
                    }
                }
            }
        }
    }
}

async fn report_write_error<M: WebSocketMetrics>(
    connection: &types::Connection<M>,
    err: &axum::Error,
) {
    tracing::debug!("unable to send message to client: {err}");
    if connection.is_initialized().await {
        let error = SocketError::Write(err.to_string());
        let session = connection.session().await;
        connection.context.hooks.on_error(&session, &error);
    }
}

/// Sends `ka` heartbeats at the configured interval. Legacy dialect only;
/// the heartbeat adjacent to the ack is emitted by the init handler.
pub(crate) async fn send_keepalive<M>(connection: types::Connection<M>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip immediate first tick.
    loop {
        tokio::select! {
            () = connection.cancellation.cancelled() => break,
            _ = ticker.tick() => {
                connection.send(types::Message::Protocol(Box::new(ServerMessage::KeepAlive)));
            }
        }
    }
}

/// Sends `ping` probes at the configured interval and watches for answering
/// pongs. A ping left unanswered for a full interval is a liveness violation
/// that closes the connection, unless `missing_pong_ok` is set.
pub(crate) async fn send_pings<M>(
    connection: types::Connection<M>,
    interval: Duration,
    missing_pong_ok: bool,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip immediate first tick.
    loop {
        tokio::select! {
            () = connection.cancellation.cancelled() => break,
            _ = ticker.tick() => {
                let unanswered = connection.pending_pong.swap(true, Ordering::Relaxed);
                if unanswered && !missing_pong_ok {
                    tracing::debug!("client missed a pong; closing connection");
                    connection.send(types::Message::pong_timeout());
                    break;
                }
                connection.send(types::Message::Protocol(Box::new(ServerMessage::Ping {
                    payload: None,
                })));
            }
        }
    }
}

/// Sends unsolicited `pong` heartbeats at the configured interval. These
/// require no reply; they only tell the client the connection is live.
pub(crate) async fn send_pongs<M>(connection: types::Connection<M>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip immediate first tick.
    loop {
        tokio::select! {
            () = connection.cancellation.cancelled() => break,
            _ = ticker.tick() => {
                connection.send(types::Message::Protocol(Box::new(ServerMessage::Pong {
                    payload: None,
                })));
            }
        }
    }
}

/// Waits until the session deadline attached by the init hook elapses, then
/// starts the shutdown. The close reason, when one was appended, goes out as
/// a final `connection_error` before the close frame.
pub(crate) async fn wait_until_expiry<M>(connection: types::Connection<M>, expiry: Duration) {
    tokio::select! {
        () = connection.cancellation.cancelled() => {}
        () = tokio::time::sleep(expiry) => {
            let session = connection.session().await;
            if let Some(reason) = session.close_reason() {
                connection.send(types::Message::Protocol(Box::new(
                    ServerMessage::ConnectionError {
                        payload: crate::protocol::types::ErrorPayload::new(reason),
                    },
                )));
            }
            connection.send(types::Message::session_expired());
        }
    }
}
