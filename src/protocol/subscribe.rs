use futures_util::StreamExt;
use nonempty::{nonempty, NonEmpty};
use serde_json::value::RawValue;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::types::{OperationId, ServerMessage};
use crate::executor::Execution;
use crate::graphql;
use crate::hooks::SessionContext;
use crate::metrics::WebSocketMetrics;
use crate::registry;
use crate::websocket::types as ws;

/// Handles the start/subscribe message from the client: registers the
/// operation and spawns its producer.
///
/// Reusing an ID that is still live closes the connection; the previously
/// registered operation keeps running until the shutdown reaches it.
pub async fn handle_start<M: WebSocketMetrics>(
    connection: &ws::Connection<M>,
    operation_id: OperationId,
    payload: Option<Box<RawValue>>,
) {
    let request = payload
        .as_deref()
        .and_then(|raw| serde_json::from_str::<graphql::RawRequest>(raw.get()).ok());
    let Some(request) = request else {
        tracing::debug!(operation_id = %operation_id.0, "unparsable request payload");
        send_graphql_errors(
            operation_id,
            nonempty![graphql::GraphQLError::message("invalid json")],
            connection,
        );
        return;
    };

    let cancel = connection.cancellation.child_token();
    let operation = registry::Operation::new(cancel.clone());
    if connection
        .operations
        .add(operation_id.clone(), operation)
        .await
        .is_err()
    {
        connection.send(ws::Message::subscriber_already_exists(&operation_id));
        return;
    }

    connection
        .context
        .metrics
        .record_operation_start(&connection.id);

    let session = connection.session().await;
    let producer = {
        let connection = connection.clone();
        async move { run_producer(connection, operation_id, session, request, cancel).await }
    };
    connection.producers.spawn(producer);
}

/// Drains one operation's response sequence into the writer lane.
///
/// Every frame sequence for an ID ends with exactly one terminator: a
/// `complete` on normal end or client cancellation, an `error` on executor
/// failure. A producer that observes session shutdown ends silently.
async fn run_producer<M: WebSocketMetrics>(
    connection: ws::Connection<M>,
    operation_id: OperationId,
    session: Arc<SessionContext>,
    request: graphql::RawRequest,
    cancel: CancellationToken,
) {
    drive_operation(&connection, operation_id, session, request, cancel).await;
    connection
        .context
        .metrics
        .record_operation_stop(&connection.id);
}

async fn drive_operation<M: WebSocketMetrics>(
    connection: &ws::Connection<M>,
    operation_id: OperationId,
    session: Arc<SessionContext>,
    request: graphql::RawRequest,
    cancel: CancellationToken,
) {
    let execute = connection.context.executor.execute(session, request);
    let execution = tokio::select! {
        () = cancel.cancelled() => {
            complete_unless_closing(connection, operation_id);
            return;
        }
        execution = execute => execution,
    };

    match execution {
        Err(errors) => {
            // Parse and validation failures flow to the client as data; the
            // connection itself is unaffected.
            send_graphql_errors(operation_id, errors, connection);
        }
        Ok(Execution {
            kind,
            mut responses,
        }) => {
            tracing::debug!(operation_id = %operation_id.0, ?kind, "operation started");
            loop {
                let response = tokio::select! {
                    () = cancel.cancelled() => {
                        complete_unless_closing(connection, operation_id);
                        return;
                    }
                    response = responses.next() => response,
                };
                let Some(response) = response else {
                    send_complete(operation_id, connection);
                    break;
                };
                match GraphQLResponse::new(response) {
                    GraphQLResponse::Ok(response) => {
                        send_graphql_ok(operation_id.clone(), response, connection);
                    }
                    GraphQLResponse::Error(errors) => {
                        // No complete message follows an error frame.
                        send_graphql_errors(operation_id, errors, connection);
                        break;
                    }
                }
            }
        }
    }
}

/// Terminates the frame sequence of a client-cancelled operation. Producers
/// cancelled because the whole session is going away emit nothing.
fn complete_unless_closing<M>(connection: &ws::Connection<M>, operation_id: OperationId) {
    if !connection.cancellation.is_cancelled() {
        send_complete(operation_id, connection);
    }
}

/// Sends a GraphQL response with no operation-fatal errors.
fn send_graphql_ok<M>(
    operation_id: OperationId,
    response: graphql::Response,
    connection: &ws::Connection<M>,
) {
    connection.send(ws::Message::Protocol(Box::new(ServerMessage::Data {
        id: operation_id,
        payload: response,
    })));
}

/// Sends GraphQL errors to the client, ending the operation.
fn send_graphql_errors<M>(
    operation_id: OperationId,
    errors: NonEmpty<graphql::GraphQLError>,
    connection: &ws::Connection<M>,
) {
    connection.send(ws::Message::Protocol(Box::new(ServerMessage::Error {
        id: operation_id,
        payload: errors,
    })));
}

/// Sends a complete message after the operation's sequence ends.
fn send_complete<M>(operation_id: OperationId, connection: &ws::Connection<M>) {
    connection.send(ws::Message::Protocol(Box::new(ServerMessage::Complete {
        id: operation_id,
    })));
}

/// A helper enum splitting a response into the frame it becomes.
enum GraphQLResponse {
    Ok(graphql::Response),
    Error(NonEmpty<graphql::GraphQLError>),
}

impl GraphQLResponse {
    fn new(response: graphql::Response) -> Self {
        // If any error exist
        if let Some(errors) = response.errors {
            // If some data present
            if let Some(data) = response.data {
                // It is a partial response
                Self::Ok(graphql::Response::partial(data, errors))
            } else {
                // If no data present, it is an operation-fatal error
                Self::Error(errors)
            }
        } else {
            // No errors, Ok response
            Self::Ok(response)
        }
    }
}
