//! The execution seam: the transport hands parsed requests to an [`Executor`]
//! and drains the lazy response sequence it yields.

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use nonempty::NonEmpty;
use std::sync::Arc;

use crate::graphql;
use crate::hooks::SessionContext;

/// What the executor determined the operation to be, from the parsed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// The lazy sequence of response payloads produced by one operation. Finite
/// for queries and mutations, potentially long-running for subscriptions.
pub type ResponseStream = BoxStream<'static, graphql::Response>;

/// A started operation: its kind and its response sequence.
pub struct Execution {
    pub kind: OperationKind,
    pub responses: ResponseStream,
}

impl Execution {
    pub fn new(kind: OperationKind, responses: ResponseStream) -> Self {
        Self { kind, responses }
    }
}

/// Executes GraphQL requests on behalf of the transport.
///
/// Parsing, validation, and execution all live behind this trait. A request
/// that fails before producing a stream (parse or validation failure) is
/// reported as a non-empty GraphQL error list, which the transport relays to
/// the client as a frame-level `error`; the connection itself continues.
pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        session: Arc<SessionContext>,
        request: graphql::RawRequest,
    ) -> BoxFuture<'static, Result<Execution, NonEmpty<graphql::GraphQLError>>>;
}
