//! The user-facing hook surface of the transport: the init gate, the error
//! observer, and the close notification, plus the session context they
//! decorate.

use axum::http::{Extensions, HeaderMap};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::types::InitPayload;

/// Error returned by the init hook to reject a connection. Its display value
/// is sent to the client as a `connection_error` payload.
pub type InitError = Box<dyn std::error::Error + Send + Sync>;

/// A socket-level failure surfaced to [`Hooks::on_error`].
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    /// Reading or decoding an inbound frame failed.
    #[error("websocket read: {0}")]
    Read(String),
    /// Writing an outbound frame failed.
    #[error("websocket write: {0}")]
    Write(String),
}

impl SocketError {
    pub fn is_read_error(&self) -> bool {
        matches!(self, Self::Read(_))
    }
}

/// Per-connection session state, created at upgrade time and optionally
/// replaced by the init hook before the connection is acknowledged.
///
/// Carries the HTTP headers of the upgrade request, typed values attached by
/// the init hook for downstream consumers, and the optional deadline and
/// close reason governing the session's end.
#[derive(Clone, Debug, Default)]
pub struct SessionContext {
    headers: Arc<HeaderMap>,
    values: Extensions,
    deadline: Option<Duration>,
    close_reason: Option<String>,
}

impl SessionContext {
    pub(crate) fn new(headers: Arc<HeaderMap>) -> Self {
        Self {
            headers,
            values: Extensions::new(),
            deadline: None,
            close_reason: None,
        }
    }

    /// The HTTP request headers observed at upgrade time.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Attaches a typed value for downstream consumers (the executor sees the
    /// session context of the connection an operation arrived on).
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) {
        self.values.insert(value);
    }

    /// Reads back a value attached with [`SessionContext::insert`].
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<&T> {
        self.values.get::<T>()
    }

    /// Bounds the lifetime of the session. Once the duration elapses the
    /// connection shuts down, emitting the close reason first if one is set.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub(crate) fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }
}

/// Attaches a user-facing close reason to the session context. When the
/// session later ends through its deadline or cancellation, the transport
/// emits a final `connection_error` frame carrying the reason as its message.
pub fn append_close_reason(mut ctx: SessionContext, reason: impl Into<String>) -> SessionContext {
    ctx.close_reason = Some(reason.into());
    ctx
}

/// Lifecycle hooks of a WebSocket connection.
///
/// All hooks have no-op defaults; `on_init` accepts every connection
/// unchanged.
pub trait Hooks: Send + Sync + 'static {
    /// Authoritative gate for accepting a connection, invoked with the
    /// client's `connection_init` payload before any ack is sent.
    ///
    /// On success, returns the (possibly decorated) session context used for
    /// every subsequent operation, and an optional payload to attach to the
    /// `connection_ack` frame. On error, the connection is rejected: the
    /// client receives a `connection_error` carrying the error's display
    /// value, [`Hooks::on_error`] is *not* invoked, and [`Hooks::on_close`]
    /// is.
    fn on_init(
        &self,
        ctx: SessionContext,
        _payload: Option<InitPayload>,
    ) -> BoxFuture<'static, Result<(SessionContext, Option<InitPayload>), InitError>> {
        Box::pin(async move { Ok((ctx, None)) })
    }

    /// Invoked on read and decode errors after a successful init. Never
    /// invoked for init-path errors or for cancellation-induced shutdowns.
    fn on_error(&self, _ctx: &SessionContext, _error: &SocketError) {}

    /// Invoked exactly once per connection, after the last outbound frame and
    /// the close frame, with the close code the connection ended with.
    fn on_close(&self, _ctx: &SessionContext, _close_code: u16) {}
}

/// A no-operation implementation of [`Hooks`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpHooks;

impl Hooks for NoOpHooks {}
