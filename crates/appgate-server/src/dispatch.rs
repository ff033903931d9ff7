//! The request dispatch seam: the external `process_request` capability and
//! the per-request context handed to it.
//!
//! The application framework living behind this seam is deliberately unknown
//! to the core. [`RequestDispatcher`] models exactly what the connection
//! worker calls; everything else (routing, middleware, response rendering) is
//! the implementor's business.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use appgate_core::HeaderMap;

use crate::analytics::AnalyticsLog;

/// Byte stream carrying one client connection.
///
/// Both socket families (TCP and local) satisfy this, as do in-memory duplex
/// streams in tests.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Ambient per-request state, visible only to the dispatch call it was
/// created for.
///
/// This replaces thread-local request state: the worker constructs one
/// context after a successful parse and passes it explicitly, so nothing
/// leaks across requests or tasks.
#[derive(Debug)]
pub struct RequestContext {
    /// Client-supplied transaction id, if the request carried one.
    pub transaction_id: Option<String>,
    /// Per-request analytics handle; present when a sink is configured and
    /// the request carries a transaction id.
    pub analytics: Option<AnalyticsLog>,
    /// Server-assigned id for this connection, for log correlation.
    pub connection_id: Uuid,
    /// Body bytes that arrived in the same chunks as the header block.
    /// Handlers reading a request body must consume these before reading
    /// from the connection. Always empty on the native protocol.
    pub body_prefix: Vec<u8>,
}

/// An uncaught failure escaping the dispatched handler.
///
/// Carries what the analytics collector wants: the error's class name, its
/// message, and a stack trace captured at construction.
#[derive(Debug, Error)]
#[error("{class_name}: {message}")]
pub struct DispatchError {
    class_name: String,
    message: String,
    backtrace: String,
}

impl DispatchError {
    /// Captures the current backtrace alongside the class name and message.
    pub fn new(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            message: message.into(),
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn backtrace(&self) -> &str {
        &self.backtrace
    }
}

/// The external request-processing capability.
///
/// One call per parsed request. The handler owns the response: for HTTP
/// connections (`full_response == true`) it must write a complete HTTP
/// response to `connection`; on the native protocol it writes whatever its
/// framework protocol dictates. The worker closes the connection after the
/// call returns.
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    /// Processes one request.
    ///
    /// # Errors
    ///
    /// An `Err` is treated as an uncaught handler failure: the worker reports
    /// it to analytics (when the request carries a transaction id) and then
    /// consults [`Self::should_reraise_error`].
    async fn process_request(
        &self,
        context: RequestContext,
        headers: HeaderMap,
        connection: &mut dyn Connection,
        full_response: bool,
    ) -> Result<(), DispatchError>;

    /// Hook consulted after a failure has been reported. Returning `true`
    /// propagates the error to the worker's own top-level error reporting;
    /// the default swallows it after logging.
    fn should_reraise_error(&self, _error: &DispatchError) -> bool {
        false
    }
}
