//! Connection worker: owns one accepted connection from first byte to close.
//!
//! A worker runs the full lifecycle for its connection (read the
//! protocol-appropriate preamble, authenticate, parse into a header map,
//! answer `PING` directly, otherwise dispatch to the external
//! request-processing capability) and reports request completion to the
//! resource counters on every path. The connection is closed on every exit:
//! success, protocol error, auth rejection, or client disconnect.
//!
//! The session functions are generic over the byte stream so unit tests can
//! drive them with in-memory duplex pipes instead of real sockets.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};
use uuid::Uuid;

use appgate_core::headers::{PASSENGER_TXN_ID, PING_METHOD, REQUEST_METHOD};
use appgate_core::protocol::{decode_pairs, read_scalar, ProtocolError};
use appgate_core::{HeaderMap, HttpHeaderParser, HttpParseError, ParseStatus};

use crate::analytics::AnalyticsSink;
use crate::auth::{AuthOutcome, AuthPolicy};
use crate::console::{run_console_session, ConsoleMode, ExpressionEvaluator};
use crate::dispatch::{Connection, RequestContext, RequestDispatcher};
use crate::lifecycle::ShutdownFlag;
use crate::resource::ResourceCounters;

use super::SocketKind;

/// Everything a worker needs beyond the connection itself. One instance is
/// shared by all workers of a server.
pub struct WorkerContext {
    pub auth: AuthPolicy,
    pub dispatcher: Arc<dyn RequestDispatcher>,
    pub analytics: Option<Arc<dyn AnalyticsSink>>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub counters: Arc<ResourceCounters>,
    pub shutdown: ShutdownFlag,
    pub app_group_name: String,
    pub max_header_size: usize,
    pub memory_limit: u64,
}

/// How a single connection's session ended, when it did not end cleanly.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("http parse error: {0}")]
    Http(#[from] HttpParseError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A handler failure the dispatcher asked to have re-raised.
    #[error("handler error: {0}")]
    Handler(#[from] crate::dispatch::DispatchError),
}

/// Entry point for the per-connection task spawned by the accept loop.
///
/// Runs the protocol-appropriate session, logs the outcome, and shuts the
/// stream down. Nothing propagates out of here: one connection's failure
/// never disturbs the accept loop or other connections.
pub async fn handle_connection<S>(mut stream: S, kind: SocketKind, ctx: Arc<WorkerContext>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let result = match kind {
        SocketKind::Native => run_native_session(&mut stream, &ctx).await,
        SocketKind::Http => run_http_session(&mut stream, &ctx).await,
        SocketKind::ConsoleSync => {
            run_console_session(&mut stream, &ctx.auth, Arc::clone(&ctx.evaluator), ConsoleMode::Inline)
                .await
                .map_err(SessionError::from)
        }
        SocketKind::ConsoleAsync => {
            run_console_session(&mut stream, &ctx.auth, Arc::clone(&ctx.evaluator), ConsoleMode::Spawned)
                .await
                .map_err(SessionError::from)
        }
    };

    match result {
        Ok(()) => debug!("{kind} connection closed normally"),
        Err(e) => {
            let header_too_large = matches!(
                e,
                SessionError::Protocol(ProtocolError::ScalarTooLarge { .. })
                    | SessionError::Http(HttpParseError::HeaderTooLarge { .. })
            );
            if header_too_large {
                // The client sees only the close; the reason lives here.
                error!("rejecting {kind} connection: {e}");
            } else if matches!(e, SessionError::Handler(_)) {
                error!("re-raised request handler error on {kind} connection: {e}");
            } else {
                warn!("{kind} connection closed with error: {e}");
            }
        }
    }

    let _ = stream.shutdown().await;
}

// ── Native protocol ───────────────────────────────────────────────────────────

async fn run_native_session<S>(stream: &mut S, ctx: &WorkerContext) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let Some(payload) = read_scalar(stream, ctx.max_header_size).await? else {
        // Connected and left without sending a request.
        return Ok(());
    };

    let mut headers: HeaderMap = decode_pairs(&payload)?.into_iter().collect();

    if ctx.auth.check_native(&mut headers) == AuthOutcome::Rejected {
        debug!("unauthenticated native connection; closing silently");
        return Ok(());
    }

    dispatch_request(stream, ctx, headers, Vec::new(), false).await
}

// ── HTTP protocol ─────────────────────────────────────────────────────────────

async fn run_http_session<S>(stream: &mut S, ctx: &WorkerContext) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut parser = HttpHeaderParser::new(ctx.max_header_size);
    let mut buf = [0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            debug!("client disconnected before completing request headers");
            return Ok(());
        }
        if parser.feed(&buf[..n])? == ParseStatus::Done {
            break;
        }
    }

    let (mut headers, body_prefix) = parser.into_parts();

    if ctx.auth.check_http(&mut headers) == AuthOutcome::Rejected {
        debug!("unauthenticated http connection; closing silently");
        return Ok(());
    }

    dispatch_request(stream, ctx, headers, body_prefix, true).await
}

// ── Shared dispatch tail ──────────────────────────────────────────────────────

async fn dispatch_request<S>(
    stream: &mut S,
    ctx: &WorkerContext,
    headers: HeaderMap,
    body_prefix: Vec<u8>,
    full_response: bool,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    // PING is a liveness probe: answer it here, never involve the handler.
    if headers.get(REQUEST_METHOD) == Some(PING_METHOD) {
        stream.write_all(b"pong").await?;
        stream.flush().await?;
        finish_request(ctx);
        return Ok(());
    }

    let transaction_id = headers.get(PASSENGER_TXN_ID).map(str::to_string);
    let analytics = match (&ctx.analytics, &transaction_id) {
        (Some(sink), Some(txn)) => Some(sink.open_log(txn, &ctx.app_group_name).await),
        _ => None,
    };
    let context = RequestContext {
        transaction_id: transaction_id.clone(),
        analytics,
        connection_id: Uuid::new_v4(),
        body_prefix,
    };

    let connection: &mut dyn Connection = stream;
    let outcome = ctx
        .dispatcher
        .process_request(context, headers, connection, full_response)
        .await;
    finish_request(ctx);

    if let Err(error) = outcome {
        if let (Some(sink), Some(txn)) = (&ctx.analytics, &transaction_id) {
            sink.log_exception(txn, error.class_name(), error.message(), error.backtrace())
                .await;
        }
        if ctx.dispatcher.should_reraise_error(&error) {
            return Err(SessionError::Handler(error));
        }
        warn!("request handler failed: {error}");
    }
    Ok(())
}

/// Reports one completed request and fires shutdown on a memory breach.
fn finish_request(ctx: &WorkerContext) {
    if ctx.counters.request_completed(ctx.memory_limit) {
        ctx.shutdown.trigger("memory limit exceeded");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
