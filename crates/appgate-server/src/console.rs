//! Debug console bridge.
//!
//! Both console socket kinds (`irb` and `async_irb`) speak the framed scalar
//! protocol. The handshake is one scalar carrying the connect password,
//! answered with the array `["ok"]` (or a silent close). Each scalar after
//! that is an expression string; the bridge forwards it to the evaluation
//! collaborator and replies with `["end", base64(result)]`.
//!
//! The two kinds share this loop. The async variant runs each evaluation on
//! its own spawned task, so a stalled evaluator parks that one console
//! session instead of anything else.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use appgate_core::protocol::{read_scalar, write_array, ProtocolError};

use crate::auth::{AuthOutcome, AuthPolicy};

/// Status field of a successful handshake reply.
const STATUS_OK: &str = "ok";
/// Status field of a completed evaluation reply.
const STATUS_END: &str = "end";

/// Expressions are short command strings; anything near this size is abuse.
const MAX_EXPRESSION_SIZE: usize = 64 * 1024;

/// How an accepted console session runs its evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleMode {
    /// Evaluate on the connection's own task (`irb`).
    Inline,
    /// Evaluate on a dedicated spawned task (`async_irb`).
    Spawned,
}

/// The external expression evaluator, as seen by this core.
///
/// Returns the rendered result text (e.g. an inspect-style `=> 7`); the
/// bridge base64-encodes it for the wire.
#[async_trait::async_trait]
pub trait ExpressionEvaluator: Send + Sync {
    async fn evaluate(&self, expression: &str) -> String;
}

/// Runs one authenticated console session until the client disconnects.
///
/// # Errors
///
/// Returns [`ProtocolError`] on framing or I/O failures. Authentication
/// failure is not an error: the session ends silently, matching the policy on
/// the request sockets.
pub async fn run_console_session<S>(
    stream: &mut S,
    auth: &AuthPolicy,
    evaluator: Arc<dyn ExpressionEvaluator>,
    mode: ConsoleMode,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    // Handshake: one scalar carrying the password.
    let Some(supplied) = read_scalar(stream, MAX_EXPRESSION_SIZE).await? else {
        return Ok(());
    };
    if auth.check_console(&supplied) == AuthOutcome::Rejected {
        debug!("console handshake rejected; closing silently");
        return Ok(());
    }
    write_array(stream, &[STATUS_OK]).await?;

    while let Some(payload) = read_scalar(stream, MAX_EXPRESSION_SIZE).await? {
        let expression = String::from_utf8_lossy(&payload).into_owned();

        let result = match mode {
            ConsoleMode::Inline => evaluator.evaluate(&expression).await,
            ConsoleMode::Spawned => {
                let evaluator = Arc::clone(&evaluator);
                match tokio::spawn(async move { evaluator.evaluate(&expression).await }).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("console evaluation task failed: {e}");
                        return Ok(());
                    }
                }
            }
        };

        write_array(stream, &[STATUS_END, &BASE64.encode(result.as_bytes())]).await?;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
