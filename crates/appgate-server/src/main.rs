//! appgate-server entry point.
//!
//! Wires the request-acceptance core together and runs it until a lifecycle
//! monitor (owner pipe, memory guard) or Ctrl-C stops the main loop.
//!
//! This binary is the headless variant: it serves protocol-level traffic
//! (PING probes, the debug console handshake) and answers dispatched
//! requests with an empty response while logging them. Embedding
//! applications supply their own [`RequestDispatcher`] and analytics sink
//! through the library API instead.

use std::os::fd::{FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use appgate_core::headers::{PATH_INFO, REQUEST_METHOD};
use appgate_core::HeaderMap;
use appgate_server::analytics::NullAnalyticsSink;
use appgate_server::config::{load_options, ServerOptions};
use appgate_server::console::ExpressionEvaluator;
use appgate_server::dispatch::{Connection, DispatchError, RequestContext, RequestDispatcher};
use appgate_server::server::RequestServer;

/// Environment variable naming the inherited owner-pipe file descriptor.
const OWNER_PIPE_FD_VAR: &str = "APPGATE_OWNER_PIPE_FD";

/// Logs each dispatched request and answers with an empty response.
struct LoggingDispatcher;

#[async_trait]
impl RequestDispatcher for LoggingDispatcher {
    async fn process_request(
        &self,
        context: RequestContext,
        headers: HeaderMap,
        connection: &mut dyn Connection,
        full_response: bool,
    ) -> Result<(), DispatchError> {
        info!(
            "request {}: {} {}",
            context.connection_id,
            headers.get(REQUEST_METHOD).unwrap_or("-"),
            headers.get(PATH_INFO).unwrap_or("-"),
        );
        if full_response {
            connection
                .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n")
                .await
                .map_err(|e| DispatchError::new("IoError", e.to_string()))?;
        }
        Ok(())
    }
}

/// Evaluator for deployments without a console backend.
struct UnsupportedEvaluator;

#[async_trait]
impl ExpressionEvaluator for UnsupportedEvaluator {
    async fn evaluate(&self, _expression: &str) -> String {
        "=> evaluation not available in this build".to_string()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("appgate.toml"));
    let options: ServerOptions = load_options(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    // Structured logging; the configured level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(options.log_level.clone())),
        )
        .init();

    info!("appgate-server starting for group {:?}", options.app_group_name);

    let mut server = RequestServer::new(
        options,
        Arc::new(LoggingDispatcher),
        Some(Arc::new(NullAnalyticsSink)),
        Arc::new(UnsupportedEvaluator),
    )
    .await
    .context("binding server sockets")?;

    for socket in server.server_sockets().values() {
        info!("{} socket listening at {}", socket.name, socket.address);
    }

    // Owner pipe: inherited from the parent supervisor, fd number passed via
    // the environment. Without one, Ctrl-C is the only way in.
    match owner_pipe_from_env()? {
        Some(pipe) => server.attach_owner_pipe(pipe),
        None => warn!("no owner pipe inherited ({OWNER_PIPE_FD_VAR} unset)"),
    }

    let shutdown = server.shutdown_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.trigger("interrupt signal received");
        }
    });

    server.start_main_loop();
    server.wait_until_stopped().await;

    info!(
        "appgate-server stopped after {} processed requests",
        server.processed_requests()
    );
    Ok(())
}

/// Builds the owner-pipe reader from the inherited file descriptor, if the
/// parent provided one.
fn owner_pipe_from_env() -> anyhow::Result<Option<tokio::net::unix::pipe::Receiver>> {
    let Some(raw) = std::env::var_os(OWNER_PIPE_FD_VAR) else {
        return Ok(None);
    };
    let fd: i32 = raw
        .to_string_lossy()
        .parse()
        .with_context(|| format!("{OWNER_PIPE_FD_VAR} must be a file descriptor number"))?;
    // SAFETY: the parent process handed us this descriptor for exclusive use;
    // nothing else in this process reads or closes it.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(owned)
        .context("registering the owner pipe with the runtime")?;
    Ok(Some(receiver))
}
