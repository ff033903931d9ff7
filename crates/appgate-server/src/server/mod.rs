//! Socket server: named listening endpoints feeding the connection workers.
//!
//! A [`RequestServer`] owns four sockets, each tagged with the protocol it
//! speaks:
//!
//! | name        | protocol                 | default endpoint          |
//! |-------------|--------------------------|---------------------------|
//! | `main`      | native binary            | unix socket in socket_dir |
//! | `http`      | restricted HTTP/1.1      | loopback TCP              |
//! | `irb`       | debug console (inline)   | unix socket in socket_dir |
//! | `async_irb` | debug console (spawned)  | unix socket in socket_dir |
//!
//! Every socket gets its own accept-loop task. Accepted connections go to the
//! next free worker; the pool is a semaphore, and a permit is taken *before*
//! accepting, so an exhausted pool leaves connections queueing in the
//! transport's own listen backlog instead of piling up in memory here.
//!
//! The directory holding the local socket files is created with owner-only
//! permissions; the socket files of a dead process are removed before
//! rebinding.

pub mod worker;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info};

use crate::analytics::AnalyticsSink;
use crate::auth::AuthPolicy;
use crate::config::{Endpoint, ServerOptions};
use crate::console::ExpressionEvaluator;
use crate::dispatch::RequestDispatcher;
use crate::lifecycle::{spawn_owner_pipe_monitor, ShutdownFlag};
use crate::resource::ResourceCounters;

use worker::WorkerContext;

/// How often accept loops wake up to re-check the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Owner-only permissions for the socket directory.
#[cfg(unix)]
const SOCKET_DIR_MODE: u32 = 0o700;

/// Error type for server construction.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to prepare socket directory {path}: {source}")]
    SocketDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind {name} socket at {endpoint}: {source}")]
    Bind {
        name: SocketName,
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
}

// ── Socket naming ─────────────────────────────────────────────────────────────

/// The four listening endpoints a server owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketName {
    Main,
    Http,
    Irb,
    AsyncIrb,
}

impl SocketName {
    pub const ALL: [SocketName; 4] = [
        SocketName::Main,
        SocketName::Http,
        SocketName::Irb,
        SocketName::AsyncIrb,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SocketName::Main => "main",
            SocketName::Http => "http",
            SocketName::Irb => "irb",
            SocketName::AsyncIrb => "async_irb",
        }
    }

    /// The protocol spoken on this socket. Fixed per name.
    pub fn kind(self) -> SocketKind {
        match self {
            SocketName::Main => SocketKind::Native,
            SocketName::Http => SocketKind::Http,
            SocketName::Irb => SocketKind::ConsoleSync,
            SocketName::AsyncIrb => SocketKind::ConsoleAsync,
        }
    }
}

impl std::fmt::Display for SocketName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol kind tag carried by each server socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Native,
    Http,
    ConsoleSync,
    ConsoleAsync,
}

impl std::fmt::Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SocketKind::Native => "native",
            SocketKind::Http => "http",
            SocketKind::ConsoleSync => "console",
            SocketKind::ConsoleAsync => "async console",
        };
        f.write_str(text)
    }
}

/// A bound listening endpoint, as reported to callers.
#[derive(Debug, Clone)]
pub struct ServerSocket {
    pub name: SocketName,
    pub kind: SocketKind,
    /// The resolved address: for TCP this carries the actual port even when
    /// the configuration asked for port 0.
    pub address: Endpoint,
}

// ── Listener / stream plumbing ────────────────────────────────────────────────

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    async fn accept(&self) -> std::io::Result<ServerStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ServerStream::Tcp(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(ServerStream::Unix(stream))
            }
        }
    }
}

/// An accepted connection from either socket family.
pub enum ServerStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

// ── The server ────────────────────────────────────────────────────────────────

/// The request-acceptance core: four bound sockets, a worker pool, and the
/// lifecycle monitors.
pub struct RequestServer {
    sockets: HashMap<SocketName, ServerSocket>,
    /// Listeners waiting for [`Self::start_main_loop`]; empty afterwards.
    listeners: Vec<(SocketName, Listener)>,
    context: Arc<WorkerContext>,
    shutdown: ShutdownFlag,
    pool: Arc<Semaphore>,
    live_loops: Arc<AtomicUsize>,
    owner_pipe: Option<Box<dyn AsyncRead + Send + Unpin>>,
    loop_handles: Vec<JoinHandle<()>>,
}

impl RequestServer {
    /// Binds all four sockets and prepares the worker pool. Nothing is
    /// accepted until [`Self::start_main_loop`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] if the socket directory cannot be prepared or
    /// any endpoint fails to bind.
    pub async fn new(
        options: ServerOptions,
        dispatcher: Arc<dyn RequestDispatcher>,
        analytics: Option<Arc<dyn AnalyticsSink>>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Result<Self, ServerError> {
        let shutdown = ShutdownFlag::new();
        let counters = Arc::new(ResourceCounters::new());

        let mut sockets = HashMap::new();
        let mut listeners = Vec::new();
        for name in SocketName::ALL {
            let endpoint = configured_endpoint(&options, name);
            let (listener, resolved) = bind_endpoint(name, endpoint).await?;
            sockets.insert(
                name,
                ServerSocket {
                    name,
                    kind: name.kind(),
                    address: resolved,
                },
            );
            listeners.push((name, listener));
        }

        let context = Arc::new(WorkerContext {
            auth: AuthPolicy::new(options.connect_password.clone()),
            dispatcher,
            analytics,
            evaluator,
            counters,
            shutdown: shutdown.clone(),
            app_group_name: options.app_group_name.clone(),
            max_header_size: options.max_header_size,
            memory_limit: options.memory_limit,
        });

        Ok(Self {
            sockets,
            listeners,
            context,
            shutdown,
            pool: Arc::new(Semaphore::new(options.pool_size.max(1))),
            live_loops: Arc::new(AtomicUsize::new(0)),
            owner_pipe: None,
            loop_handles: Vec::new(),
        })
    }

    /// Registers the control descriptor inherited from the parent process.
    /// Must be called before [`Self::start_main_loop`] to take effect.
    pub fn attach_owner_pipe<R>(&mut self, pipe: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.owner_pipe = Some(Box::new(pipe));
    }

    /// The bound sockets, keyed by name.
    pub fn server_sockets(&self) -> &HashMap<SocketName, ServerSocket> {
        &self.sockets
    }

    /// The resolved address of one socket.
    pub fn socket_address(&self, name: SocketName) -> &Endpoint {
        &self.sockets[&name].address
    }

    /// Whether any accept loop is still running.
    pub fn main_loop_running(&self) -> bool {
        self.live_loops.load(Ordering::SeqCst) > 0
    }

    /// Total requests completed since startup.
    pub fn processed_requests(&self) -> u64 {
        self.context.counters.processed_requests()
    }

    /// The shared shutdown signal; external supervisors may trigger it too.
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    /// Starts one accept-loop task per socket plus the owner-pipe monitor.
    /// Idempotent: calling again after the loops have started does nothing.
    pub fn start_main_loop(&mut self) {
        let listeners = std::mem::take(&mut self.listeners);
        if listeners.is_empty() {
            return;
        }

        self.live_loops.store(listeners.len(), Ordering::SeqCst);
        for (name, listener) in listeners {
            let handle = tokio::spawn(accept_loop(
                name,
                listener,
                Arc::clone(&self.context),
                Arc::clone(&self.pool),
                self.shutdown.clone(),
                Arc::clone(&self.live_loops),
            ));
            self.loop_handles.push(handle);
        }

        if let Some(pipe) = self.owner_pipe.take() {
            spawn_owner_pipe_monitor(pipe, self.shutdown.clone());
        }
    }

    /// Waits for every accept loop to stop. In-flight workers may still be
    /// draining when this returns; they hold no server state beyond the
    /// shared counters.
    pub async fn wait_until_stopped(&mut self) {
        for handle in self.loop_handles.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Drop for RequestServer {
    fn drop(&mut self) {
        // Unbinding does not unlink unix socket files; stale files would
        // shadow the next process's bind.
        for socket in self.sockets.values() {
            if let Endpoint::Unix(path) = &socket.address {
                let _ = std::fs::remove_file(path);
            }
        }
    }
}

// ── Binding ───────────────────────────────────────────────────────────────────

fn configured_endpoint(options: &ServerOptions, name: SocketName) -> Endpoint {
    let configured = match name {
        SocketName::Main => &options.sockets.main,
        SocketName::Http => &options.sockets.http,
        SocketName::Irb => &options.sockets.irb,
        SocketName::AsyncIrb => &options.sockets.async_irb,
    };
    configured.clone().unwrap_or_else(|| match name {
        // The HTTP socket exists for front ends that only speak TCP.
        SocketName::Http => Endpoint::Tcp("127.0.0.1:0".to_string()),
        other => Endpoint::Unix(
            options
                .socket_dir
                .join(format!("{}.sock", other.as_str())),
        ),
    })
}

async fn bind_endpoint(
    name: SocketName,
    endpoint: Endpoint,
) -> Result<(Listener, Endpoint), ServerError> {
    match endpoint {
        Endpoint::Unix(path) => {
            if let Some(dir) = path.parent() {
                prepare_socket_dir(dir)?;
            }
            // A stale file from a previous process blocks the bind.
            if path.exists() {
                std::fs::remove_file(&path).map_err(|source| ServerError::Bind {
                    name,
                    endpoint: format!("unix:{}", path.display()),
                    source,
                })?;
            }
            let listener = UnixListener::bind(&path).map_err(|source| ServerError::Bind {
                name,
                endpoint: format!("unix:{}", path.display()),
                source,
            })?;
            Ok((Listener::Unix(listener), Endpoint::Unix(path)))
        }
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(&addr)
                .await
                .map_err(|source| ServerError::Bind {
                    name,
                    endpoint: format!("tcp:{addr}"),
                    source,
                })?;
            let resolved = listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or(addr);
            Ok((Listener::Tcp(listener), Endpoint::Tcp(resolved)))
        }
    }
}

/// Creates the socket directory and restricts it to the owner.
fn prepare_socket_dir(dir: &Path) -> Result<(), ServerError> {
    let fail = |source| ServerError::SocketDir {
        path: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(fail)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(SOCKET_DIR_MODE))
            .map_err(fail)?;
    }
    Ok(())
}

// ── Accept loop ───────────────────────────────────────────────────────────────

async fn accept_loop(
    name: SocketName,
    listener: Listener,
    context: Arc<WorkerContext>,
    pool: Arc<Semaphore>,
    shutdown: ShutdownFlag,
    live_loops: Arc<AtomicUsize>,
) {
    let kind = name.kind();
    info!("{name} socket accepting connections");

    loop {
        if shutdown.is_triggered() {
            break;
        }

        // Take a worker permit before accepting: with the pool exhausted, new
        // connections wait in the listen backlog, not in this process.
        let permit = match timeout(ACCEPT_POLL_INTERVAL, Arc::clone(&pool).acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => break,
            Err(_) => continue,
        };

        // The timeout keeps this loop responsive to the shutdown flag even
        // when no clients are connecting.
        match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
            Ok(Ok(stream)) => {
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    worker::handle_connection(stream, kind, context).await;
                    drop(permit);
                });
            }
            Ok(Err(e)) => {
                // Transient accept errors (fd exhaustion etc.) are not fatal.
                error!("accept error on {name} socket: {e}");
            }
            Err(_) => {}
        }
    }

    live_loops.fetch_sub(1, Ordering::SeqCst);
    info!("{name} socket accept loop stopped");
}
