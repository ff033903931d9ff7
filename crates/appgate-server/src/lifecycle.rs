//! Process lifecycle: the single-fire shutdown flag and the owner-pipe
//! monitor.
//!
//! Two subsystems can end the main loop: the resource guard (memory ceiling)
//! and the owner pipe inherited from the parent supervisor. Both funnel into
//! one [`ShutdownFlag`] that every accept loop polls between accepts.
//! In-flight connection workers are never cancelled; they finish their
//! current request and the process exits once the loops have drained.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::info;

/// Cooperative, single-fire shutdown signal shared by all tasks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. The first call logs `reason`; later calls are
    /// no-ops, so racing triggers (memory guard vs. owner pipe) are fine.
    pub fn trigger(&self, reason: &str) {
        if !self.inner.swap(true, Ordering::SeqCst) {
            info!("shutdown requested: {reason}");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// Watches the control pipe inherited from the parent process.
///
/// The parent never writes to this pipe; it exists so that the parent's death
/// (or an explicit close) is observable here. Any read completion fires the
/// shutdown flag: EOF when the write end closes, data if the parent ever did
/// write, or an error. This gives the supervisor an unconditional way to
/// reclaim the process even when no shutdown command ever arrives.
pub fn spawn_owner_pipe_monitor<R>(mut pipe: R, shutdown: ShutdownFlag) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 1];
        let _ = pipe.read(&mut buf).await;
        shutdown.trigger("owner pipe closed");
    })
}
