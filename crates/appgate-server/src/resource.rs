//! Process-wide resource accounting and the memory-limit safety valve.
//!
//! Long-lived worker processes can grow without bound when the application
//! leaks; the resource guard turns that into an orderly retirement instead of
//! an OOM kill. After every completed request the worker reports in, the
//! guard samples the process's resident set size, and a breach of the
//! configured ceiling asks the server to stop accepting. In-flight work is
//! never cut short.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

/// Shared request/memory counters. Monotonic for the life of the process.
#[derive(Debug, Default)]
pub struct ResourceCounters {
    processed_requests: AtomicU64,
    memory_estimate: AtomicU64,
}

impl ResourceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total requests completed since startup (PING included).
    pub fn processed_requests(&self) -> u64 {
        self.processed_requests.load(Ordering::Relaxed)
    }

    /// Resident set size in bytes as of the last completed request.
    pub fn memory_estimate(&self) -> u64 {
        self.memory_estimate.load(Ordering::Relaxed)
    }

    /// Records one completed request and re-samples memory usage.
    ///
    /// Returns `true` when `memory_limit` (bytes) is non-zero and the current
    /// resident set size exceeds it; the caller is expected to trigger
    /// shutdown. A zero limit disables the check.
    pub fn request_completed(&self, memory_limit: u64) -> bool {
        self.processed_requests.fetch_add(1, Ordering::Relaxed);

        let rss = current_rss_bytes();
        self.memory_estimate.store(rss, Ordering::Relaxed);

        if memory_limit > 0 && rss > memory_limit {
            warn!(
                "memory usage of {rss} bytes exceeds the limit of {memory_limit} bytes"
            );
            true
        } else {
            false
        }
    }
}

/// Reads the process's resident set size from `/proc/self/status` (`VmRSS`).
///
/// Returns 0 on platforms without procfs, which effectively disables the
/// memory check there.
#[cfg(target_os = "linux")]
fn current_rss_bytes() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(value) = line.strip_prefix("VmRSS:") {
            let kib = value
                .split_whitespace()
                .next()
                .and_then(|token| token.parse::<u64>().ok())
                .unwrap_or(0);
            return kib * 1024;
        }
    }
    0
}

#[cfg(not(target_os = "linux"))]
fn current_rss_bytes() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_completed_increments_counter() {
        let counters = ResourceCounters::new();
        assert_eq!(counters.processed_requests(), 0);

        counters.request_completed(0);
        counters.request_completed(0);

        assert_eq!(counters.processed_requests(), 2);
    }

    #[test]
    fn test_zero_limit_never_breaches() {
        let counters = ResourceCounters::new();
        assert!(!counters.request_completed(0));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_one_byte_limit_breaches_immediately() {
        // Any live process has an RSS far above one byte.
        let counters = ResourceCounters::new();
        assert!(counters.request_completed(1));
        assert!(counters.memory_estimate() > 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rss_sample_is_plausible() {
        let rss = current_rss_bytes();
        // At least one page, below a terabyte.
        assert!(rss > 4096, "rss {rss} suspiciously small");
        assert!(rss < 1 << 40, "rss {rss} suspiciously large");
    }
}
