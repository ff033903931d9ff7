//! Analytics hook: forwards transaction metadata and uncaught handler
//! failures to an external collector.
//!
//! The collector lives in another process and is reached over its own
//! connection; this core only defines the seam. [`AnalyticsSink`] is a
//! polymorphic collaborator with exactly the operations the connection worker
//! calls, so test doubles can record calls and real deployments can speak
//! whatever wire format their collector expects.

use async_trait::async_trait;
use uuid::Uuid;

/// Opaque handle identifying one request's analytics log stream.
///
/// Created per request when a transaction id is present, carried on the
/// request context for the lifetime of one dispatch call, and discarded
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsLog {
    transaction_id: String,
    group_name: String,
    handle_id: Uuid,
}

impl AnalyticsLog {
    pub fn new(transaction_id: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            group_name: group_name.into(),
            handle_id: Uuid::new_v4(),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Server-assigned id distinguishing this handle from any other, even for
    /// retried transactions with the same transaction id.
    pub fn handle_id(&self) -> Uuid {
        self.handle_id
    }
}

/// The external analytics collector, as seen by this core.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Registers a request and returns the per-request log handle.
    async fn open_log(&self, transaction_id: &str, group_name: &str) -> AnalyticsLog;

    /// Reports an uncaught handler failure for the given transaction.
    ///
    /// `backtrace` is the captured stack trace text; it is never empty when
    /// produced by [`crate::dispatch::DispatchError`].
    async fn log_exception(
        &self,
        transaction_id: &str,
        class_name: &str,
        message: &str,
        backtrace: &str,
    );
}

/// Sink for deployments without a collector: opens handles, drops reports.
#[derive(Debug, Default)]
pub struct NullAnalyticsSink;

#[async_trait]
impl AnalyticsSink for NullAnalyticsSink {
    async fn open_log(&self, transaction_id: &str, group_name: &str) -> AnalyticsLog {
        AnalyticsLog::new(transaction_id, group_name)
    }

    async fn log_exception(
        &self,
        transaction_id: &str,
        class_name: &str,
        _message: &str,
        _backtrace: &str,
    ) {
        tracing::debug!(
            "dropping exception report for transaction {transaction_id} ({class_name}): no analytics sink configured"
        );
    }
}
