//! Execution backend abstraction.
//!
//! Dispatchers never talk to a provider directly. Each dispatch strategy is
//! generic over one of three capability sets:
//!
//! - [`SyncBackend`]: submit a single request and wait for its answer (online)
//! - [`AsyncBatchBackend`]: submit, poll, download and cancel bulk jobs (batch)
//! - [`LocalBackend`]: run a slice of requests through a local engine (offline)
//!
//! The [`Backend`] enum selects the strategy for a run.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::request::{GenericRequest, RowIndex, TokenUsage};
use crate::tracker::RequestCounts;

pub mod http;
pub mod mock;

pub use http::OpenAiCompatibleBackend;
pub use mock::{MockBatchBackend, MockLocalBackend, MockSyncBackend};

/// Failure taxonomy reported by backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Provider-side rate limit; retryable and triggers the global cooldown
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Timeouts, 5xx responses, connection resets
    #[error("transient error: {0}")]
    Transient(String),

    /// Non-retryable error (bad request, authentication, ...)
    #[error("fatal error: {0}")]
    Fatal(String),

    /// The backend does not know the given batch id
    #[error("unknown batch: {0}")]
    UnknownBatch(String),
}

impl BackendError {
    /// Whether the failed attempt may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::RateLimited(_) | BackendError::Transient(_))
    }

    /// Whether the error should pause the whole dispatcher.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, BackendError::RateLimited(_))
    }
}

/// Backend answer to a single request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendResponse {
    /// Parsed model output
    pub message: Option<Value>,
    pub finish_reason: Option<String>,
    /// Raw provider payload
    pub raw: Option<Value>,
    pub usage: Option<TokenUsage>,
}

/// Remote lifecycle state of a submitted batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteBatchStatus {
    /// Still validating or processing
    InProgress,
    /// Finished; results can be downloaded
    Completed,
    Cancelled,
    Expired,
    Failed,
}

impl RemoteBatchStatus {
    /// Terminal states other than `Completed` that yield no results.
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            RemoteBatchStatus::Cancelled | RemoteBatchStatus::Expired | RemoteBatchStatus::Failed
        )
    }
}

/// Result of polling a batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPoll {
    pub status: RemoteBatchStatus,
    pub request_counts: RequestCounts,
}

/// Outcome for one row of a downloaded batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItemOutcome {
    Succeeded(BackendResponse),
    Errored(String),
}

/// One line of a downloaded batch result.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemResult {
    pub original_row_idx: RowIndex,
    pub outcome: BatchItemOutcome,
}

/// A backend that answers each request synchronously.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Execute one request.
    ///
    /// # Errors
    /// Transient and rate-limit errors are retried by the caller; fatal errors
    /// produce a terminal failure for the row.
    async fn execute(
        &self,
        request: &GenericRequest,
    ) -> std::result::Result<BackendResponse, BackendError>;
}

/// A backend that accepts asynchronous bulk jobs.
#[async_trait]
pub trait AsyncBatchBackend: Send + Sync {
    /// Submit the contents of a request file; returns the remote batch id.
    async fn submit(
        &self,
        requests: &[GenericRequest],
        request_file: &Path,
    ) -> std::result::Result<String, BackendError>;

    /// Check remote status. Returns `UnknownBatch` for ids the backend has never seen.
    async fn poll(&self, batch_id: &str) -> std::result::Result<BatchPoll, BackendError>;

    /// Fetch per-row results of a completed batch.
    async fn download(
        &self,
        batch_id: &str,
    ) -> std::result::Result<Vec<BatchItemResult>, BackendError>;

    /// Request remote cancellation.
    async fn cancel(&self, batch_id: &str) -> std::result::Result<(), BackendError>;
}

/// Per-row result of a local generation call.
pub type LocalItemResult = std::result::Result<BackendResponse, String>;

/// A backend that runs inference in-process.
#[async_trait]
pub trait LocalBackend: Send + Sync {
    /// Generate outputs for a chunk of requests, returning one result per input, in order.
    async fn generate(
        &self,
        requests: &[GenericRequest],
    ) -> std::result::Result<Vec<LocalItemResult>, BackendError>;
}

/// Dispatch strategy selected for a run.
#[derive(Clone)]
pub enum Backend {
    Online(Arc<dyn SyncBackend>),
    Batch(Arc<dyn AsyncBatchBackend>),
    Offline(Arc<dyn LocalBackend>),
}

impl Backend {
    /// Stable name of the strategy; part of the run hash.
    pub fn strategy(&self) -> &'static str {
        match self {
            Backend::Online(_) => "online",
            Backend::Batch(_) => "batch",
            Backend::Offline(_) => "offline",
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Backend::{}", self.strategy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BackendError::RateLimited("429".into()).is_retryable());
        assert!(BackendError::RateLimited("429".into()).is_rate_limit());
        assert!(BackendError::Transient("503".into()).is_retryable());
        assert!(!BackendError::Transient("503".into()).is_rate_limit());
        assert!(!BackendError::Fatal("400".into()).is_retryable());
        assert!(!BackendError::UnknownBatch("b".into()).is_retryable());
    }

    #[test]
    fn test_lost_statuses() {
        assert!(RemoteBatchStatus::Expired.is_lost());
        assert!(RemoteBatchStatus::Cancelled.is_lost());
        assert!(!RemoteBatchStatus::Completed.is_lost());
        assert!(!RemoteBatchStatus::InProgress.is_lost());
    }
}
