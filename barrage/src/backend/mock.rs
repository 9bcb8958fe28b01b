//! Scriptable in-memory backends for tests.
//!
//! Each mock records the calls it receives and answers from per-row response
//! queues, falling back to a canned success when a row has nothing scripted.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

use super::{
    AsyncBatchBackend, BackendError, BackendResponse, BatchItemOutcome, BatchItemResult,
    BatchPoll, LocalBackend, LocalItemResult, RemoteBatchStatus, SyncBackend,
};
use crate::request::{GenericRequest, RowIndex, TokenUsage};
use crate::tracker::RequestCounts;

/// Canned successful answer for a row.
pub fn success_for_row(row_idx: RowIndex) -> BackendResponse {
    BackendResponse {
        message: Some(json!({"role": "assistant", "content": format!("response {row_idx}")})),
        finish_reason: Some("stop".to_string()),
        raw: None,
        usage: Some(TokenUsage {
            input: 10,
            output: 5,
            total: 15,
        }),
    }
}

// ============================================================================
// Synchronous backend
// ============================================================================

/// Mock synchronous backend.
///
/// # Example
/// ```ignore
/// let mock = MockSyncBackend::new();
/// mock.add_response(0, Err(BackendError::Transient("503".into())));
/// // row 0 fails once, then gets the canned success
/// ```
#[derive(Clone, Default)]
pub struct MockSyncBackend {
    responses: Arc<Mutex<HashMap<RowIndex, VecDeque<Result<BackendResponse, BackendError>>>>>,
    calls: Arc<Mutex<Vec<RowIndex>>>,
    call_times: Arc<Mutex<Vec<Instant>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl MockSyncBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `latency` inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a response for a row. Queued responses are returned in FIFO order.
    pub fn add_response(&self, row_idx: RowIndex, response: Result<BackendResponse, BackendError>) {
        self.responses
            .lock()
            .entry(row_idx)
            .or_default()
            .push_back(response);
    }

    /// Row indices of every call, in call order.
    pub fn calls(&self) -> Vec<RowIndex> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Start time of every call, in call order.
    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().clone()
    }

    /// Highest number of simultaneously executing calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight counter when dropped, even if the call is aborted.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SyncBackend for MockSyncBackend {
    async fn execute(
        &self,
        request: &GenericRequest,
    ) -> std::result::Result<BackendResponse, BackendError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
        };

        let row_idx = request.original_row_idx;
        self.calls.lock().push(row_idx);
        self.call_times.lock().push(Instant::now());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .responses
            .lock()
            .get_mut(&row_idx)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(success_for_row(row_idx)))
    }
}

// ============================================================================
// Batch backend
// ============================================================================

#[derive(Debug, Clone)]
struct MockBatch {
    rows: Vec<RowIndex>,
    polls: usize,
    status_override: Option<RemoteBatchStatus>,
}

#[derive(Default)]
struct MockBatchState {
    next_id: usize,
    batches: HashMap<String, MockBatch>,
    outcomes: HashMap<RowIndex, VecDeque<BatchItemOutcome>>,
    submitted: Vec<(String, PathBuf, Vec<RowIndex>)>,
    cancelled: Vec<String>,
}

/// Mock asynchronous batch backend.
///
/// Batches complete after `polls_until_complete` polls. Row outcomes are taken
/// from per-row queues at download time.
#[derive(Clone, Default)]
pub struct MockBatchBackend {
    state: Arc<Mutex<MockBatchState>>,
    polls_until_complete: usize,
}

impl MockBatchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of polls reporting `InProgress` before a batch completes.
    pub fn with_polls_until_complete(mut self, polls: usize) -> Self {
        self.polls_until_complete = polls;
        self
    }

    /// Queue an outcome for a row; consumed by the next download containing the row.
    pub fn add_outcome(&self, row_idx: RowIndex, outcome: BatchItemOutcome) {
        self.state
            .lock()
            .outcomes
            .entry(row_idx)
            .or_default()
            .push_back(outcome);
    }

    /// Force the remote status of a batch (e.g. `Expired`).
    pub fn set_status(&self, batch_id: &str, status: RemoteBatchStatus) {
        if let Some(batch) = self.state.lock().batches.get_mut(batch_id) {
            batch.status_override = Some(status);
        }
    }

    /// Drop a batch so it becomes unknown to the backend.
    pub fn forget_batch(&self, batch_id: &str) {
        self.state.lock().batches.remove(batch_id);
    }

    /// Every submission as (batch id, request file, row indices).
    pub fn submissions(&self) -> Vec<(String, PathBuf, Vec<RowIndex>)> {
        self.state.lock().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }

    fn counts(batch: &MockBatch, status: RemoteBatchStatus) -> RequestCounts {
        let total = batch.rows.len();
        match status {
            RemoteBatchStatus::InProgress => RequestCounts {
                total,
                in_progress: total,
                ..Default::default()
            },
            RemoteBatchStatus::Completed => RequestCounts {
                total,
                succeeded: total,
                ..Default::default()
            },
            _ => RequestCounts {
                total,
                failed: total,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl AsyncBatchBackend for MockBatchBackend {
    async fn submit(
        &self,
        requests: &[GenericRequest],
        request_file: &Path,
    ) -> std::result::Result<String, BackendError> {
        let mut state = self.state.lock();
        let batch_id = format!("batch_{}", state.next_id);
        state.next_id += 1;

        let rows: Vec<RowIndex> = requests.iter().map(|r| r.original_row_idx).collect();
        state.batches.insert(
            batch_id.clone(),
            MockBatch {
                rows: rows.clone(),
                polls: 0,
                status_override: None,
            },
        );
        state
            .submitted
            .push((batch_id.clone(), request_file.to_path_buf(), rows));
        Ok(batch_id)
    }

    async fn poll(&self, batch_id: &str) -> std::result::Result<BatchPoll, BackendError> {
        let mut state = self.state.lock();
        let batch = state
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| BackendError::UnknownBatch(batch_id.to_string()))?;

        batch.polls += 1;
        let status = batch.status_override.unwrap_or(if batch.polls > self.polls_until_complete {
            RemoteBatchStatus::Completed
        } else {
            RemoteBatchStatus::InProgress
        });

        Ok(BatchPoll {
            status,
            request_counts: Self::counts(batch, status),
        })
    }

    async fn download(
        &self,
        batch_id: &str,
    ) -> std::result::Result<Vec<BatchItemResult>, BackendError> {
        let mut state = self.state.lock();
        let rows = state
            .batches
            .get(batch_id)
            .map(|b| b.rows.clone())
            .ok_or_else(|| BackendError::UnknownBatch(batch_id.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row_idx| {
                let outcome = state
                    .outcomes
                    .get_mut(&row_idx)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| BatchItemOutcome::Succeeded(success_for_row(row_idx)));
                BatchItemResult {
                    original_row_idx: row_idx,
                    outcome,
                }
            })
            .collect())
    }

    async fn cancel(&self, batch_id: &str) -> std::result::Result<(), BackendError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.batches.get_mut(batch_id) {
            Some(batch) => {
                batch.status_override = Some(RemoteBatchStatus::Cancelled);
                state.cancelled.push(batch_id.to_string());
                Ok(())
            }
            None => Err(BackendError::UnknownBatch(batch_id.to_string())),
        }
    }
}

// ============================================================================
// Local backend
// ============================================================================

/// Mock local inference engine.
#[derive(Clone, Default)]
pub struct MockLocalBackend {
    failures: Arc<Mutex<HashMap<RowIndex, String>>>,
    chunks: Arc<Mutex<Vec<Vec<RowIndex>>>>,
}

impl MockLocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make generation for a row fail with `error`.
    pub fn fail_row(&self, row_idx: RowIndex, error: impl Into<String>) {
        self.failures.lock().insert(row_idx, error.into());
    }

    /// Row indices of every `generate` call, one entry per chunk.
    pub fn chunks(&self) -> Vec<Vec<RowIndex>> {
        self.chunks.lock().clone()
    }
}

#[async_trait]
impl LocalBackend for MockLocalBackend {
    async fn generate(
        &self,
        requests: &[GenericRequest],
    ) -> std::result::Result<Vec<LocalItemResult>, BackendError> {
        let rows: Vec<RowIndex> = requests.iter().map(|r| r.original_row_idx).collect();
        self.chunks.lock().push(rows.clone());

        let failures = self.failures.lock();
        Ok(rows
            .into_iter()
            .map(|row_idx| match failures.get(&row_idx) {
                Some(error) => Err(error.clone()),
                None => Ok(success_for_row(row_idx)),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ChatMessage;

    fn request(row_idx: RowIndex) -> GenericRequest {
        GenericRequest {
            model: "test-model".to_string(),
            messages: vec![ChatMessage::user("hi")],
            generation_params: Default::default(),
            original_row: json!({}),
            original_row_idx: row_idx,
        }
    }

    #[tokio::test]
    async fn test_sync_mock_scripted_then_default() {
        let mock = MockSyncBackend::new();
        mock.add_response(0, Err(BackendError::Transient("503".into())));

        assert!(mock.execute(&request(0)).await.is_err());
        assert!(mock.execute(&request(0)).await.is_ok());
        assert_eq!(mock.calls(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_batch_mock_lifecycle() {
        let mock = MockBatchBackend::new().with_polls_until_complete(1);
        let id = mock
            .submit(&[request(0), request(1)], Path::new("requests_0.jsonl"))
            .await
            .unwrap();

        let first = mock.poll(&id).await.unwrap();
        assert_eq!(first.status, RemoteBatchStatus::InProgress);
        assert_eq!(first.request_counts.in_progress, 2);

        let second = mock.poll(&id).await.unwrap();
        assert_eq!(second.status, RemoteBatchStatus::Completed);

        let results = mock.download(&id).await.unwrap();
        assert_eq!(results.len(), 2);

        mock.cancel(&id).await.unwrap();
        assert_eq!(mock.cancelled(), vec![id.clone()]);
        assert_eq!(
            mock.poll(&id).await.unwrap().status,
            RemoteBatchStatus::Cancelled
        );

        mock.forget_batch(&id);
        assert!(matches!(
            mock.cancel(&id).await,
            Err(BackendError::UnknownBatch(_))
        ));
        assert!(matches!(
            mock.poll(&id).await,
            Err(BackendError::UnknownBatch(_))
        ));
    }
}
