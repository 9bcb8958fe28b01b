//! Durable status tracking for batch runs.
//!
//! [`BatchStatusTracker`] is a pure state container. Every mutator rewrites the
//! whole tracker file (`batch_objects.jsonl`) atomically, so recovery is "read one
//! file, trust it completely". Callers serialize access: only the batch
//! dispatcher's main loop owns a tracker.
//!
//! ```text
//! pending ──add_submitted_batch()──> submitted ──mark_downloaded()──> downloaded
//!    ^                                   │  │                              │
//!    └───────────mark_cancelled()────────┘  └──mark_lost()──> (resubmit)   └──> (resubmit failed rows)
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::files::write_atomic;

/// Per-batch request counters.
///
/// Invariant: `total == succeeded + failed + in_progress`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub in_progress: usize,
}

impl RequestCounts {
    /// Counts for a batch whose rows are all still running.
    pub fn in_progress(total: usize) -> Self {
        Self {
            total,
            in_progress: total,
            ..Default::default()
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.succeeded + self.failed + self.in_progress
    }
}

/// A request file waiting to be submitted as a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequestFile {
    pub path: PathBuf,
    /// Shard whose response file receives this batch's results
    pub shard: usize,
    /// Resubmission round; every row in the file has used this many attempts
    pub attempt: u32,
}

/// One submitted batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchObject {
    /// Remote batch id
    pub id: String,
    /// Request file the batch was submitted from
    pub request_file: PathBuf,
    pub shard: usize,
    pub attempt: u32,
    pub request_counts: RequestCounts,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// What a download produced, as reported by the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Rows answered with a valid response
    pub succeeded: usize,
    /// Rows that errored or had an invalid finish reason
    pub failed: usize,
    /// Subset of `failed` with no attempts left
    pub permanently_failed: usize,
    /// Request file holding the retryable subset of `failed`
    pub resubmit: Option<PendingRequestFile>,
}

/// Aggregate run state for the batch dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatusTracker {
    pub n_total_requests: usize,
    #[serde(default)]
    pub pending_request_files: Vec<PendingRequestFile>,
    #[serde(default)]
    pub submitted_batches: BTreeMap<String, BatchObject>,
    #[serde(default)]
    pub downloaded_batches: BTreeMap<String, BatchObject>,
    #[serde(default)]
    pub n_downloaded_failed_requests: usize,
    #[serde(default)]
    pub n_succeeded_requests: usize,
    #[serde(default)]
    pub n_permanently_failed_requests: usize,
    #[serde(skip)]
    path: PathBuf,
}

impl BatchStatusTracker {
    /// Create a tracker and write it to `path`.
    pub fn create(
        path: impl Into<PathBuf>,
        n_total_requests: usize,
        pending_request_files: Vec<PendingRequestFile>,
    ) -> Result<Self> {
        let tracker = Self {
            n_total_requests,
            pending_request_files,
            submitted_batches: BTreeMap::new(),
            downloaded_batches: BTreeMap::new(),
            n_downloaded_failed_requests: 0,
            n_succeeded_requests: 0,
            n_permanently_failed_requests: 0,
            path: path.into(),
        };
        tracker.persist()?;
        Ok(tracker)
    }

    /// Load a tracker previously written to `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut tracker: Self = serde_json::from_str(&contents)?;
        tracker.path = path.to_path_buf();
        Ok(tracker)
    }

    /// Load the tracker at `path`, or create one with the given pending files if absent.
    pub fn load_or_create(
        path: impl AsRef<Path>,
        n_total_requests: usize,
        pending: impl FnOnce() -> Vec<PendingRequestFile>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let tracker = Self::load(path)?;
            tracing::info!(
                path = %path.display(),
                submitted = tracker.submitted_batches.len(),
                downloaded = tracker.downloaded_batches.len(),
                pending = tracker.pending_request_files.len(),
                "Resuming from batch tracker"
            );
            Ok(tracker)
        } else {
            Self::create(path, n_total_requests, pending())
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        let contents = serde_json::to_vec_pretty(self)?;
        write_atomic(&self.path, &contents)
    }

    // ------------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------------

    /// Record a newly submitted batch and drop its request file from the pending list.
    pub fn add_submitted_batch(&mut self, batch: BatchObject) -> Result<()> {
        self.pending_request_files
            .retain(|pending| pending.path != batch.request_file);
        self.submitted_batches.insert(batch.id.clone(), batch);
        self.persist()
    }

    /// Update the counters of a submitted batch from a poll.
    ///
    /// The batch keeps the total it was submitted with; the backend's finished
    /// counts are capped to it and `in_progress` is derived.
    pub fn record_counts(&mut self, batch_id: &str, counts: RequestCounts) -> Result<()> {
        match self.submitted_batches.get_mut(batch_id) {
            Some(batch) => {
                let total = batch.request_counts.total;
                let succeeded = counts.succeeded.min(total);
                let failed = counts.failed.min(total - succeeded);
                let normalized = RequestCounts {
                    total,
                    succeeded,
                    failed,
                    in_progress: total - succeeded - failed,
                };
                if normalized != counts {
                    tracing::debug!(
                        batch_id,
                        reported = ?counts,
                        recorded = ?normalized,
                        "Normalized backend request counts"
                    );
                }
                batch.request_counts = normalized;
                self.persist()
            }
            None => {
                tracing::warn!(batch_id, "Ignoring counts for untracked batch");
                Ok(())
            }
        }
    }

    /// Move a batch from submitted to downloaded and record what it produced.
    pub fn mark_downloaded(&mut self, batch_id: &str, outcome: DownloadOutcome) -> Result<()> {
        let Some(mut batch) = self.submitted_batches.remove(batch_id) else {
            tracing::warn!(batch_id, "Ignoring download of untracked batch");
            return Ok(());
        };

        batch.request_counts = RequestCounts {
            total: batch.request_counts.total,
            succeeded: outcome.succeeded,
            failed: batch.request_counts.total.saturating_sub(outcome.succeeded),
            in_progress: 0,
        };
        batch.finished_at = Some(Utc::now());

        self.n_downloaded_failed_requests += outcome.failed;
        self.n_succeeded_requests += outcome.succeeded;
        self.n_permanently_failed_requests += outcome.permanently_failed;
        if let Some(resubmit) = outcome.resubmit {
            self.pending_request_files.push(resubmit);
        }
        self.downloaded_batches.insert(batch_id.to_string(), batch);
        self.persist()
    }

    /// Drop a batch whose results will never arrive (expired, cancelled remotely, unknown).
    pub fn mark_lost(
        &mut self,
        batch_id: &str,
        permanently_failed: usize,
        resubmit: Option<PendingRequestFile>,
    ) -> Result<()> {
        if self.submitted_batches.remove(batch_id).is_none() {
            tracing::warn!(batch_id, "Ignoring loss of untracked batch");
            return Ok(());
        }
        self.n_permanently_failed_requests += permanently_failed;
        if let Some(resubmit) = resubmit {
            self.pending_request_files.push(resubmit);
        }
        self.persist()
    }

    /// Record a user-requested cancel; the batch's request file becomes pending again.
    pub fn mark_cancelled(&mut self, batch_id: &str) -> Result<()> {
        let Some(batch) = self.submitted_batches.remove(batch_id) else {
            tracing::warn!(batch_id, "Ignoring cancel of untracked batch");
            return Ok(());
        };
        self.pending_request_files.push(PendingRequestFile {
            path: batch.request_file,
            shard: batch.shard,
            attempt: batch.attempt,
        });
        self.persist()
    }

    /// Give `rows` permanently failed rows, now written to `pending`, a fresh set of attempts.
    pub fn requeue_failed(&mut self, pending: PendingRequestFile, rows: usize) -> Result<()> {
        self.n_permanently_failed_requests = self.n_permanently_failed_requests.saturating_sub(rows);
        self.pending_request_files.push(pending);
        self.persist()
    }

    // ------------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------------

    pub fn n_total_requests(&self) -> usize {
        self.n_total_requests
    }

    /// Requests still running remotely.
    pub fn n_in_progress_requests(&self) -> usize {
        self.submitted_batches
            .values()
            .map(|b| b.request_counts.in_progress)
            .sum()
    }

    /// Successful rows summed over downloaded batches.
    pub fn n_succeeded(&self) -> usize {
        self.downloaded_batches
            .values()
            .map(|b| b.request_counts.succeeded)
            .sum()
    }

    /// Failed rows summed over downloaded batches, including ones later resubmitted.
    pub fn n_failed(&self) -> usize {
        self.downloaded_batches
            .values()
            .map(|b| b.request_counts.failed)
            .sum()
    }

    pub fn submitted_batch_ids(&self) -> Vec<String> {
        self.submitted_batches.keys().cloned().collect()
    }

    pub fn downloaded_batch_ids(&self) -> Vec<String> {
        self.downloaded_batches.keys().cloned().collect()
    }

    pub fn has_outstanding_work(&self) -> bool {
        !self.submitted_batches.is_empty() || !self.pending_request_files.is_empty()
    }

    /// The run is complete once every row has succeeded or permanently failed.
    pub fn is_complete(&self) -> bool {
        !self.has_outstanding_work()
            && self.n_succeeded_requests + self.n_permanently_failed_requests
                >= self.n_total_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn batch(id: &str, file: &str, total: usize) -> BatchObject {
        BatchObject {
            id: id.to_string(),
            request_file: PathBuf::from(file),
            shard: 0,
            attempt: 0,
            request_counts: RequestCounts::in_progress(total),
            submitted_at: Utc::now(),
            finished_at: None,
        }
    }

    fn pending(file: &str, attempt: u32) -> PendingRequestFile {
        PendingRequestFile {
            path: PathBuf::from(file),
            shard: 0,
            attempt,
        }
    }

    #[test]
    fn test_every_mutation_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch_objects.jsonl");

        let mut tracker =
            BatchStatusTracker::create(&path, 3, vec![pending("requests_0.jsonl", 0)]).unwrap();
        tracker
            .add_submitted_batch(batch("b1", "requests_0.jsonl", 3))
            .unwrap();

        let reloaded = BatchStatusTracker::load(&path).unwrap();
        assert_eq!(reloaded, tracker);
        assert!(reloaded.pending_request_files.is_empty());
        assert_eq!(reloaded.submitted_batch_ids(), vec!["b1".to_string()]);
        assert_eq!(reloaded.n_in_progress_requests(), 3);
    }

    #[test]
    fn test_resubmission_bookkeeping() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch_objects.jsonl");
        let mut tracker = BatchStatusTracker::create(&path, 3, Vec::new()).unwrap();

        tracker
            .add_submitted_batch(batch("b1", "requests_0.jsonl", 3))
            .unwrap();
        tracker
            .mark_downloaded(
                "b1",
                DownloadOutcome {
                    succeeded: 2,
                    failed: 1,
                    permanently_failed: 0,
                    resubmit: Some(pending("requests_0_resubmit_1.jsonl", 1)),
                },
            )
            .unwrap();
        assert!(!tracker.is_complete());
        assert_eq!(tracker.pending_request_files.len(), 1);

        let mut retry = batch("b2", "requests_0_resubmit_1.jsonl", 1);
        retry.attempt = 1;
        tracker.add_submitted_batch(retry).unwrap();
        tracker
            .mark_downloaded(
                "b2",
                DownloadOutcome {
                    succeeded: 1,
                    ..Default::default()
                },
            )
            .unwrap();

        let reloaded = BatchStatusTracker::load(&path).unwrap();
        assert!(reloaded.submitted_batches.is_empty());
        assert_eq!(reloaded.downloaded_batches.len(), 2);
        assert_eq!(reloaded.n_succeeded(), 3);
        assert_eq!(reloaded.n_downloaded_failed_requests, 1);
        assert!(reloaded.is_complete());
        for batch in reloaded.downloaded_batches.values() {
            assert!(batch.request_counts.is_consistent());
        }
    }

    #[test]
    fn test_cancel_returns_file_to_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch_objects.jsonl");
        let mut tracker = BatchStatusTracker::create(&path, 3, Vec::new()).unwrap();
        tracker
            .add_submitted_batch(batch("b1", "requests_0.jsonl", 3))
            .unwrap();

        tracker.mark_cancelled("b1").unwrap();

        let reloaded = BatchStatusTracker::load(&path).unwrap();
        assert!(reloaded.submitted_batches.is_empty());
        assert!(reloaded.downloaded_batches.is_empty());
        assert_eq!(reloaded.pending_request_files, vec![pending("requests_0.jsonl", 0)]);
    }

    #[test]
    fn test_mark_lost_counts_permanent_failures() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch_objects.jsonl");
        let mut tracker = BatchStatusTracker::create(&path, 2, Vec::new()).unwrap();
        tracker
            .add_submitted_batch(batch("b1", "requests_0.jsonl", 2))
            .unwrap();

        tracker.mark_lost("b1", 2, None).unwrap();

        assert!(tracker.is_complete());
        assert_eq!(tracker.n_permanently_failed_requests, 2);
    }

    #[test]
    fn test_requeued_failures_reopen_the_run() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch_objects.jsonl");
        let mut tracker = BatchStatusTracker::create(&path, 2, Vec::new()).unwrap();
        tracker
            .add_submitted_batch(batch("b1", "requests_0.jsonl", 2))
            .unwrap();
        tracker.mark_lost("b1", 2, None).unwrap();
        assert!(tracker.is_complete());

        tracker
            .requeue_failed(pending("requests_0_retry.jsonl", 0), 2)
            .unwrap();

        let reloaded = BatchStatusTracker::load(&path).unwrap();
        assert_eq!(reloaded.n_permanently_failed_requests, 0);
        assert_eq!(
            reloaded.pending_request_files,
            vec![pending("requests_0_retry.jsonl", 0)]
        );
        assert!(!reloaded.is_complete());
    }

    #[test]
    fn test_polled_counts_are_normalized_to_the_batch_total() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch_objects.jsonl");
        let mut tracker = BatchStatusTracker::create(&path, 3, Vec::new()).unwrap();
        tracker
            .add_submitted_batch(batch("b1", "requests_0.jsonl", 3))
            .unwrap();

        tracker
            .record_counts(
                "b1",
                RequestCounts {
                    total: 99,
                    succeeded: 1,
                    failed: 0,
                    in_progress: 0,
                },
            )
            .unwrap();

        let reloaded = BatchStatusTracker::load(&path).unwrap();
        let counts = reloaded.submitted_batches["b1"].request_counts;
        assert!(counts.is_consistent());
        assert_eq!(
            counts,
            RequestCounts {
                total: 3,
                succeeded: 1,
                failed: 0,
                in_progress: 2
            }
        );
        assert_eq!(reloaded.n_in_progress_requests(), 2);

        tracker
            .record_counts(
                "b1",
                RequestCounts {
                    total: 3,
                    succeeded: 2,
                    failed: 5,
                    in_progress: 0,
                },
            )
            .unwrap();
        let counts = tracker.submitted_batches["b1"].request_counts;
        assert!(counts.is_consistent());
        assert_eq!((counts.succeeded, counts.failed, counts.in_progress), (2, 1, 0));
    }

    #[test]
    fn test_counts_invariant() {
        assert!(RequestCounts::in_progress(4).is_consistent());
        assert!(!RequestCounts {
            total: 3,
            succeeded: 1,
            failed: 0,
            in_progress: 1
        }
        .is_consistent());
    }
}
