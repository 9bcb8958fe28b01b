//! Batch dispatcher for asynchronous bulk-job backends.
//!
//! Every request file becomes one remote batch. The [`BatchStatusTracker`] is
//! the single source of truth: it is loaded (or created) at start, mutated only
//! by this dispatcher's loop, and persisted after every transition. A restart
//! re-polls batches the tracker lists as submitted and never resubmits them
//! blindly.
//!
//! ```text
//! pending ──submit──> submitted ──poll──> completed ──download──> downloaded
//!                        │                                           │
//!                        └─ cancelled/expired/unknown ─┐             └─ failed rows ─┐
//!                                                      v                             v
//!                                        requests_<shard>_resubmit_<attempt>.jsonl (pending)
//! ```
//!
//! A batch's resubmission round is the attempt index of every row in it. Rows
//! failing in round `r` are resubmitted while `r < max_retries`, otherwise they
//! become permanent failures. A later run over the same working directory
//! queues permanent failures again in `requests_<shard>_retry_<n>.jsonl`, back at
//! round 0.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::success_response;
use crate::backend::{
    AsyncBatchBackend, BackendError, BatchItemOutcome, BatchItemResult, RemoteBatchStatus,
};
use crate::config::BatchConfig;
use crate::error::{BarrageError, Result};
use crate::files::requests::write_request_file;
use crate::files::{
    append_failed_requests, read_requests, read_responses, reconcile_responses, terminal_rows,
    RequestShard, ResponseWriter, RunFiles,
};
use crate::progress::{NoopProgress, ProgressObserver, RunStats};
use crate::request::{is_invalid_finish_reason, GenericRequest, GenericResponse, RowIndex};
use crate::tracker::{BatchObject, BatchStatusTracker, DownloadOutcome, PendingRequestFile};

/// Drives the request files of a run through an [`AsyncBatchBackend`].
pub struct BatchDispatcher {
    backend: Arc<dyn AsyncBatchBackend>,
    config: BatchConfig,
    files: RunFiles,
    invalid_finish_reasons: Vec<String>,
    require_all_responses: bool,
    progress: Arc<dyn ProgressObserver>,
    cancellation: CancellationToken,
}

impl BatchDispatcher {
    pub fn new(
        backend: Arc<dyn AsyncBatchBackend>,
        config: BatchConfig,
        files: RunFiles,
        invalid_finish_reasons: Vec<String>,
    ) -> Self {
        Self {
            backend,
            config,
            files,
            invalid_finish_reasons,
            require_all_responses: false,
            progress: Arc::new(NoopProgress),
            cancellation: CancellationToken::new(),
        }
    }

    /// Fail the run as soon as any row fails permanently.
    pub fn require_all_responses(mut self, required: bool) -> Self {
        self.require_all_responses = required;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    /// Cancel every submitted batch and stop once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Load the run's tracker, or create one with every shard pending.
    pub fn load_tracker(&self, shards: &[RequestShard]) -> Result<BatchStatusTracker> {
        let n_total = shards.iter().map(|s| s.num_jobs).sum();
        BatchStatusTracker::load_or_create(self.files.tracker_file(), n_total, || {
            shards
                .iter()
                .map(|shard| PendingRequestFile {
                    path: shard.request_file.clone(),
                    shard: shard.shard,
                    attempt: 0,
                })
                .collect()
        })
    }

    /// Run until every row has succeeded or failed permanently.
    ///
    /// Rows a previous run gave up on are queued again first. When a required
    /// row fails permanently, every batch still submitted is cancelled before
    /// the error is returned.
    #[tracing::instrument(skip(self, shards), fields(working_dir = %self.files.working_dir().display()))]
    pub async fn run(&self, shards: &[RequestShard]) -> Result<RunStats> {
        let mut tracker = self.load_tracker(shards)?;
        self.requeue_failed_rows(&mut tracker, shards)?;
        let initial = self.terminal_rows(shards)?;
        self.progress.on_start(tracker.n_total_requests(), initial.len());

        if let Err(e) = self.drive(&mut tracker).await {
            if matches!(e, BarrageError::RequiredResponsesMissing { .. }) {
                tracing::error!(
                    error = %e,
                    submitted = tracker.submitted_batches.len(),
                    "Cancelling outstanding batches"
                );
                self.cancel(&mut tracker).await?;
            }
            return Err(e);
        }

        let stats = self.collect_stats(shards, &initial, tracker.n_total_requests())?;
        tracing::info!(
            succeeded = tracker.n_succeeded_requests,
            permanently_failed = tracker.n_permanently_failed_requests,
            downloaded_batches = tracker.downloaded_batches.len(),
            "Batch run complete"
        );
        self.progress.on_finish(&stats);
        Ok(stats)
    }

    async fn drive(&self, tracker: &mut BatchStatusTracker) -> Result<()> {
        loop {
            if self.cancellation.is_cancelled() {
                self.cancel(tracker).await?;
                return Err(BarrageError::Cancelled);
            }

            self.submit_pending(tracker).await?;
            if !tracker.has_outstanding_work() {
                return Ok(());
            }

            self.poll_once(tracker).await?;
            if !tracker.has_outstanding_work() {
                return Ok(());
            }

            tracing::debug!(
                submitted = tracker.submitted_batches.len(),
                pending = tracker.pending_request_files.len(),
                in_progress = tracker.n_in_progress_requests(),
                "Waiting for batches"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.cancellation.cancelled() => {}
            }
        }
    }

    /// Queue rows that failed permanently in an earlier run for another round of attempts.
    ///
    /// Their failure lines are dropped from the response files and from
    /// `failed_requests.jsonl`. Rows of pending or submitted request files are
    /// left alone. Returns the number of rows queued.
    pub fn requeue_failed_rows(
        &self,
        tracker: &mut BatchStatusTracker,
        shards: &[RequestShard],
    ) -> Result<usize> {
        let mut outstanding = HashSet::new();
        let outstanding_files = tracker
            .pending_request_files
            .iter()
            .map(|pending| pending.path.clone())
            .chain(
                tracker
                    .submitted_batches
                    .values()
                    .map(|batch| batch.request_file.clone()),
            )
            .collect::<Vec<_>>();
        for path in outstanding_files {
            outstanding.extend(read_requests(&path)?.iter().map(|r| r.original_row_idx));
        }

        let mut requeued = HashSet::new();
        for shard in shards {
            let lines = read_responses(&shard.response_file)?;
            let succeeded: HashSet<RowIndex> = lines
                .iter()
                .filter(|line| line.is_success())
                .map(GenericResponse::row_idx)
                .collect();
            let failed: HashSet<RowIndex> = lines
                .iter()
                .map(GenericResponse::row_idx)
                .filter(|row| !succeeded.contains(row) && !outstanding.contains(row))
                .collect();

            if !failed.is_empty() {
                let requests: Vec<GenericRequest> = read_requests(&shard.request_file)?
                    .into_iter()
                    .filter(|r| failed.contains(&r.original_row_idx))
                    .collect();
                let path = self.next_retry_file(shard.shard);
                write_request_file(&path, &requests)?;
                tracing::info!(
                    shard = shard.shard,
                    rows = requests.len(),
                    path = %path.display(),
                    "Retrying rows that failed in an earlier run"
                );
                tracker.requeue_failed(
                    PendingRequestFile {
                        path,
                        shard: shard.shard,
                        attempt: 0,
                    },
                    failed.len(),
                )?;
                requeued.extend(failed);
            }
            reconcile_responses(&shard.response_file)?;
        }

        let failed_file = self.files.failed_requests_file();
        if !requeued.is_empty() && failed_file.exists() {
            let still_failed: Vec<GenericRequest> = read_requests(&failed_file)?
                .into_iter()
                .filter(|r| !requeued.contains(&r.original_row_idx))
                .collect();
            write_request_file(&failed_file, &still_failed)?;
        }
        Ok(requeued.len())
    }

    fn next_retry_file(&self, shard: usize) -> PathBuf {
        let mut n = 0;
        loop {
            let path = self.files.retry_file(shard, n);
            if !path.exists() {
                return path;
            }
            n += 1;
        }
    }

    /// Submit pending request files, up to `max_submitted_batches` at a time.
    ///
    /// Returns the number of batches submitted.
    pub async fn submit_pending(&self, tracker: &mut BatchStatusTracker) -> Result<usize> {
        let mut submitted = 0;
        for pending in tracker.pending_request_files.clone() {
            if self
                .config
                .max_submitted_batches
                .is_some_and(|cap| tracker.submitted_batches.len() >= cap)
            {
                break;
            }

            if pending.attempt > 0 {
                tracing::info!(
                    "Request file {} is being re-submitted.",
                    pending.path.display()
                );
            }

            let requests = read_requests(&pending.path)?;
            let batch_id = match self.backend.submit(&requests, &pending.path).await {
                Ok(id) => id,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        path = %pending.path.display(),
                        error = %e,
                        "Batch submission failed, will retry on the next iteration"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            tracing::info!(
                batch_id = %batch_id,
                path = %pending.path.display(),
                requests = requests.len(),
                attempt = pending.attempt,
                "Submitted batch"
            );
            tracker.add_submitted_batch(BatchObject {
                id: batch_id,
                request_file: pending.path,
                shard: pending.shard,
                attempt: pending.attempt,
                request_counts: crate::tracker::RequestCounts::in_progress(requests.len()),
                submitted_at: Utc::now(),
                finished_at: None,
            })?;
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Poll every submitted batch once, downloading or resubmitting as needed.
    pub async fn poll_once(&self, tracker: &mut BatchStatusTracker) -> Result<()> {
        for batch in tracker.submitted_batches.values().cloned().collect::<Vec<_>>() {
            match self.backend.poll(&batch.id).await {
                Ok(poll) => match poll.status {
                    RemoteBatchStatus::Completed => {
                        let results = match self.backend.download(&batch.id).await {
                            Ok(results) => results,
                            Err(BackendError::UnknownBatch(_)) => {
                                self.handle_lost(tracker, &batch, "unknown to backend")
                                    .await?;
                                continue;
                            }
                            Err(e) if e.is_retryable() => {
                                tracing::warn!(batch_id = %batch.id, error = %e, "Download failed, will retry");
                                continue;
                            }
                            Err(e) => return Err(e.into()),
                        };
                        self.handle_download(tracker, &batch, results).await?;
                    }
                    status if status.is_lost() => {
                        self.handle_lost(tracker, &batch, &format!("{status:?}"))
                            .await?;
                    }
                    _ => {
                        tracker.record_counts(&batch.id, poll.request_counts)?;
                        self.check_wait(&batch)?;
                    }
                },
                Err(BackendError::UnknownBatch(_)) => {
                    self.handle_lost(tracker, &batch, "unknown to backend")
                        .await?;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(batch_id = %batch.id, error = %e, "Poll failed, will retry");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Cancel every submitted batch remotely and return its request file to pending.
    ///
    /// Response lines already written are left untouched.
    pub async fn cancel(&self, tracker: &mut BatchStatusTracker) -> Result<()> {
        tracing::info!("Cancelling batches");
        for batch_id in tracker.submitted_batch_ids() {
            match self.backend.cancel(&batch_id).await {
                Ok(()) => tracing::info!(batch_id = %batch_id, "Cancelled batch"),
                Err(BackendError::UnknownBatch(_)) => {
                    tracing::warn!(batch_id = %batch_id, "Batch unknown to backend, dropping it");
                }
                Err(e) => {
                    tracing::warn!(batch_id = %batch_id, error = %e, "Failed to cancel batch");
                    continue;
                }
            }
            tracker.mark_cancelled(&batch_id)?;
        }
        Ok(())
    }

    /// Cancel the submitted batches of an existing run, if it has a tracker.
    pub async fn cancel_batches(&self) -> Result<()> {
        let path = self.files.tracker_file();
        if !path.exists() {
            tracing::info!(path = %path.display(), "No batch tracker found, nothing to cancel");
            return Ok(());
        }
        let mut tracker = BatchStatusTracker::load(&path)?;
        self.cancel(&mut tracker).await
    }

    fn check_wait(&self, batch: &BatchObject) -> Result<()> {
        let Some(max_wait) = self.config.max_batch_wait else {
            return Ok(());
        };
        let waited = (Utc::now() - batch.submitted_at)
            .to_std()
            .unwrap_or_default();
        if waited >= max_wait {
            tracing::error!(
                batch_id = %batch.id,
                waited_secs = waited.as_secs(),
                "Batch exceeded its maximum wait"
            );
            return Err(BarrageError::BatchTimedOut {
                batch_id: batch.id.clone(),
                waited_secs: waited.as_secs(),
            });
        }
        Ok(())
    }

    async fn handle_download(
        &self,
        tracker: &mut BatchStatusTracker,
        batch: &BatchObject,
        results: Vec<BatchItemResult>,
    ) -> Result<()> {
        let response_file = self.files.response_file(batch.shard);
        let already_written = terminal_rows(&response_file)?;
        let mut remaining: BTreeMap<RowIndex, GenericRequest> = read_requests(&batch.request_file)?
            .into_iter()
            .map(|r| (r.original_row_idx, r))
            .collect();

        let mut writer = ResponseWriter::open(&response_file).await?;
        let mut succeeded = 0;
        let mut failures = Vec::new();
        let mut invalid_finish: HashMap<String, usize> = HashMap::new();

        for result in results {
            let Some(request) = remaining.remove(&result.original_row_idx) else {
                tracing::warn!(
                    batch_id = %batch.id,
                    row_idx = result.original_row_idx,
                    "Ignoring result for a row not in this batch"
                );
                continue;
            };
            match result.outcome {
                BatchItemOutcome::Succeeded(response)
                    if is_invalid_finish_reason(
                        response.finish_reason.as_deref(),
                        &self.invalid_finish_reasons,
                    ) =>
                {
                    let reason = response.finish_reason.unwrap_or_default();
                    *invalid_finish.entry(reason.clone()).or_default() += 1;
                    failures.push((request, format!("invalid finish reason: {reason}")));
                }
                BatchItemOutcome::Succeeded(response) => {
                    succeeded += 1;
                    if !already_written.contains(&request.original_row_idx) {
                        let line = success_response(request, response, batch.submitted_at);
                        writer.write(&line).await?;
                        self.progress.on_response(&line);
                    }
                }
                BatchItemOutcome::Errored(error) => failures.push((request, error)),
            }
        }
        for (_, request) in remaining {
            failures.push((request, "missing from batch results".to_string()));
        }

        if !invalid_finish.is_empty() {
            tracing::warn!("Invalid finish responses: {:?}", invalid_finish);
        }

        let mut outcome = DownloadOutcome {
            succeeded,
            failed: failures.len(),
            ..Default::default()
        };
        if !failures.is_empty() {
            if batch.attempt < self.config.max_retries {
                tracing::warn!(
                    "Batch {} has failed requests. Tagging for resubmission.",
                    batch.id
                );
            } else {
                tracing::warn!(
                    "Batch {} has failed requests with no attempts left.",
                    batch.id
                );
            }
            let (resubmit, permanently_failed) = self
                .settle_failures(batch, failures, &already_written, &mut writer)
                .await?;
            outcome.resubmit = resubmit;
            outcome.permanently_failed = permanently_failed;
        }

        tracing::info!(
            batch_id = %batch.id,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            permanently_failed = outcome.permanently_failed,
            "Downloaded batch"
        );
        let permanently_failed = outcome.permanently_failed;
        tracker.mark_downloaded(&batch.id, outcome)?;
        self.enforce_required(tracker, permanently_failed)
    }

    async fn handle_lost(
        &self,
        tracker: &mut BatchStatusTracker,
        batch: &BatchObject,
        reason: &str,
    ) -> Result<()> {
        tracing::warn!(
            batch_id = %batch.id,
            reason,
            path = %batch.request_file.display(),
            "Batch will produce no results"
        );
        let response_file = self.files.response_file(batch.shard);
        let already_written = terminal_rows(&response_file)?;
        let failures = read_requests(&batch.request_file)?
            .into_iter()
            .map(|r| (r, format!("batch {} {reason}", batch.id)))
            .collect();

        let mut writer = ResponseWriter::open(&response_file).await?;
        let (resubmit, permanently_failed) = self
            .settle_failures(batch, failures, &already_written, &mut writer)
            .await?;
        tracker.mark_lost(&batch.id, permanently_failed, resubmit)?;
        self.enforce_required(tracker, permanently_failed)
    }

    /// Write failed rows to a resubmission file while attempts remain,
    /// otherwise record them as permanent failures.
    async fn settle_failures(
        &self,
        batch: &BatchObject,
        failures: Vec<(GenericRequest, String)>,
        already_written: &HashSet<RowIndex>,
        writer: &mut ResponseWriter,
    ) -> Result<(Option<PendingRequestFile>, usize)> {
        if batch.attempt < self.config.max_retries {
            let attempt = batch.attempt + 1;
            let path = self.files.resubmit_file(batch.shard, attempt);
            let requests: Vec<GenericRequest> = failures.into_iter().map(|(r, _)| r).collect();
            write_request_file(&path, &requests)?;
            tracing::info!(
                batch_id = %batch.id,
                rows = requests.len(),
                attempt,
                path = %path.display(),
                "Wrote resubmission request file"
            );
            return Ok((
                Some(PendingRequestFile {
                    path,
                    shard: batch.shard,
                    attempt,
                }),
                0,
            ));
        }

        let permanently_failed = failures.len();
        let mut failed_requests = Vec::new();
        for (request, error) in failures {
            if already_written.contains(&request.original_row_idx) {
                continue;
            }
            tracing::error!(
                row_idx = request.original_row_idx,
                attempts = batch.attempt + 1,
                error = %error,
                "Request failed permanently"
            );
            failed_requests.push(request.clone());
            let line = GenericResponse::failed(request, vec![error], batch.submitted_at);
            writer.write(&line).await?;
            self.progress.on_response(&line);
        }
        append_failed_requests(&self.files.failed_requests_file(), &failed_requests)?;
        Ok((None, permanently_failed))
    }

    fn enforce_required(&self, tracker: &BatchStatusTracker, newly_failed: usize) -> Result<()> {
        if self.require_all_responses && newly_failed > 0 {
            return Err(BarrageError::RequiredResponsesMissing {
                failed: tracker.n_permanently_failed_requests,
                total: tracker.n_total_requests(),
            });
        }
        Ok(())
    }

    fn terminal_rows(&self, shards: &[RequestShard]) -> Result<HashSet<RowIndex>> {
        let mut rows = HashSet::new();
        for shard in shards {
            rows.extend(terminal_rows(&shard.response_file)?);
        }
        Ok(rows)
    }

    /// Stats for lines written since the run started.
    fn collect_stats(
        &self,
        shards: &[RequestShard],
        initial: &HashSet<RowIndex>,
        total: usize,
    ) -> Result<RunStats> {
        let mut stats = RunStats::new(total, initial.len());
        for shard in shards {
            for line in read_responses(&shard.response_file)? {
                if !initial.contains(&line.row_idx()) {
                    stats.record(&line);
                }
            }
        }
        Ok(stats)
    }
}
