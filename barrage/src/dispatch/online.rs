//! Online dispatcher for synchronous backends.
//!
//! A single coordinating loop owns the admission queue, both rate budgets, the
//! global cooldown and the response writer. Attempts run as tasks in a
//! [`JoinSet`] and report back only a task id and the backend result; retry
//! bookkeeping on [`ApiRequest`] is never touched outside the coordinator.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;

use super::success_response;
use crate::backend::{BackendError, BackendResponse, SyncBackend};
use crate::config::OnlineConfig;
use crate::error::{BarrageError, Result};
use crate::files::{read_requests, reconcile_responses, ResponseWriter};
use crate::progress::{NoopProgress, ProgressObserver, RunStats};
use crate::rate_limit::{Cooldown, RateLimiter};
use crate::request::{
    is_invalid_finish_reason, ApiRequest, GenericRequest, GenericResponse, RetryDecision,
};

type AttemptResult = (usize, std::result::Result<BackendResponse, BackendError>);

/// Drives one request file through a [`SyncBackend`].
pub struct OnlineDispatcher {
    backend: Arc<dyn SyncBackend>,
    config: OnlineConfig,
    invalid_finish_reasons: Vec<String>,
    progress: Arc<dyn ProgressObserver>,
    cancellation: CancellationToken,
}

impl OnlineDispatcher {
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        mut config: OnlineConfig,
        invalid_finish_reasons: Vec<String>,
    ) -> Self {
        if config.max_concurrent_requests == 0 {
            tracing::warn!("max_concurrent_requests is 0, using 1");
            config.max_concurrent_requests = 1;
        }
        Self {
            backend,
            config,
            invalid_finish_reasons,
            progress: Arc::new(NoopProgress),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    /// Stop admitting new attempts once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Dispatch every request of `request_file` that has no successful line in
    /// `response_file` yet.
    ///
    /// Returns [`BarrageError::Cancelled`] if cancellation left rows unanswered.
    /// In-flight attempts are always drained and written first.
    #[tracing::instrument(skip(self), fields(request_file = %request_file.display()))]
    pub async fn run(&self, request_file: &Path, response_file: &Path) -> Result<RunStats> {
        let requests = read_requests(request_file)?;
        let completed = reconcile_responses(response_file)?;

        let total = requests.len();
        let already_completed = requests
            .iter()
            .filter(|r| completed.contains(&r.original_row_idx))
            .count();
        if already_completed > 0 {
            tracing::info!("Already Completed: {}", already_completed);
        }

        let queue: VecDeque<ApiRequest> = requests
            .into_iter()
            .filter(|r| !completed.contains(&r.original_row_idx))
            .enumerate()
            .map(|(task_id, r)| ApiRequest::new(task_id, r, self.config.max_retries))
            .collect();

        self.progress.on_start(total, already_completed);

        let now = Instant::now();
        let mut coordinator = Coordinator {
            queue,
            in_flight: HashMap::new(),
            limiter: RateLimiter::new(
                self.config.max_requests_per_minute,
                self.config.max_tokens_per_minute,
                now,
            ),
            cooldown: Cooldown::new(self.config.rate_limit_cooldown),
            writer: ResponseWriter::open(response_file).await?,
            stats: RunStats::new(total, already_completed),
            invalid_finish_reasons: &self.invalid_finish_reasons,
            max_attempts: self.config.max_retries + 1,
            default_max_output_tokens: self.config.default_max_output_tokens,
            progress: self.progress.as_ref(),
        };

        let mut join_set: JoinSet<AttemptResult> = JoinSet::new();
        let mut status = self
            .config
            .status_log_interval
            .map(|period| tokio::time::interval_at(now + period, period));
        let mut cancelled = self.cancellation.is_cancelled();

        loop {
            if join_set.is_empty() && (cancelled || coordinator.queue.is_empty()) {
                break;
            }

            let now = Instant::now();
            let admit_delay = if !cancelled && join_set.len() < self.config.max_concurrent_requests
            {
                coordinator.admit_delay(now)
            } else {
                None
            };

            if admit_delay == Some(Duration::ZERO) {
                if let Some((task_id, request)) = coordinator.admit(now) {
                    let backend = self.backend.clone();
                    join_set.spawn(async move { (task_id, backend.execute(&request).await) });
                }
                continue;
            }

            tokio::select! {
                joined = join_set.join_next(), if !join_set.is_empty() => {
                    match joined {
                        Some(Ok((task_id, result))) => coordinator.complete(task_id, result).await?,
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Request task panicked");
                            return Err(anyhow::anyhow!("request task failed: {e}").into());
                        }
                        None => {}
                    }
                }
                _ = tokio::time::sleep(admit_delay.unwrap_or_default()), if admit_delay.is_some() => {}
                _ = self.cancellation.cancelled(), if !cancelled => {
                    cancelled = true;
                    tracing::warn!(
                        in_flight = join_set.len(),
                        queued = coordinator.queue.len(),
                        "Cancellation requested, draining in-flight requests"
                    );
                }
                _ = tick(&mut status) => {
                    tracing::info!(
                        in_flight = join_set.len(),
                        queued = coordinator.queue.len(),
                        succeeded = coordinator.stats.succeeded,
                        failed = coordinator.stats.failed,
                        "Online dispatcher status"
                    );
                }
            }
        }

        let stats = coordinator.stats;
        self.progress.on_finish(&stats);

        if !coordinator.queue.is_empty() {
            tracing::warn!(
                unanswered = coordinator.queue.len(),
                "Online dispatch cancelled before every request finished"
            );
            return Err(BarrageError::Cancelled);
        }
        Ok(stats)
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// State owned by the coordinating loop of one dispatch.
struct Coordinator<'a> {
    queue: VecDeque<ApiRequest>,
    in_flight: HashMap<usize, ApiRequest>,
    limiter: RateLimiter,
    cooldown: Cooldown,
    writer: ResponseWriter,
    stats: RunStats,
    invalid_finish_reasons: &'a [String],
    max_attempts: u32,
    default_max_output_tokens: u32,
    progress: &'a dyn ProgressObserver,
}

impl Coordinator<'_> {
    /// How long until the head of the queue may start, or `None` if the queue is empty.
    fn admit_delay(&mut self, now: Instant) -> Option<Duration> {
        let tokens = self
            .queue
            .front()?
            .generic_request
            .estimate_tokens(self.default_max_output_tokens);
        let budget = self.limiter.time_until_admit(tokens, now);
        Some(self.cooldown.remaining(now).max(budget))
    }

    /// Start the next attempt, charging both budgets.
    fn admit(&mut self, now: Instant) -> Option<(usize, GenericRequest)> {
        let mut api_request = self.queue.pop_front()?;
        let tokens = api_request
            .generic_request
            .estimate_tokens(self.default_max_output_tokens);
        self.limiter.consume(tokens, now);
        api_request.attempt += 1;

        tracing::debug!(
            row_idx = api_request.row_idx(),
            attempt = api_request.attempt,
            estimated_tokens = tokens,
            "Admitting request"
        );

        let task_id = api_request.task_id;
        let request = api_request.generic_request.clone();
        self.in_flight.insert(task_id, api_request);
        Some((task_id, request))
    }

    async fn complete(
        &mut self,
        task_id: usize,
        result: std::result::Result<BackendResponse, BackendError>,
    ) -> Result<()> {
        let Some(mut api_request) = self.in_flight.remove(&task_id) else {
            tracing::warn!(task_id, "Ignoring result for unknown task");
            return Ok(());
        };

        let (message, retryable) = match result {
            Ok(response)
                if is_invalid_finish_reason(
                    response.finish_reason.as_deref(),
                    self.invalid_finish_reasons,
                ) =>
            {
                (
                    format!(
                        "invalid finish reason: {}",
                        response.finish_reason.unwrap_or_default()
                    ),
                    true,
                )
            }
            Ok(response) => {
                let line = success_response(
                    api_request.generic_request,
                    response,
                    api_request.created_at,
                );
                return self.finish(line).await;
            }
            Err(e) => {
                if e.is_rate_limit() {
                    self.cooldown.trigger(Instant::now());
                    tracing::warn!(
                        row_idx = api_request.row_idx(),
                        "Rate limited, pausing admissions for the cooldown window"
                    );
                }
                (e.to_string(), e.is_retryable())
            }
        };

        tracing::warn!(
            attempts_left = api_request.attempts_left,
            "Encountered '{}' during attempt {} of {} while processing request {}",
            message,
            api_request.attempt,
            self.max_attempts,
            api_request.row_idx()
        );

        if retryable {
            if api_request.record_failure(message) == RetryDecision::Retry {
                self.queue.push_back(api_request);
                return Ok(());
            }
        } else {
            api_request.errors.push(message);
        }

        tracing::error!(
            row_idx = api_request.row_idx(),
            attempts = api_request.attempt,
            "Request failed permanently"
        );
        let line = api_request.into_failed_response();
        self.finish(line).await
    }

    async fn finish(&mut self, line: GenericResponse) -> Result<()> {
        self.writer.write(&line).await?;
        self.stats.record(&line);
        self.progress.on_response(&line);
        Ok(())
    }
}
