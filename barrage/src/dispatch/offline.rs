//! Offline dispatcher for local inference engines.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::success_response;
use crate::backend::LocalBackend;
use crate::config::OfflineConfig;
use crate::error::{BarrageError, Result};
use crate::files::{read_requests, reconcile_responses, ResponseWriter};
use crate::progress::{NoopProgress, ProgressObserver, RunStats};
use crate::request::{is_invalid_finish_reason, GenericRequest, GenericResponse};

/// Feeds a request file to a [`LocalBackend`] in fixed-size chunks.
///
/// Per-row errors and invalid finish reasons are terminal; there is no remote
/// service to retry against. A backend-level error aborts the run, leaving
/// already written lines for the next run to skip.
pub struct OfflineDispatcher {
    backend: Arc<dyn LocalBackend>,
    config: OfflineConfig,
    invalid_finish_reasons: Vec<String>,
    progress: Arc<dyn ProgressObserver>,
    cancellation: CancellationToken,
}

impl OfflineDispatcher {
    pub fn new(
        backend: Arc<dyn LocalBackend>,
        config: OfflineConfig,
        invalid_finish_reasons: Vec<String>,
    ) -> Self {
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

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    #[tracing::instrument(skip(self), fields(request_file = %request_file.display()))]
    pub async fn run(&self, request_file: &Path, response_file: &Path) -> Result<RunStats> {
        let requests = read_requests(request_file)?;
        let completed = reconcile_responses(response_file)?;
        let total = requests.len();

        let remaining: Vec<GenericRequest> = requests
            .into_iter()
            .filter(|r| !completed.contains(&r.original_row_idx))
            .collect();
        let already_completed = total - remaining.len();
        if already_completed > 0 {
            tracing::info!("Already Completed: {}", already_completed);
        }

        self.progress.on_start(total, already_completed);
        let mut stats = RunStats::new(total, already_completed);
        let mut writer = ResponseWriter::open(response_file).await?;

        for chunk in remaining.chunks(self.config.batch_size.max(1)) {
            if self.cancellation.is_cancelled() {
                tracing::warn!("Offline dispatch cancelled");
                return Err(BarrageError::Cancelled);
            }

            let created_at = Utc::now();
            let results = self.backend.generate(chunk).await?;
            if results.len() != chunk.len() {
                return Err(anyhow::anyhow!(
                    "local backend returned {} results for {} requests",
                    results.len(),
                    chunk.len()
                )
                .into());
            }
            tracing::debug!(rows = chunk.len(), "Generated chunk");

            for (request, result) in chunk.iter().zip(results) {
                let line = match result {
                    Ok(response)
                        if is_invalid_finish_reason(
                            response.finish_reason.as_deref(),
                            &self.invalid_finish_reasons,
                        ) =>
                    {
                        GenericResponse::failed(
                            request.clone(),
                            vec![format!(
                                "invalid finish reason: {}",
                                response.finish_reason.unwrap_or_default()
                            )],
                            created_at,
                        )
                    }
                    Ok(response) => success_response(request.clone(), response, created_at),
                    Err(error) => {
                        tracing::warn!(row_idx = request.original_row_idx, error = %error, "Local generation failed");
                        GenericResponse::failed(request.clone(), vec![error], created_at)
                    }
                };
                writer.write(&line).await?;
                stats.record(&line);
                self.progress.on_response(&line);
            }
        }

        self.progress.on_finish(&stats);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockLocalBackend;
    use crate::files::requests::write_request_file;
    use crate::files::read_responses;
    use crate::request::{ChatMessage, RowIndex};
    use serde_json::json;
    use tempfile::TempDir;

    fn request(idx: RowIndex) -> GenericRequest {
        GenericRequest {
            model: "local".to_string(),
            messages: vec![ChatMessage::user(format!("row {idx}"))],
            generation_params: Default::default(),
            original_row: json!({}),
            original_row_idx: idx,
        }
    }

    #[tokio::test]
    async fn test_chunks_and_resume() {
        let dir = TempDir::new().unwrap();
        let request_file = dir.path().join("requests_0.jsonl");
        let response_file = dir.path().join("responses_0.jsonl");
        write_request_file(&request_file, &(0..5).map(request).collect::<Vec<_>>()).unwrap();

        let mock = MockLocalBackend::new();
        mock.fail_row(4, "out of memory");
        let dispatcher = OfflineDispatcher::new(
            Arc::new(mock.clone()),
            OfflineConfig { batch_size: 2 },
            Vec::new(),
        );

        let stats = dispatcher.run(&request_file, &response_file).await.unwrap();
        assert_eq!(mock.chunks(), vec![vec![0, 1], vec![2, 3], vec![4]]);
        assert_eq!(stats.succeeded, 4);
        assert_eq!(stats.failed, 1);

        // only the failed row is generated again
        let retry = MockLocalBackend::new();
        let stats = OfflineDispatcher::new(
            Arc::new(retry.clone()),
            OfflineConfig { batch_size: 2 },
            Vec::new(),
        )
        .run(&request_file, &response_file)
        .await
        .unwrap();

        assert_eq!(retry.chunks(), vec![vec![4]]);
        assert_eq!(stats.already_completed, 4);
        let lines = read_responses(&response_file).unwrap();
        assert_eq!(lines.len(), 5);
        assert!(lines.iter().all(GenericResponse::is_success));
    }
}
