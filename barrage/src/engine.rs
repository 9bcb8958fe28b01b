//! Run orchestration: hash, cache lookup, request files, dispatch, materialization.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::cache::{CacheManager, Dataset};
use crate::config::EngineConfig;
use crate::dispatch::{BatchDispatcher, OfflineDispatcher, OnlineDispatcher};
use crate::error::{BarrageError, Result};
use crate::files::{read_responses, RequestFileBuilder, RequestShard, RunFiles};
use crate::hash::{dataset_key, run_hash, RunIdentity};
use crate::progress::{NoopProgress, ProgressObserver, RunStats, TracingProgress};
use crate::prompt::{RequestFormatter, ResponseParser};
use crate::request::{GenericRequest, RowIndex};

/// Entry point for processing a record set with one backend.
pub struct Engine {
    config: EngineConfig,
    backend: Backend,
    cache: CacheManager,
    progress: Arc<dyn ProgressObserver>,
    cancellation: CancellationToken,
}

impl Engine {
    pub fn new(config: EngineConfig, backend: Backend) -> Result<Self> {
        config.validate()?;
        let progress: Arc<dyn ProgressObserver> = if config.progress_logging {
            Arc::new(TracingProgress::new())
        } else {
            Arc::new(NoopProgress)
        };
        Ok(Self {
            cache: CacheManager::new(&config.cache_dir),
            config,
            backend,
            progress,
            cancellation: CancellationToken::new(),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    /// Token that cancels runs of this engine.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Hash identifying the run of `records` through `formatter` on this engine.
    pub fn run_hash(&self, records: &[Value], formatter: &dyn RequestFormatter) -> Result<String> {
        let fingerprint = formatter.fingerprint();
        run_hash(RunIdentity {
            formatter_fingerprint: &fingerprint,
            model: &self.config.model,
            generation_params: &self.config.generation_params,
            strategy: self.backend.strategy(),
            records,
        })
    }

    /// Files of the run with the given hash.
    pub fn run_files(&self, run_hash: &str) -> RunFiles {
        RunFiles::new(self.cache.working_dir(run_hash))
    }

    /// Process `records`, returning the parsed output rows.
    ///
    /// A cached dataset for the same inputs and parser is returned without any
    /// dispatch. Otherwise the run resumes from whatever its working directory
    /// already holds.
    #[tracing::instrument(skip_all, fields(run_id = %uuid::Uuid::new_v4(), records = records.len(), strategy = self.backend.strategy()))]
    pub async fn run(
        &self,
        records: &[Value],
        formatter: &dyn RequestFormatter,
        parser: &dyn ResponseParser,
    ) -> Result<Dataset> {
        let hash = self.run_hash(records, formatter)?;
        let key = dataset_key(&hash, &parser.fingerprint());

        if let Some(dataset) = self.cache.lookup(&key)? {
            tracing::info!("Using cached output dataset.");
            return Ok(dataset);
        }

        tracing::info!(run_hash = %hash, "Preparing request files");
        let files = self.run_files(&hash);
        let shard_size = match self.backend {
            Backend::Batch(_) => Some(self.config.batch.batch_size),
            _ => None,
        };
        let shards = RequestFileBuilder::new(files.clone(), shard_size)
            .prepare(records.len(), |idx| self.build_request(idx, &records[idx], formatter))?;

        let stats = self.dispatch(&files, &shards).await?;
        tracing::debug!(?stats, "Dispatch finished");

        let dataset = materialize(&shards, parser)?;
        let missing = records.len().saturating_sub(dataset.len());
        if self.config.require_all_responses && missing > 0 {
            return Err(BarrageError::RequiredResponsesMissing {
                failed: missing,
                total: records.len(),
            });
        }
        if missing > 0 {
            tracing::warn!(
                missing,
                total = records.len(),
                "Some rows have no output and are left out of the dataset"
            );
        }

        self.cache.store(&key, &dataset)?;
        Ok(dataset)
    }

    /// Cancel the remote batches of the run of `records` through `formatter`.
    pub async fn cancel_batches(
        &self,
        records: &[Value],
        formatter: &dyn RequestFormatter,
    ) -> Result<()> {
        let Backend::Batch(backend) = &self.backend else {
            return Err(BarrageError::Config(
                "cancelling batches requires a batch backend".to_string(),
            ));
        };
        let hash = self.run_hash(records, formatter)?;
        BatchDispatcher::new(
            backend.clone(),
            self.config.batch.clone(),
            self.run_files(&hash),
            self.config.invalid_finish_reasons.clone(),
        )
        .cancel_batches()
        .await
    }

    fn build_request(
        &self,
        idx: RowIndex,
        row: &Value,
        formatter: &dyn RequestFormatter,
    ) -> Result<GenericRequest> {
        let messages = formatter
            .format(row)
            .map_err(|e| e.context(format!("failed to format row {idx}")))?;
        Ok(GenericRequest {
            model: self.config.model.clone(),
            messages,
            generation_params: self.config.generation_params.clone(),
            original_row: row.clone(),
            original_row_idx: idx,
        })
    }

    async fn dispatch(&self, files: &RunFiles, shards: &[RequestShard]) -> Result<RunStats> {
        let invalid = self.config.invalid_finish_reasons.clone();
        match &self.backend {
            Backend::Online(backend) => {
                let dispatcher =
                    OnlineDispatcher::new(backend.clone(), self.config.online.clone(), invalid)
                        .with_progress(self.progress.clone())
                        .with_cancellation(self.cancellation.clone());
                let mut stats = RunStats::default();
                for shard in shards {
                    stats.merge(
                        &dispatcher
                            .run(&shard.request_file, &shard.response_file)
                            .await?,
                    );
                }
                Ok(stats)
            }
            Backend::Batch(backend) => {
                BatchDispatcher::new(
                    backend.clone(),
                    self.config.batch.clone(),
                    files.clone(),
                    invalid,
                )
                .require_all_responses(self.config.require_all_responses)
                .with_progress(self.progress.clone())
                .with_cancellation(self.cancellation.clone())
                .run(shards)
                .await
            }
            Backend::Offline(backend) => {
                let dispatcher =
                    OfflineDispatcher::new(backend.clone(), self.config.offline.clone(), invalid)
                        .with_progress(self.progress.clone())
                        .with_cancellation(self.cancellation.clone());
                let mut stats = RunStats::default();
                for shard in shards {
                    stats.merge(
                        &dispatcher
                            .run(&shard.request_file, &shard.response_file)
                            .await?,
                    );
                }
                Ok(stats)
            }
        }
    }
}

/// Join successful responses back to row order and parse them.
pub fn materialize(shards: &[RequestShard], parser: &dyn ResponseParser) -> Result<Dataset> {
    let mut by_row = BTreeMap::new();
    for shard in shards {
        for response in read_responses(&shard.response_file)? {
            if response.is_success() {
                by_row.entry(response.row_idx()).or_insert(response);
            }
        }
    }

    let mut dataset = Dataset::default();
    for (row_idx, response) in by_row {
        let message = response.response_message.unwrap_or(Value::Null);
        match parser.parse(&response.generic_request.original_row, &message) {
            Ok(row) => {
                dataset.row_indices.push(row_idx);
                dataset.rows.push(row);
            }
            Err(e) => tracing::warn!(row_idx, error = %e, "Failed to parse response, skipping row"),
        }
    }
    Ok(dataset)
}
