//! Progress reporting.
//!
//! Dispatchers report through a [`ProgressObserver`]; engines behave the same
//! whichever observer is installed.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::request::GenericResponse;

/// Summary of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Rows covered by the dispatch
    pub total: usize,
    /// Rows skipped because an earlier run already answered them
    pub already_completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RunStats {
    pub fn new(total: usize, already_completed: usize) -> Self {
        Self {
            total,
            already_completed,
            ..Default::default()
        }
    }

    /// Account for one terminal response.
    pub fn record(&mut self, response: &GenericResponse) {
        if response.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        if let Some(usage) = response.token_usage {
            self.input_tokens += usage.input;
            self.output_tokens += usage.output;
        }
    }

    /// Add the stats of another dispatch (e.g. another shard).
    pub fn merge(&mut self, other: &RunStats) {
        self.total += other.total;
        self.already_completed += other.already_completed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    /// Rows with a terminal response, including earlier runs.
    pub fn finished(&self) -> usize {
        self.already_completed + self.succeeded + self.failed
    }
}

/// Receives progress events from a dispatcher.
pub trait ProgressObserver: Send + Sync {
    fn on_start(&self, _total: usize, _already_completed: usize) {}

    fn on_response(&self, _response: &GenericResponse) {}

    fn on_finish(&self, _stats: &RunStats) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}

/// Logs progress through tracing, roughly every tenth of the run.
#[derive(Debug, Default)]
pub struct TracingProgress {
    total: AtomicUsize,
    done: AtomicUsize,
}

impl TracingProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressObserver for TracingProgress {
    fn on_start(&self, total: usize, already_completed: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.done.store(already_completed, Ordering::Relaxed);
        tracing::info!(total, already_completed, "Dispatch started");
    }

    fn on_response(&self, _response: &GenericResponse) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total.load(Ordering::Relaxed);
        let step = (total / 10).max(1);
        if done % step == 0 || done == total {
            tracing::info!(done, total, "Progress");
        }
    }

    fn on_finish(&self, stats: &RunStats) {
        tracing::info!(
            total = stats.total,
            already_completed = stats.already_completed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            input_tokens = stats.input_tokens,
            output_tokens = stats.output_tokens,
            "Final statistics"
        );
    }
}
