//! Request-processing engine for model-generated datasets.
//!
//! This crate turns a set of input records into a dataset of model outputs:
//! - Formats each record into a chat request and persists the requests as JSONL
//! - Dispatches them online (rate limited), through a remote batch API, or to a local engine
//! - Retries failures and resumes interrupted runs from what is already on disk
//! - Caches the parsed output dataset under a content hash of its inputs
//!
//! # Example
//! ```ignore
//! use barrage::{Backend, Engine, EngineConfig, OpenAiCompatibleBackend};
//! use barrage::prompt::{DefaultParser, FnFormatter};
//!
//! let config = EngineConfig::load(Some("barrage.yaml".as_ref()))?;
//! let backend = Arc::new(OpenAiCompatibleBackend::new(base_url, api_key));
//! let engine = Engine::new(config, Backend::Online(backend))?;
//!
//! let formatter = FnFormatter::new("recipe-v1", |row| {
//!     Ok(vec![ChatMessage::user(format!("Write a recipe for {}", row["dish"]))])
//! });
//! let dataset = engine.run(&records, &formatter, &DefaultParser).await?;
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod files;
pub mod hash;
pub mod progress;
pub mod prompt;
pub mod rate_limit;
pub mod request;
pub mod telemetry;
pub mod tracker;

#[cfg(test)]
mod test;

// Re-export commonly used types
pub use backend::{
    AsyncBatchBackend, Backend, BackendError, BackendResponse, LocalBackend,
    OpenAiCompatibleBackend, SyncBackend,
};
pub use cache::{CacheManager, Dataset};
pub use config::{BatchConfig, EngineConfig, OfflineConfig, OnlineConfig};
pub use dispatch::{BatchDispatcher, OfflineDispatcher, OnlineDispatcher};
pub use engine::Engine;
pub use error::{BarrageError, Result};
pub use progress::{ProgressObserver, RunStats};
pub use prompt::{DefaultParser, FnFormatter, FnParser, RequestFormatter, ResponseParser};
pub use request::*;
pub use tracker::BatchStatusTracker;
