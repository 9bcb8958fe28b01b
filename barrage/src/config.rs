//! Engine configuration.
//!
//! Loaded with figment from an optional YAML file, then overridden by
//! environment variables prefixed with `BARRAGE_`. Nested keys use `__`:
//!
//! ```bash
//! BARRAGE_MODEL=gpt-4o-mini
//! BARRAGE_ONLINE__MAX_REQUESTS_PER_MINUTE=500
//! BARRAGE_BATCH__POLL_INTERVAL=30s
//! ```
//!
//! Durations accept humantime strings (`"15s"`, `"2m"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BarrageError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory holding run working directories and cached datasets
    pub cache_dir: PathBuf,

    /// Model identifier sent with every request
    pub model: String,

    /// Generation parameters forwarded verbatim to the backend
    pub generation_params: Map<String, Value>,

    /// Fail the run if any row fails permanently
    pub require_all_responses: bool,

    /// Finish reasons that make an otherwise successful response invalid
    pub invalid_finish_reasons: Vec<String>,

    /// Emit progress events through tracing
    pub progress_logging: bool,

    pub online: OnlineConfig,
    pub batch: BatchConfig,
    pub offline: OfflineConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(".cache/barrage"),
            model: String::new(),
            generation_params: Map::new(),
            require_all_responses: false,
            invalid_finish_reasons: vec!["content_filter".to_string(), "length".to_string()],
            progress_logging: true,
            online: OnlineConfig::default(),
            batch: BatchConfig::default(),
            offline: OfflineConfig::default(),
        }
    }
}

/// Online (synchronous) dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OnlineConfig {
    /// Requests-per-minute budget; unlimited when unset
    pub max_requests_per_minute: Option<u64>,

    /// Tokens-per-minute budget; unlimited when unset
    pub max_tokens_per_minute: Option<u64>,

    /// Ceiling on concurrently in-flight requests
    pub max_concurrent_requests: usize,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Global pause after a rate-limit error
    #[serde(with = "humantime_serde")]
    pub rate_limit_cooldown: Duration,

    /// Interval for logging dispatcher status. Set to None to disable
    #[serde(with = "humantime_serde")]
    pub status_log_interval: Option<Duration>,

    /// Output tokens assumed when a request sets no `max_tokens`
    pub default_max_output_tokens: u32,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: None,
            max_tokens_per_minute: None,
            max_concurrent_requests: 100,
            max_retries: 5,
            rate_limit_cooldown: Duration::from_secs(15),
            status_log_interval: Some(Duration::from_secs(30)),
            default_max_output_tokens: 1024,
        }
    }
}

/// Asynchronous batch dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Requests per request file, and so per submitted batch
    pub batch_size: usize,

    /// Resubmission rounds allowed for a failed row
    pub max_retries: u32,

    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Longest a batch may stay submitted before the run fails
    #[serde(with = "humantime_serde")]
    pub max_batch_wait: Option<Duration>,

    /// Cap on batches submitted at the same time; unlimited when unset
    pub max_submitted_batches: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            max_retries: 3,
            poll_interval: Duration::from_secs(60),
            max_batch_wait: None,
            max_submitted_batches: None,
        }
    }
}

/// Local (offline) dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct OfflineConfig {
    /// Requests handed to the local engine per call
    pub batch_size: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self { batch_size: 64 }
    }
}

impl EngineConfig {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> std::result::Result<Self, figment::Error> {
        Self::figment(path).extract()
    }

    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment.merge(Env::prefixed("BARRAGE_").split("__"))
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(BarrageError::Config("model must not be empty".to_string()));
        }
        if self.online.max_concurrent_requests == 0 {
            return Err(BarrageError::Config(
                "online.max_concurrent_requests must be at least 1".to_string(),
            ));
        }
        if self.batch.batch_size == 0 {
            return Err(BarrageError::Config(
                "batch.batch_size must be at least 1".to_string(),
            ));
        }
        if self.offline.batch_size == 0 {
            return Err(BarrageError::Config(
                "offline.batch_size must be at least 1".to_string(),
            ));
        }
        if self.batch.max_submitted_batches == Some(0) {
            return Err(BarrageError::Config(
                "batch.max_submitted_batches must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.invalid_finish_reasons, vec!["content_filter", "length"]);
        assert!(!config.require_all_responses);
        assert_eq!(config.online.rate_limit_cooldown, Duration::from_secs(15));
    }

    #[test]
    fn test_yaml_and_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "barrage.yaml",
                r#"
model: gpt-test
generation_params:
  temperature: 0.2
online:
  max_requests_per_minute: 500
  rate_limit_cooldown: 30s
batch:
  poll_interval: 5s
  max_batch_wait: 1h
"#,
            )?;
            jail.set_env("BARRAGE_ONLINE__MAX_RETRIES", "3");
            jail.set_env("BARRAGE_REQUIRE_ALL_RESPONSES", "true");

            let config = EngineConfig::load(Some(Path::new("barrage.yaml")))?;

            assert_eq!(config.model, "gpt-test");
            assert_eq!(config.generation_params["temperature"], serde_json::json!(0.2));
            assert_eq!(config.online.max_requests_per_minute, Some(500));
            assert_eq!(config.online.rate_limit_cooldown, Duration::from_secs(30));
            assert_eq!(config.online.max_retries, 3);
            assert_eq!(config.batch.poll_interval, Duration::from_secs(5));
            assert_eq!(config.batch.max_batch_wait, Some(Duration::from_secs(3600)));
            assert!(config.require_all_responses);
            // untouched sections keep their defaults
            assert_eq!(config.offline, OfflineConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("barrage.yaml", "online:\n  max_retry: 3\n")?;
            assert!(EngineConfig::load(Some(Path::new("barrage.yaml"))).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validate() {
        let mut config = EngineConfig {
            model: "gpt-test".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.online.max_concurrent_requests = 0;
        assert!(matches!(config.validate(), Err(BarrageError::Config(_))));

        config.online.max_concurrent_requests = 1;
        config.batch.batch_size = 0;
        assert!(config.validate().is_err());

        config.batch.batch_size = 1;
        config.model = " ".to_string();
        assert!(config.validate().is_err());
    }
}
