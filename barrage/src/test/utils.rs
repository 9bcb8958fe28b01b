use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::subscriber::DefaultGuard;

use crate::config::EngineConfig;
use crate::prompt::FnFormatter;
use crate::request::ChatMessage;

/// Records `{"dish": "dish <i>"}` for `0..n`.
pub fn create_test_records(n: usize) -> Vec<Value> {
    (0..n).map(|i| json!({"dish": format!("dish {i}")})).collect()
}

pub fn create_test_config(cache_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig {
        cache_dir: cache_dir.to_path_buf(),
        model: "test-model".to_string(),
        ..Default::default()
    };
    config.online.status_log_interval = None;
    config.batch.poll_interval = Duration::from_millis(10);
    config
}

pub fn create_test_formatter(
    fingerprint: &str,
) -> FnFormatter<impl Fn(&Value) -> anyhow::Result<Vec<ChatMessage>> + Send + Sync> {
    FnFormatter::new(fingerprint, |row: &Value| {
        Ok(vec![ChatMessage::user(format!(
            "Write a recipe for {}",
            row["dish"].as_str().unwrap_or_default()
        ))])
    })
}

/// Log lines captured from the current thread.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    /// Capture everything logged on this thread until the guard is dropped.
    pub fn start() -> (Self, DefaultGuard) {
        let logs = Self::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();
        (logs, tracing::subscriber::set_default(subscriber))
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.contents().contains(needle)
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
