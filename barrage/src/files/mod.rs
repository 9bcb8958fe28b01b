//! On-disk layout of a run.
//!
//! Every run owns a working directory named by its content hash:
//!
//! ```text
//! <cache_dir>/<run_hash>/
//!     requests_<shard>.jsonl      one GenericRequest per line
//!     metadata_<shard>.json       {"num_jobs": <int>}
//!     responses_<shard>.jsonl     one GenericResponse per line
//!     requests_<shard>_resubmit_<attempt>.jsonl
//!     requests_<shard>_retry_<n>.jsonl
//!     failed_requests.jsonl       permanently failed GenericRequests
//!     batch_objects.jsonl         serialized BatchStatusTracker
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::Result;

pub mod requests;
pub mod responses;

pub use requests::{read_requests, RequestFileBuilder, RequestShard, ShardMetadata};
pub use responses::{
    append_failed_requests, read_responses, reconcile_responses, terminal_rows, ResponseWriter,
};

/// Paths of every file belonging to one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFiles {
    working_dir: PathBuf,
}

impl RunFiles {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn request_file(&self, shard: usize) -> PathBuf {
        self.working_dir.join(format!("requests_{shard}.jsonl"))
    }

    pub fn metadata_file(&self, shard: usize) -> PathBuf {
        self.working_dir.join(format!("metadata_{shard}.json"))
    }

    pub fn response_file(&self, shard: usize) -> PathBuf {
        self.working_dir.join(format!("responses_{shard}.jsonl"))
    }

    /// Request file holding the rows of `shard` resubmitted in round `attempt`.
    pub fn resubmit_file(&self, shard: usize, attempt: u32) -> PathBuf {
        self.working_dir
            .join(format!("requests_{shard}_resubmit_{attempt}.jsonl"))
    }

    /// Request file number `n` holding permanently failed rows of `shard` retried by a later run.
    pub fn retry_file(&self, shard: usize, n: usize) -> PathBuf {
        self.working_dir
            .join(format!("requests_{shard}_retry_{n}.jsonl"))
    }

    pub fn failed_requests_file(&self) -> PathBuf {
        self.working_dir.join("failed_requests.jsonl")
    }

    pub fn tracker_file(&self) -> PathBuf {
        self.working_dir.join("batch_objects.jsonl")
    }
}

/// Write `contents` to `path` so readers only ever observe the old or the new file.
///
/// The data goes to a temporary sibling, is synced, then renamed into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}
