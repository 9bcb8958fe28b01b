//! Request file builder.
//!
//! Serializes every request of a run into one or more `requests_<shard>.jsonl`
//! files, each with a sibling `metadata_<shard>.json` declaring its job count.
//! The metadata is only written after the request file is fully flushed and
//! renamed into place, so a request file without matching metadata is always a
//! leftover of an interrupted write and gets rebuilt.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{write_atomic, RunFiles};
use crate::error::{BarrageError, Result};
use crate::request::{GenericRequest, RowIndex};

/// Contents of `metadata_<shard>.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetadata {
    pub num_jobs: usize,
}

/// A request file ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestShard {
    pub shard: usize,
    pub request_file: PathBuf,
    pub metadata_file: PathBuf,
    pub response_file: PathBuf,
    /// First row index covered by this shard
    pub first_row: RowIndex,
    pub num_jobs: usize,
}

/// Result of inspecting an existing shard on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardState {
    /// Request file and metadata agree; holds the declared job count
    Consistent(usize),
    /// Request file exists but is truncated, malformed or lacks metadata
    Incomplete,
    /// Nothing on disk yet
    Missing,
}

/// Builds (or reuses) the request files of a run.
#[derive(Debug, Clone)]
pub struct RequestFileBuilder {
    files: RunFiles,
    shard_size: Option<usize>,
}

impl RequestFileBuilder {
    /// `shard_size` of `None` puts every request in a single shard.
    pub fn new(files: RunFiles, shard_size: Option<usize>) -> Self {
        Self {
            files,
            shard_size: shard_size.filter(|size| *size > 0),
        }
    }

    /// Row ranges of each shard for a run of `n_requests` rows.
    pub fn shard_ranges(&self, n_requests: usize) -> Vec<std::ops::Range<RowIndex>> {
        let size = self.shard_size.unwrap_or(n_requests.max(1));
        (0..n_requests)
            .step_by(size)
            .map(|start| start..(start + size).min(n_requests))
            .collect()
    }

    /// Check whether a shard's files can be reused verbatim.
    ///
    /// # Errors
    /// - `MissingRequestFile` if metadata exists without its request file
    /// - `InvalidMetadata` if the metadata is not valid JSON
    pub fn inspect(&self, shard: usize) -> Result<ShardState> {
        let request_file = self.files.request_file(shard);
        let metadata_file = self.files.metadata_file(shard);

        match (request_file.exists(), metadata_file.exists()) {
            (false, false) => Ok(ShardState::Missing),
            (false, true) => Err(BarrageError::MissingRequestFile {
                request_file,
                metadata: metadata_file,
            }),
            (true, false) => {
                tracing::warn!(
                    path = %request_file.display(),
                    "Request file has no metadata, treating as incomplete"
                );
                Ok(ShardState::Incomplete)
            }
            (true, true) => {
                let contents = std::fs::read_to_string(&metadata_file)?;
                let metadata: ShardMetadata =
                    serde_json::from_str(&contents).map_err(|source| {
                        BarrageError::InvalidMetadata {
                            path: metadata_file.clone(),
                            source,
                        }
                    })?;

                match count_valid_requests(&request_file)? {
                    Some(n) if n == metadata.num_jobs => Ok(ShardState::Consistent(n)),
                    found => {
                        tracing::warn!(
                            path = %request_file.display(),
                            expected = metadata.num_jobs,
                            found = ?found,
                            "Request file is inconsistent with its metadata"
                        );
                        Ok(ShardState::Incomplete)
                    }
                }
            }
        }
    }

    /// Make sure every shard of the run exists on disk and is consistent.
    ///
    /// Consistent shards are reused untouched; missing or incomplete ones are
    /// regenerated by calling `make_request` for each of their rows.
    pub fn prepare<F>(&self, n_requests: usize, mut make_request: F) -> Result<Vec<RequestShard>>
    where
        F: FnMut(RowIndex) -> Result<GenericRequest>,
    {
        std::fs::create_dir_all(self.files.working_dir())?;

        let mut shards = Vec::new();
        for (shard, range) in self.shard_ranges(n_requests).into_iter().enumerate() {
            let expected = range.len();
            let state = self.inspect(shard)?;

            if state == ShardState::Consistent(expected) {
                tracing::debug!(shard, num_jobs = expected, "Reusing existing request file");
            } else {
                if state != ShardState::Missing {
                    tracing::warn!(
                        path = %self.files.request_file(shard).display(),
                        "Request file is incomplete, regenerating"
                    );
                }
                let requests = range
                    .clone()
                    .map(&mut make_request)
                    .collect::<Result<Vec<_>>>()?;
                self.write_shard(shard, &requests)?;
            }

            shards.push(RequestShard {
                shard,
                request_file: self.files.request_file(shard),
                metadata_file: self.files.metadata_file(shard),
                response_file: self.files.response_file(shard),
                first_row: range.start,
                num_jobs: expected,
            });
        }

        tracing::info!(
            shards = shards.len(),
            n_requests,
            working_dir = %self.files.working_dir().display(),
            "Request files ready"
        );
        Ok(shards)
    }

    fn write_shard(&self, shard: usize, requests: &[GenericRequest]) -> Result<()> {
        let request_file = self.files.request_file(shard);
        write_request_file(&request_file, requests)?;

        let metadata = ShardMetadata {
            num_jobs: requests.len(),
        };
        write_atomic(
            &self.files.metadata_file(shard),
            &serde_json::to_vec(&metadata)?,
        )
    }
}

/// Write requests as JSON lines, renaming into place only once fully synced.
pub fn write_request_file(path: &Path, requests: &[GenericRequest]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        for request in requests {
            serde_json::to_writer(&mut writer, request)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

/// Read every request of a request file.
pub fn read_requests(path: &Path) -> Result<Vec<GenericRequest>> {
    let file = std::fs::File::open(path)?;
    let mut requests = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        requests.push(serde_json::from_str(&line)?);
    }
    Ok(requests)
}

/// Count the requests of a file, or `None` if any line fails to parse.
fn count_valid_requests(path: &Path) -> Result<Option<usize>> {
    let file = std::fs::File::open(path)?;
    let mut count = 0;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if serde_json::from_str::<GenericRequest>(&line).is_err() {
            return Ok(None);
        }
        count += 1;
    }
    Ok(Some(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ChatMessage;
    use serde_json::json;
    use tempfile::TempDir;

    fn make_request(idx: RowIndex) -> Result<GenericRequest> {
        Ok(GenericRequest {
            model: "test-model".to_string(),
            messages: vec![ChatMessage::user(format!("row {idx}"))],
            generation_params: Default::default(),
            original_row: json!({"idx": idx}),
            original_row_idx: idx,
        })
    }

    fn builder(dir: &TempDir, shard_size: Option<usize>) -> RequestFileBuilder {
        RequestFileBuilder::new(RunFiles::new(dir.path().join("hash")), shard_size)
    }

    #[test]
    fn test_shard_ranges() {
        let dir = TempDir::new().unwrap();
        assert_eq!(builder(&dir, Some(2)).shard_ranges(5), vec![0..2, 2..4, 4..5]);
        assert_eq!(builder(&dir, None).shard_ranges(5), vec![0..5]);
        assert!(builder(&dir, None).shard_ranges(0).is_empty());
    }

    #[test]
    fn test_prepare_writes_requests_and_metadata() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir, Some(2));

        let shards = builder.prepare(3, make_request).unwrap();

        assert_eq!(shards.len(), 2);
        assert_eq!(shards[1].first_row, 2);
        let requests = read_requests(&shards[0].request_file).unwrap();
        assert_eq!(
            requests.iter().map(|r| r.original_row_idx).collect::<Vec<_>>(),
            vec![0, 1]
        );
        let metadata: ShardMetadata =
            serde_json::from_str(&std::fs::read_to_string(&shards[1].metadata_file).unwrap())
                .unwrap();
        assert_eq!(metadata.num_jobs, 1);
    }

    #[test]
    fn test_consistent_shards_are_reused() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir, None);
        builder.prepare(3, make_request).unwrap();

        let mut calls = 0;
        builder
            .prepare(3, |idx| {
                calls += 1;
                make_request(idx)
            })
            .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_truncated_request_file_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir, None);
        let shards = builder.prepare(3, make_request).unwrap();

        // simulate a crash that lost the last line
        let contents = std::fs::read_to_string(&shards[0].request_file).unwrap();
        let truncated: Vec<&str> = contents.lines().take(2).collect();
        std::fs::write(&shards[0].request_file, truncated.join("\n")).unwrap();
        assert_eq!(builder.inspect(0).unwrap(), ShardState::Incomplete);

        builder.prepare(3, make_request).unwrap();
        assert_eq!(builder.inspect(0).unwrap(), ShardState::Consistent(3));
    }

    #[test]
    fn test_request_file_without_metadata_is_incomplete() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir, None);
        let shards = builder.prepare(2, make_request).unwrap();
        std::fs::remove_file(&shards[0].metadata_file).unwrap();

        assert_eq!(builder.inspect(0).unwrap(), ShardState::Incomplete);
    }

    #[test]
    fn test_metadata_without_request_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir, None);
        let shards = builder.prepare(2, make_request).unwrap();
        std::fs::remove_file(&shards[0].request_file).unwrap();

        assert!(matches!(
            builder.prepare(2, make_request),
            Err(BarrageError::MissingRequestFile { .. })
        ));
    }

    #[test]
    fn test_invalid_metadata_is_an_error() {
        let dir = TempDir::new().unwrap();
        let builder = builder(&dir, None);
        let shards = builder.prepare(2, make_request).unwrap();
        std::fs::write(&shards[0].metadata_file, "{not json").unwrap();

        assert!(matches!(
            builder.inspect(0),
            Err(BarrageError::InvalidMetadata { .. })
        ));
    }
}
