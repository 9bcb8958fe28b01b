//! Response file I/O.
//!
//! Response files are append-only while a dispatcher runs. The only rewrite
//! happens in [`reconcile_responses`], once, before dispatch starts.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use super::write_atomic;
use crate::error::Result;
use crate::request::{GenericRequest, GenericResponse, RowIndex};

/// Appends terminal responses to a response file, one JSON line each.
#[derive(Debug)]
pub struct ResponseWriter {
    path: PathBuf,
    file: tokio::fs::File,
    written: usize,
}

impl ResponseWriter {
    /// Open `path` for appending, creating it if needed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written through this writer.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Append one response and flush it to the OS.
    pub async fn write(&mut self, response: &GenericResponse) -> Result<()> {
        let mut line = serde_json::to_vec(response)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.flush().await?;
        self.written += 1;
        Ok(())
    }
}

/// Read every parseable response of a file.
///
/// A missing file yields no responses. Unparseable lines (typically a last line
/// truncated by a crash) are skipped with a warning.
pub fn read_responses(path: &Path) -> Result<Vec<GenericResponse>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)?;
    let mut responses = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<GenericResponse>(&line) {
            Ok(response) => responses.push(response),
            Err(e) => tracing::warn!(
                path = %path.display(),
                line = line_no + 1,
                error = %e,
                "Skipping unreadable response line"
            ),
        }
    }
    Ok(responses)
}

/// Scan a response file left by an earlier run.
///
/// Returns the row indices that already have a successful response. Failed and
/// unreadable lines, and duplicate successes, are removed from the file by an
/// atomic rewrite so that retried rows end up with a single terminal line.
pub fn reconcile_responses(path: &Path) -> Result<HashSet<RowIndex>> {
    let mut completed = HashSet::new();
    if !path.exists() {
        return Ok(completed);
    }

    let contents = std::fs::read_to_string(path)?;
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<GenericResponse>(line) {
            Ok(response) if response.is_success() && completed.insert(response.row_idx()) => {
                kept.push(line);
            }
            _ => dropped += 1,
        }
    }

    if dropped > 0 {
        tracing::info!(
            path = %path.display(),
            dropped,
            kept = kept.len(),
            "Removing failed and unreadable lines from response file"
        );
        let mut rewritten = kept.join("\n");
        if !kept.is_empty() {
            rewritten.push('\n');
        }
        write_atomic(path, rewritten.as_bytes())?;
    }
    Ok(completed)
}

/// Row indices with any terminal line (success or failure) in a response file.
pub fn terminal_rows(path: &Path) -> Result<HashSet<RowIndex>> {
    Ok(read_responses(path)?
        .iter()
        .map(GenericResponse::row_idx)
        .collect())
}

/// Append permanently failed requests to `failed_requests.jsonl`.
pub fn append_failed_requests(path: &Path, requests: &[GenericRequest]) -> Result<()> {
    if requests.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let mut buf = Vec::new();
    for request in requests {
        serde_json::to_writer(&mut buf, request)?;
        buf.push(b'\n');
    }
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ChatMessage;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn request(idx: RowIndex) -> GenericRequest {
        GenericRequest {
            model: "test-model".to_string(),
            messages: vec![ChatMessage::user("hi")],
            generation_params: Default::default(),
            original_row: json!({}),
            original_row_idx: idx,
        }
    }

    fn success(idx: RowIndex) -> GenericResponse {
        GenericResponse {
            generic_request: request(idx),
            response_message: Some(json!({"content": "ok"})),
            response_errors: None,
            raw_response: None,
            finish_reason: Some("stop".to_string()),
            token_usage: None,
            created_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_writer_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("responses_0.jsonl");

        let mut writer = ResponseWriter::open(&path).await.unwrap();
        writer.write(&success(0)).await.unwrap();
        writer.write(&success(1)).await.unwrap();
        drop(writer);

        let mut writer = ResponseWriter::open(&path).await.unwrap();
        writer.write(&success(2)).await.unwrap();
        assert_eq!(writer.written(), 1);

        let rows: Vec<_> = read_responses(&path)
            .unwrap()
            .iter()
            .map(GenericResponse::row_idx)
            .collect();
        assert_eq!(rows, vec![0, 1, 2]);
    }

    #[test]
    fn test_reconcile_drops_failures_and_truncated_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("responses_0.jsonl");
        let failed = GenericResponse::failed(request(1), vec!["boom".into()], Utc::now());
        let contents = format!(
            "{}\n{}\n{}\n{{\"generic_req",
            serde_json::to_string(&success(0)).unwrap(),
            serde_json::to_string(&failed).unwrap(),
            serde_json::to_string(&success(2)).unwrap(),
        );
        std::fs::write(&path, contents).unwrap();

        let completed = reconcile_responses(&path).unwrap();

        assert_eq!(completed, HashSet::from([0, 2]));
        let remaining = read_responses(&path).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(GenericResponse::is_success));
    }

    #[test]
    fn test_reconcile_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(reconcile_responses(&dir.path().join("nope.jsonl"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_append_failed_requests() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed_requests.jsonl");

        append_failed_requests(&path, &[request(3)]).unwrap();
        append_failed_requests(&path, &[request(5)]).unwrap();

        let rows: Vec<_> = crate::files::read_requests(&path)
            .unwrap()
            .iter()
            .map(|r| r.original_row_idx)
            .collect();
        assert_eq!(rows, vec![3, 5]);
    }
}
