//! Content-addressed cache of materialized output datasets.
//!
//! A dataset for a given key is written once, by atomic rename, to
//! `<cache_dir>/<key>.parquet`. Readers either see a complete file or none.
//! A file that fails to decode is deleted and reported as a miss.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::error::{BarrageError, Result};
use crate::request::RowIndex;

/// Column holding the original row index of every output row.
const ROW_INDEX_COLUMN: &str = "__row_idx";

/// Output rows of a run, ordered by original row index.
///
/// Rows whose request failed permanently are absent, so `row_indices` may have gaps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub row_indices: Vec<RowIndex>,
    pub rows: Vec<Map<String, Value>>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in order of first appearance.
    pub fn columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut columns = Vec::new();
        for key in self.rows.iter().flat_map(Map::keys) {
            if seen.insert(key.as_str()) {
                columns.push(key.clone());
            }
        }
        columns
    }

    /// Iterate over `(row index, row)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (RowIndex, &Map<String, Value>)> {
        self.row_indices.iter().copied().zip(self.rows.iter())
    }

    fn to_record_batch(&self) -> Result<RecordBatch> {
        let columns = self.columns();

        let mut fields = vec![Field::new(ROW_INDEX_COLUMN, DataType::UInt64, false)];
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(UInt64Array::from(
            self.row_indices
                .iter()
                .map(|idx| *idx as u64)
                .collect::<Vec<_>>(),
        ))];

        for column in &columns {
            fields.push(Field::new(column, DataType::Utf8, true));
            let values = self
                .rows
                .iter()
                .map(|row| row.get(column).map(serde_json::to_string).transpose())
                .collect::<std::result::Result<Vec<Option<String>>, _>>()?;
            arrays.push(Arc::new(StringArray::from(values)));
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
    }

    fn from_record_batches(batches: &[RecordBatch]) -> Result<Self> {
        let mut dataset = Dataset::default();
        for batch in batches {
            let schema = batch.schema();
            let row_idx = batch
                .column(schema.index_of(ROW_INDEX_COLUMN)?)
                .as_any()
                .downcast_ref::<UInt64Array>()
                .ok_or_else(|| corrupt(format!("column '{ROW_INDEX_COLUMN}' is not UInt64")))?;

            let mut columns = Vec::new();
            for (i, field) in schema.fields().iter().enumerate() {
                if field.name() == ROW_INDEX_COLUMN {
                    continue;
                }
                let array = batch
                    .column(i)
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| corrupt(format!("column '{}' is not Utf8", field.name())))?;
                columns.push((field.name().clone(), array));
            }

            for row in 0..batch.num_rows() {
                let mut values = Map::new();
                for (name, array) in &columns {
                    if array.is_valid(row) {
                        values.insert(name.clone(), serde_json::from_str(array.value(row))?);
                    }
                }
                dataset.row_indices.push(row_idx.value(row) as RowIndex);
                dataset.rows.push(values);
            }
        }
        Ok(dataset)
    }
}

fn corrupt(message: String) -> BarrageError {
    BarrageError::Other(anyhow::anyhow!("corrupt cache artifact: {message}"))
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some("barrage".to_string()),
    };
    WriterProperties::builder()
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

/// Reads and writes cached datasets under one directory.
#[derive(Debug, Clone)]
pub struct CacheManager {
    cache_dir: PathBuf,
}

impl CacheManager {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Working directory of the run with the given hash.
    pub fn working_dir(&self, run_hash: &str) -> PathBuf {
        self.cache_dir.join(run_hash)
    }

    pub fn dataset_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.parquet"))
    }

    /// Return the cached dataset for `key` if present and readable.
    ///
    /// An unreadable artifact is deleted and treated as a miss.
    pub fn lookup(&self, key: &str) -> Result<Option<Dataset>> {
        let path = self.dataset_path(key);
        if !path.exists() {
            return Ok(None);
        }

        match read_dataset(&path) {
            Ok(dataset) => {
                tracing::debug!(path = %path.display(), rows = dataset.len(), "Cache hit");
                Ok(Some(dataset))
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Cached dataset is corrupt, removing it"
                );
                std::fs::remove_file(&path)?;
                Ok(None)
            }
        }
    }

    /// Write a dataset for `key`, replacing any previous artifact atomically.
    pub fn store(&self, key: &str, dataset: &Dataset) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let path = self.dataset_path(key);
        let batch = dataset.to_record_batch()?;

        let tmp = NamedTempFile::new_in(&self.cache_dir)?;
        let mut writer =
            ArrowWriter::try_new(tmp.reopen()?, batch.schema(), Some(writer_properties()))?;
        writer.write(&batch)?;
        writer.close()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)?;

        tracing::info!(path = %path.display(), rows = dataset.len(), "Stored output dataset");
        Ok(path)
    }
}

/// Decode a dataset artifact.
pub fn read_dataset(path: &Path) -> Result<Dataset> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Dataset::from_record_batches(&batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn dataset() -> Dataset {
        let row = |v: Value| v.as_object().cloned().unwrap();
        Dataset {
            row_indices: vec![0, 2],
            rows: vec![
                row(json!({"response": "a", "score": 1})),
                row(json!({"response": {"nested": [1, 2]}})),
            ],
        }
    }

    #[test]
    fn test_store_then_lookup() {
        let dir = TempDir::new().unwrap();
        let cache = CacheManager::new(dir.path());

        cache.store("key", &dataset()).unwrap();
        let loaded = cache.lookup("key").unwrap().unwrap();

        assert_eq!(loaded, dataset());
        assert_eq!(loaded.columns(), vec!["response".to_string(), "score".to_string()]);
    }

    #[test]
    fn test_missing_entry_is_a_miss() {
        let dir = TempDir::new().unwrap();
        assert_eq!(CacheManager::new(dir.path()).lookup("nope").unwrap(), None);
    }

    #[test]
    fn test_corrupt_entry_is_removed() {
        let dir = TempDir::new().unwrap();
        let cache = CacheManager::new(dir.path());
        std::fs::write(cache.dataset_path("key"), b"definitely not parquet").unwrap();

        assert_eq!(cache.lookup("key").unwrap(), None);
        assert!(!cache.dataset_path("key").exists());
    }

    #[test]
    fn test_empty_dataset() {
        let dir = TempDir::new().unwrap();
        let cache = CacheManager::new(dir.path());

        cache.store("empty", &Dataset::default()).unwrap();
        assert!(cache.lookup("empty").unwrap().unwrap().is_empty());
    }
}
