//! Content hashing for run identity.
//!
//! The run hash names the working directory, so any change to the prompt
//! formatter, model, generation parameters, dispatch strategy or input records
//! starts a fresh run, and an unchanged run resumes from its existing files.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Incremental SHA-256 over length-prefixed fields.
///
/// Every field is prefixed with its byte length so that `("ab", "c")` and
/// `("a", "bc")` hash differently.
#[derive(Clone, Default)]
pub struct ContentHasher {
    hasher: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn text(&mut self, value: &str) -> &mut Self {
        self.field(value.as_bytes())
    }

    /// Hash a JSON value through its canonical serialization (object keys sorted).
    pub fn json(&mut self, value: &Value) -> Result<&mut Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(self.field(&bytes))
    }

    /// Lowercase hex digest.
    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

/// Inputs identifying one run.
#[derive(Debug, Clone, Copy)]
pub struct RunIdentity<'a> {
    pub formatter_fingerprint: &'a str,
    pub model: &'a str,
    pub generation_params: &'a Map<String, Value>,
    pub strategy: &'a str,
    pub records: &'a [Value],
}

/// Hash naming the working directory of a run.
pub fn run_hash(identity: RunIdentity<'_>) -> Result<String> {
    let mut hasher = ContentHasher::new();
    hasher
        .text(identity.formatter_fingerprint)
        .text(identity.model)
        .json(&Value::Object(identity.generation_params.clone()))?
        .text(identity.strategy)
        .field(&(identity.records.len() as u64).to_le_bytes());
    for record in identity.records {
        hasher.json(record)?;
    }
    Ok(hasher.finish())
}

/// Key of the materialized dataset for a run and a response parser.
pub fn dataset_key(run_hash: &str, parser_fingerprint: &str) -> String {
    let mut hasher = ContentHasher::new();
    hasher.text(run_hash).text(parser_fingerprint);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity<'a>(
        params: &'a Map<String, Value>,
        records: &'a [Value],
        strategy: &'a str,
    ) -> RunIdentity<'a> {
        RunIdentity {
            formatter_fingerprint: "recipe-v1",
            model: "gpt-test",
            generation_params: params,
            strategy,
            records,
        }
    }

    #[test]
    fn test_run_hash_is_stable() {
        let params = Map::new();
        let records = vec![json!({"dish": "pasta"}), json!({"dish": "soup"})];

        let first = run_hash(identity(&params, &records, "online")).unwrap();
        let second = run_hash(identity(&params, &records, "online")).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_run_hash_changes_with_inputs() {
        let params = Map::new();
        let mut other_params = Map::new();
        other_params.insert("temperature".into(), json!(0.5));
        let records = vec![json!({"dish": "pasta"}), json!({"dish": "soup"})];
        let reordered = vec![json!({"dish": "soup"}), json!({"dish": "pasta"})];

        let base = run_hash(identity(&params, &records, "online")).unwrap();
        assert_ne!(base, run_hash(identity(&other_params, &records, "online")).unwrap());
        assert_ne!(base, run_hash(identity(&params, &reordered, "online")).unwrap());
        assert_ne!(base, run_hash(identity(&params, &records, "batch")).unwrap());
    }

    #[test]
    fn test_fields_are_length_prefixed() {
        let mut a = ContentHasher::new();
        a.text("ab").text("c");
        let mut b = ContentHasher::new();
        b.text("a").text("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_dataset_key_depends_on_parser() {
        assert_ne!(dataset_key("abc", "parser-a"), dataset_key("abc", "parser-b"));
    }
}
