//! Prompt formatting and response parsing hooks.
//!
//! Both traits carry a fingerprint. The formatter fingerprint is part of the
//! run hash, the parser fingerprint is part of the dataset cache key, so
//! changing either invalidates exactly the work that depends on it.

use serde_json::{Map, Value};

use crate::request::ChatMessage;

/// Turns one input row into prompt messages.
pub trait RequestFormatter: Send + Sync {
    /// Identifies the formatting logic.
    fn fingerprint(&self) -> String;

    fn format(&self, row: &Value) -> anyhow::Result<Vec<ChatMessage>>;
}

/// Turns a model message back into an output row.
pub trait ResponseParser: Send + Sync {
    /// Identifies the parsing logic.
    fn fingerprint(&self) -> String;

    /// `row` is the original input row, `message` the backend's answer.
    fn parse(&self, row: &Value, message: &Value) -> anyhow::Result<Map<String, Value>>;
}

/// [`RequestFormatter`] backed by a closure.
///
/// # Example
/// ```
/// use barrage::prompt::{FnFormatter, RequestFormatter};
/// use barrage::request::ChatMessage;
///
/// let formatter = FnFormatter::new("recipe-v1", |row| {
///     Ok(vec![ChatMessage::user(format!("Write a recipe for {}", row["dish"]))])
/// });
/// assert_eq!(formatter.fingerprint(), "recipe-v1");
/// ```
pub struct FnFormatter<F> {
    fingerprint: String,
    format: F,
}

impl<F> FnFormatter<F>
where
    F: Fn(&Value) -> anyhow::Result<Vec<ChatMessage>> + Send + Sync,
{
    /// Bump `fingerprint` whenever the closure's behavior changes.
    pub fn new(fingerprint: impl Into<String>, format: F) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            format,
        }
    }
}

impl<F> RequestFormatter for FnFormatter<F>
where
    F: Fn(&Value) -> anyhow::Result<Vec<ChatMessage>> + Send + Sync,
{
    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    fn format(&self, row: &Value) -> anyhow::Result<Vec<ChatMessage>> {
        (self.format)(row)
    }
}

/// [`ResponseParser`] backed by a closure.
pub struct FnParser<F> {
    fingerprint: String,
    parse: F,
}

impl<F> FnParser<F>
where
    F: Fn(&Value, &Value) -> anyhow::Result<Map<String, Value>> + Send + Sync,
{
    pub fn new(fingerprint: impl Into<String>, parse: F) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            parse,
        }
    }
}

impl<F> ResponseParser for FnParser<F>
where
    F: Fn(&Value, &Value) -> anyhow::Result<Map<String, Value>> + Send + Sync,
{
    fn fingerprint(&self) -> String {
        self.fingerprint.clone()
    }

    fn parse(&self, row: &Value, message: &Value) -> anyhow::Result<Map<String, Value>> {
        (self.parse)(row, message)
    }
}

/// Stores the message content under `"response"`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultParser;

impl ResponseParser for DefaultParser {
    fn fingerprint(&self) -> String {
        "default".to_string()
    }

    fn parse(&self, _row: &Value, message: &Value) -> anyhow::Result<Map<String, Value>> {
        let content = message.get("content").unwrap_or(message).clone();
        let mut out = Map::new();
        out.insert("response".to_string(), content);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_parser_extracts_content() {
        let out = DefaultParser
            .parse(&json!({}), &json!({"role": "assistant", "content": "hello"}))
            .unwrap();
        assert_eq!(out["response"], json!("hello"));

        let out = DefaultParser.parse(&json!({}), &json!("plain")).unwrap();
        assert_eq!(out["response"], json!("plain"));
    }

    #[test]
    fn test_fn_parser() {
        let parser = FnParser::new("dish-v1", |row, message| {
            let mut out = Map::new();
            out.insert("dish".to_string(), row["dish"].clone());
            out.insert("recipe".to_string(), message["content"].clone());
            Ok(out)
        });

        let out = parser
            .parse(&json!({"dish": "soup"}), &json!({"content": "boil"}))
            .unwrap();
        assert_eq!(out["dish"], json!("soup"));
        assert_eq!(parser.fingerprint(), "dish-v1");
    }
}
