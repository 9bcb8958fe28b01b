//! Core request and response types.
//!
//! A [`GenericRequest`] is produced once per input row and written to a request
//! file. Dispatchers turn each one into exactly one terminal [`GenericResponse`]
//! (success or failure). The original row index is the join key between the two
//! and must survive every serialization step unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Position of a row in the input record sequence.
pub type RowIndex = usize;

/// One message of a chat-style prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Speaker role, e.g. "system", "user" or "assistant"
    pub role: String,
    /// Message content; a plain string or a list of content parts
    pub content: Value,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    fn char_len(&self) -> usize {
        match &self.content {
            Value::String(s) => s.chars().count(),
            other => other.to_string().chars().count(),
        }
    }
}

/// One unit of work, independent of the backend that will execute it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericRequest {
    /// Model identifier
    pub model: String,

    /// Ordered prompt messages
    pub messages: Vec<ChatMessage>,

    /// Generation parameters forwarded verbatim to the backend (temperature, max_tokens, ...)
    #[serde(default)]
    pub generation_params: Map<String, Value>,

    /// The input row this request was built from
    pub original_row: Value,

    /// Index of the input row; unique within a run
    pub original_row_idx: RowIndex,
}

impl GenericRequest {
    /// Rough token estimate used for admission against the tokens-per-minute budget.
    ///
    /// Input is approximated as one token per four characters. Output is the
    /// requested `max_tokens`/`max_completion_tokens`, or `default_max_output`.
    pub fn estimate_tokens(&self, default_max_output: u32) -> u64 {
        let chars: usize = self.messages.iter().map(ChatMessage::char_len).sum();
        let input = chars.div_ceil(4) as u64;
        let output = ["max_tokens", "max_completion_tokens"]
            .iter()
            .find_map(|key| self.generation_params.get(*key).and_then(Value::as_u64))
            .unwrap_or(u64::from(default_max_output));
        input + output
    }
}

/// Token accounting reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

/// The result of one [`GenericRequest`], written once to a response file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericResponse {
    /// The request this response answers
    pub generic_request: GenericRequest,

    /// Parsed model output, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_message: Option<Value>,

    /// Errors encountered across all attempts; present only on terminal failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_errors: Option<Vec<String>>,

    /// Raw backend payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,

    /// Why generation stopped, as reported by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,

    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl GenericResponse {
    /// Index of the row this response belongs to.
    pub fn row_idx(&self) -> RowIndex {
        self.generic_request.original_row_idx
    }

    /// A response is successful when it carries no errors.
    pub fn is_success(&self) -> bool {
        self.response_errors.is_none()
    }

    /// Build a terminal failure for a request.
    pub fn failed(
        generic_request: GenericRequest,
        errors: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            generic_request,
            response_message: None,
            response_errors: Some(errors),
            raw_response: None,
            finish_reason: None,
            token_usage: None,
            created_at,
            finished_at: Utc::now(),
        }
    }
}

/// Whether a finish reason is on the disallow-list.
pub fn is_invalid_finish_reason(finish_reason: Option<&str>, invalid: &[String]) -> bool {
    finish_reason.is_some_and(|reason| invalid.iter().any(|r| r == reason))
}

/// A request plus its retry bookkeeping.
///
/// Only the dispatcher's coordinating loop mutates this value; workers receive
/// a clone of the inner request and report back through the completion channel.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Position in the dispatch order
    pub task_id: usize,
    pub generic_request: GenericRequest,
    /// Retries still available after the current attempt
    pub attempts_left: u32,
    /// Number of attempts started so far
    pub attempt: u32,
    /// Error messages from failed attempts
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// What the coordinator should do with a request after a failed attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Exhausted,
}

impl ApiRequest {
    pub fn new(task_id: usize, generic_request: GenericRequest, max_retries: u32) -> Self {
        Self {
            task_id,
            generic_request,
            attempts_left: max_retries,
            attempt: 0,
            errors: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn row_idx(&self) -> RowIndex {
        self.generic_request.original_row_idx
    }

    /// Record a failed attempt and consume one retry if any remain.
    pub fn record_failure(&mut self, error: String) -> RetryDecision {
        self.errors.push(error);
        if self.attempts_left == 0 {
            RetryDecision::Exhausted
        } else {
            self.attempts_left -= 1;
            RetryDecision::Retry
        }
    }

    /// Convert into the terminal failure line for this request.
    pub fn into_failed_response(self) -> GenericResponse {
        GenericResponse::failed(self.generic_request, self.errors, self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(params: Map<String, Value>) -> GenericRequest {
        GenericRequest {
            model: "test-model".to_string(),
            messages: vec![ChatMessage::user("abcdefgh")],
            generation_params: params,
            original_row: json!({"dish": "pasta"}),
            original_row_idx: 7,
        }
    }

    #[test]
    fn test_estimate_tokens_uses_max_tokens_param() {
        let mut params = Map::new();
        params.insert("max_tokens".to_string(), json!(100));
        assert_eq!(request(params).estimate_tokens(16), 2 + 100);
    }

    #[test]
    fn test_estimate_tokens_falls_back_to_default() {
        assert_eq!(request(Map::new()).estimate_tokens(16), 2 + 16);
    }

    #[test]
    fn test_response_line_keeps_row_index() {
        let response = GenericResponse::failed(request(Map::new()), vec!["boom".into()], Utc::now());
        let line = serde_json::to_string(&response).unwrap();
        let parsed: GenericResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.row_idx(), 7);
        assert!(!parsed.is_success());
    }

    #[test]
    fn test_retry_budget() {
        let mut api_request = ApiRequest::new(0, request(Map::new()), 1);
        assert_eq!(api_request.record_failure("first".into()), RetryDecision::Retry);
        assert_eq!(api_request.attempts_left, 0);
        assert_eq!(api_request.record_failure("second".into()), RetryDecision::Exhausted);

        let failed = api_request.into_failed_response();
        assert_eq!(
            failed.response_errors,
            Some(vec!["first".to_string(), "second".to_string()])
        );
    }

    #[test]
    fn test_invalid_finish_reason() {
        let invalid = vec!["length".to_string(), "content_filter".to_string()];
        assert!(is_invalid_finish_reason(Some("length"), &invalid));
        assert!(!is_invalid_finish_reason(Some("stop"), &invalid));
        assert!(!is_invalid_finish_reason(None, &invalid));
    }
}
