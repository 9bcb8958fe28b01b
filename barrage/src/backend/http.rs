//! reqwest-based synchronous backend for OpenAI-compatible chat completion endpoints.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{BackendError, BackendResponse, SyncBackend};
use crate::request::{GenericRequest, TokenUsage};

/// Default per-attempt timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Production backend making real HTTP requests.
///
/// Sends `POST {base_url}/chat/completions` with the request's model, messages
/// and generation parameters merged into one JSON body.
#[derive(Clone)]
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiCompatibleBackend {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn body(request: &GenericRequest) -> Value {
        let mut body = Map::new();
        body.insert("model".to_string(), Value::String(request.model.clone()));
        body.insert(
            "messages".to_string(),
            serde_json::to_value(&request.messages).unwrap_or(Value::Array(Vec::new())),
        );
        for (key, value) in &request.generation_params {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }
}

/// Map an HTTP status to the backend error taxonomy.
///
/// 429 is a rate limit, 408 and 5xx are transient, everything else non-2xx is fatal.
pub fn classify_status(status: u16, body: &str) -> Option<BackendError> {
    match status {
        200..=299 => None,
        429 => Some(BackendError::RateLimited(format!("HTTP 429: {body}"))),
        408 | 500..=599 => Some(BackendError::Transient(format!("HTTP {status}: {body}"))),
        _ => Some(BackendError::Fatal(format!("HTTP {status}: {body}"))),
    }
}

fn parse_completion(raw: Value) -> BackendResponse {
    let choice = raw.pointer("/choices/0");
    let message = choice.and_then(|c| c.get("message")).cloned();
    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let usage = raw.get("usage").map(|usage| {
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
        let input = field("prompt_tokens");
        let output = field("completion_tokens");
        TokenUsage {
            input,
            output,
            total: usage
                .get("total_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(input + output),
        }
    });

    BackendResponse {
        message,
        finish_reason,
        raw: Some(raw),
        usage,
    }
}

#[async_trait]
impl SyncBackend for OpenAiCompatibleBackend {
    #[tracing::instrument(skip(self, request), fields(row_idx = request.original_row_idx, model = %request.model))]
    async fn execute(
        &self,
        request: &GenericRequest,
    ) -> std::result::Result<BackendResponse, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut req = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&Self::body(request));

        // Only add Authorization header if api_key is not empty
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }

        let response = req.send().await.map_err(|e| {
            tracing::warn!(url = %url, error = %e, "HTTP request failed");
            BackendError::Transient(e.to_string())
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Transient(e.to_string()))?;

        tracing::debug!(status = status, response_len = body.len(), "HTTP request completed");

        if let Some(error) = classify_status(status, &body) {
            return Err(error);
        }

        let raw: Value = serde_json::from_str(&body)
            .map_err(|e| BackendError::Transient(format!("invalid JSON response: {e}")))?;
        Ok(parse_completion(raw))
    }
}
