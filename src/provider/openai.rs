//! Adapter for OpenAI-compatible `/chat/completions` endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde_json::{json, Value};

use super::{Completion, LlmProvider, ProviderError};
use crate::config::ApiKey;
use crate::types::GenerationParams;

/// Request body keys owned by the adapter; caller params cannot override them.
const RESERVED_KEYS: &[&str] = &["model", "messages", "stream"];

/// Client for any upstream speaking the OpenAI chat-completions shape.
pub struct OpenAiCompatible {
    name: String,
    base_url: String,
    api_key: Option<ApiKey>,
    http: reqwest::Client,
}

impl OpenAiCompatible {
    pub fn new(name: &str, base_url: &str, api_key: Option<ApiKey>, http: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
        }
    }

    fn build_body(prompt: &str, params: &GenerationParams, model: &str) -> Value {
        let mut body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(obj) = body.as_object_mut() {
            for (key, value) in params.iter() {
                if !RESERVED_KEYS.contains(&key.as_str()) {
                    obj.insert(key.clone(), value.clone());
                }
            }
        }
        body
    }
}

/// Extract token usage from an OpenAI-compatible response body.
///
/// Counts beyond `u32::MAX` saturate so an oversized report is never billed
/// as a small one.
fn extract_usage(response: &Value) -> Option<(u32, u32)> {
    let usage = response.get("usage")?;
    let count = |field: &str| -> Option<u32> {
        let n = usage.get(field)?.as_u64()?;
        Some(u32::try_from(n).unwrap_or(u32::MAX))
    };
    Some((count("prompt_tokens")?, count("completion_tokens")?))
}

fn extract_text(response: &Value) -> Option<String> {
    response
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

/// Parse a `Retry-After` header given in whole seconds.
fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl LlmProvider for OpenAiCompatible {
    async fn call(
        &self,
        prompt: &str,
        params: &GenerationParams,
        model: &str,
        timeout: Duration,
    ) -> Result<Completion, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut request = self
            .http
            .post(&url)
            .timeout(timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&Self::build_body(prompt, params, model));

        if let Some(api_key) = &self.api_key {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", api_key.expose_secret()),
            );
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout { after: timeout }
            } else {
                tracing::debug!(provider = %self.name, error = %e, "Failed to reach provider");
                ProviderError::Upstream {
                    status: None,
                    message: format!("Failed to reach provider: {}", e),
                }
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RateLimited {
                retry_after,
                message: body,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(
                provider = %self.name,
                status = %status,
                body = %body,
                "Provider returned error"
            );
            return Err(ProviderError::Upstream {
                status: Some(status.as_u16()),
                message: format!("Provider returned {}: {}", status, body),
            });
        }

        let body: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout { after: timeout }
            } else {
                ProviderError::Upstream {
                    status: Some(status.as_u16()),
                    message: format!("Failed to parse response: {}", e),
                }
            }
        })?;

        let text = extract_text(&body).ok_or_else(|| ProviderError::Upstream {
            status: Some(status.as_u16()),
            message: "Response has no choices[0].message.content".to_string(),
        })?;

        let (input_tokens, output_tokens) = extract_usage(&body).unwrap_or_else(|| {
            tracing::warn!(provider = %self.name, "Response has no usage object, recording zero tokens");
            (0, 0)
        });

        Ok(Completion {
            text,
            input_tokens,
            output_tokens,
        })
    }
}
