//! OpenAI chat-completions client.
//!
//! Single-shot completion call with pinned temperature, a token cap and a
//! hard timeout. Failures are classified into the model error taxonomy so
//! the governor can tell retryable from fatal.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::ModelError;

/// Per-call timeout for completion requests.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Single-shot completion seam for the extraction client.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Model identifier used in the output rows.
    fn model_name(&self) -> &str;

    /// Issue one completion call and return the raw text content.
    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError>;
}

/// OpenAI-backed model client.
pub struct OpenAiClient {
    api_key: SecretString,
    model: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(COMPLETION_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            model: model.into(),
            client,
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, ModelError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "response_format": {"type": "json_object"},
        });

        let resp = self
            .client
            .post(COMPLETIONS_URL)
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(COMPLETION_TIMEOUT)
                } else {
                    ModelError::Transient(e.to_string())
                }
            })?;

        let status = resp.status();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs);

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        if status.is_success() {
            return data
                .get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(serde_json::Value::as_str)
                .map(|s| s.trim().to_string())
                .ok_or_else(|| {
                    ModelError::InvalidResponse("response has no message content".into())
                });
        }

        Err(classify_api_error(status.as_u16(), retry_after, &data))
    }
}

/// Map an error status + body into the model error taxonomy.
fn classify_api_error(
    status: u16,
    retry_after: Option<Duration>,
    data: &serde_json::Value,
) -> ModelError {
    let error_type = data
        .get("error")
        .and_then(|e| e.get("type").or_else(|| e.get("code")))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");
    let message = data
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("")
        .to_string();

    match status {
        // 429 covers both rate limiting and a spent quota; only the former
        // is worth retrying.
        429 if error_type == "insufficient_quota" => ModelError::QuotaExhausted(message),
        429 => ModelError::RateLimited { retry_after },
        401 | 403 => ModelError::AuthFailed(if message.is_empty() {
            format!("HTTP {status}")
        } else {
            message
        }),
        s if s >= 500 => ModelError::Transient(format!("HTTP {s}: {message}")),
        s => ModelError::InvalidResponse(format!("HTTP {s}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rate_limit_vs_quota() {
        let body = serde_json::json!({"error": {"type": "insufficient_quota", "message": "out"}});
        assert!(matches!(
            classify_api_error(429, None, &body),
            ModelError::QuotaExhausted(_)
        ));

        let body = serde_json::json!({"error": {"type": "rate_limit_exceeded", "message": "slow down"}});
        let err = classify_api_error(429, Some(Duration::from_secs(2)), &body);
        match err {
            ModelError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn classify_auth_and_server_errors() {
        let body = serde_json::json!({"error": {"message": "bad key"}});
        assert!(matches!(
            classify_api_error(401, None, &body),
            ModelError::AuthFailed(_)
        ));
        assert!(matches!(
            classify_api_error(503, None, &body),
            ModelError::Transient(_)
        ));
        assert!(matches!(
            classify_api_error(400, None, &body),
            ModelError::InvalidResponse(_)
        ));
    }

    #[test]
    fn model_name_matches_configured() {
        let client = OpenAiClient::new(SecretString::from("sk-test"), "gpt-4o-mini");
        assert_eq!(client.model_name(), "gpt-4o-mini");
    }
}
