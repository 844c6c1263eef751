//! Telegram gateway client.
//!
//! Talks JSON-over-HTTP to an MTProto gateway that already holds an
//! authorized user session (the login/2FA handshake happens in the gateway,
//! not here). Exposes the two history calls the retriever needs and maps
//! gateway error codes into the channel error taxonomy.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

use crate::channel::{ChannelClient, Message};
use crate::error::ChannelError;

/// Per-request timeout for gateway calls.
const GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the channel gateway.
pub struct TelegramGateway {
    base_url: String,
    api_id: i64,
    api_hash: SecretString,
    client: reqwest::Client,
}

impl TelegramGateway {
    pub fn new(base_url: impl Into<String>, api_id: i64, api_hash: SecretString) -> Self {
        let client = reqwest::Client::builder()
            .timeout(GATEWAY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_id,
            api_hash,
            client,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    /// POST a JSON body to a gateway method and decode the response,
    /// classifying transport and gateway errors.
    async fn call(
        &self,
        channel: &str,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .header("X-Api-Id", self.api_id.to_string())
            .header("X-Api-Hash", self.api_hash.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.to_string()))?;

        let status = resp.status();
        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidResponse(e.to_string()))?;

        if status.is_success() {
            return Ok(data);
        }

        let code = data
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string();

        Err(classify_gateway_error(channel, status.as_u16(), &code))
    }

    fn parse_messages(
        &self,
        channel: &str,
        data: &serde_json::Value,
    ) -> Result<Vec<Message>, ChannelError> {
        let items = data
            .get("messages")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| {
                ChannelError::InvalidResponse("response has no 'messages' array".into())
            })?;

        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            let Some(id) = item.get("id").and_then(serde_json::Value::as_i64) else {
                continue;
            };
            // Service messages (joins, pins) carry no text; skip them.
            let Some(text) = item.get("text").and_then(serde_json::Value::as_str) else {
                continue;
            };
            let date = item
                .get("date")
                .and_then(serde_json::Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            messages.push(Message {
                id,
                date,
                text: text.to_string(),
                channel: channel.to_string(),
            });
        }
        Ok(messages)
    }
}

#[async_trait]
impl ChannelClient for TelegramGateway {
    async fn search_messages(
        &self,
        channel: &str,
        phrase: &str,
        offset_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, ChannelError> {
        let body = serde_json::json!({
            "channel": channel,
            "query": phrase,
            "offset_id": offset_id.unwrap_or(0),
            "limit": limit,
        });
        let data = self.call(channel, "messages/search", body).await?;
        self.parse_messages(channel, &data)
    }

    async fn iter_messages(
        &self,
        channel: &str,
        offset_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Message>, ChannelError> {
        let body = serde_json::json!({
            "channel": channel,
            "offset_id": offset_id.unwrap_or(0),
            "limit": limit,
        });
        let data = self.call(channel, "messages/history", body).await?;
        self.parse_messages(channel, &data)
    }
}

/// Map a gateway error status + code into the channel taxonomy.
fn classify_gateway_error(channel: &str, status: u16, code: &str) -> ChannelError {
    if code.starts_with("SEARCH_") || status == 501 {
        return ChannelError::SearchUnsupported {
            channel: channel.to_string(),
            reason: if code.is_empty() {
                format!("HTTP {status}")
            } else {
                code.to_string()
            },
        };
    }

    // FLOOD_WAIT_<seconds> is Telegram's rate-limit signal.
    if let Some(secs) = code.strip_prefix("FLOOD_WAIT_") {
        return ChannelError::RateLimited {
            channel: channel.to_string(),
            retry_after: secs.parse().ok().map(Duration::from_secs),
        };
    }
    if status == 429 {
        return ChannelError::RateLimited {
            channel: channel.to_string(),
            retry_after: None,
        };
    }

    if status == 401 || status == 403 || code == "AUTH_KEY_UNREGISTERED" || code == "SESSION_EXPIRED"
    {
        return ChannelError::AuthFailed {
            channel: channel.to_string(),
            reason: if code.is_empty() {
                format!("HTTP {status}")
            } else {
                code.to_string()
            },
        };
    }

    ChannelError::Http(format!("gateway returned {status}: {code}"))
}
