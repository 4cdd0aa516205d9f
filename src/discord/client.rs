//! Discord channel REST client.
//!
//! The purge scheduler talks to the channel API through the [`ChannelApi`]
//! trait so tests can substitute a scripted implementation. [`RestClient`]
//! is the production implementation, authenticated with the bot token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const API_BASE: &str = "https://discord.com/api/v10";

/// Check an HTTP response for rate-limit errors, returning `RateLimit` for 429.
pub fn check_response_error(response: &reqwest::Response) -> Option<DiscordError> {
    if response.status().is_success() {
        return None;
    }
    if response.status().as_u16() == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Some(DiscordError::RateLimit { retry_after });
    }
    None
}

/// Errors from the Discord HTTP surface.
#[derive(Debug, Error)]
pub enum DiscordError {
    /// HTTP request failed (transport).
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// API returned an error response; permanent, never retried.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Rate limited (429); retried after the server-specified cooldown.
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimit { retry_after: Option<u64> },
}

/// The slice of a channel message the purge scheduler cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
}

/// Channel history and deletion operations.
#[async_trait]
pub trait ChannelApi: Send + Sync {
    /// Fetch up to `limit` messages older than `before` (newest first).
    async fn messages_before(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, DiscordError>;

    /// Delete a batch of messages in one call. The platform rejects
    /// batches of one and anything older than the bulk ceiling.
    async fn delete_bulk(&self, channel_id: &str, ids: &[String]) -> Result<(), DiscordError>;

    async fn delete_one(&self, channel_id: &str, id: &str) -> Result<(), DiscordError>;
}

pub struct RestClient {
    http: reqwest::Client,
    token: String,
    base: String,
}

impl RestClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
            base: API_BASE.to_string(),
        }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn into_api_error(response: reqwest::Response) -> DiscordError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        DiscordError::Api { status, message }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, DiscordError> {
        if let Some(e) = check_response_error(&response) {
            return Err(e);
        }
        if !response.status().is_success() {
            return Err(Self::into_api_error(response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl ChannelApi for RestClient {
    async fn messages_before(
        &self,
        channel_id: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChannelMessage>, DiscordError> {
        let mut request = self
            .http
            .get(format!("{}/channels/{}/messages", self.base, channel_id))
            .header("Authorization", self.auth())
            .query(&[("limit", limit.to_string())]);
        if let Some(before) = before {
            request = request.query(&[("before", before)]);
        }
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn delete_bulk(&self, channel_id: &str, ids: &[String]) -> Result<(), DiscordError> {
        let response = self
            .http
            .post(format!(
                "{}/channels/{}/messages/bulk-delete",
                self.base, channel_id
            ))
            .header("Authorization", self.auth())
            .json(&json!({ "messages": ids }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_one(&self, channel_id: &str, id: &str) -> Result<(), DiscordError> {
        let response = self
            .http
            .delete(format!(
                "{}/channels/{}/messages/{}",
                self.base, channel_id, id
            ))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_message_deserializes_discord_shape() {
        let raw = r#"{
            "id": "923122850691440641",
            "type": 0,
            "content": "_syntaxera_",
            "channel_id": "888867831725318176",
            "pinned": false,
            "timestamp": "2021-12-22T08:00:38.398000+00:00"
        }"#;
        let msg: ChannelMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.id, "923122850691440641");
        assert!(!msg.pinned);
        assert_eq!(msg.timestamp.timestamp(), 1640160038);
    }

    #[test]
    fn test_error_display() {
        let e = DiscordError::Api {
            status: 400,
            message: "Invalid Form Body".to_string(),
        };
        assert!(e.to_string().contains("status 400"));

        let e = DiscordError::RateLimit {
            retry_after: Some(3),
        };
        assert!(e.to_string().contains("rate limited"));
    }
}
