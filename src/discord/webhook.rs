//! Webhook sender: the outbound POST collaborator.
//!
//! Mirrored messages, embeds, and the banker channel forwards all go out
//! through here. Rate limiting is observed, not enforced: the delivery
//! queue already trickles forwards, so a 429 is logged with the rate
//! headers and the message is dropped (at-most-once).

use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discord::client::{DiscordError, check_response_error};
use crate::relay::dispatch::Outbound;

const EMBED_COLOR: u32 = 3_447_003;

#[derive(Default)]
struct NoticeState {
    connect_sent: bool,
    disconnect_sent: bool,
}

pub struct Webhook {
    http: reqwest::Client,
    url: String,
    archive_url: Option<String>,
    banker_url: Option<String>,
    app_name: String,
    avatar_url: String,
    track_rate: bool,
    silent_restarts: bool,
    notices: Mutex<NoticeState>,
}

impl Webhook {
    pub fn from_config(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.discord.active_webhook().to_string(),
            archive_url: config.discord.archive_webhook_url.clone(),
            banker_url: config.discord.banker.webhook_url.clone(),
            app_name: config.relay.app_name.clone(),
            avatar_url: config.discord.avatar_url.clone(),
            track_rate: config.relay.track_rate,
            silent_restarts: config.relay.silent_restarts,
            notices: Mutex::new(NoticeState::default()),
        }
    }

    async fn post(&self, url: &str, body: Value) -> Result<(), DiscordError> {
        let response = self.http.post(url).json(&body).send().await?;
        if response.status().as_u16() == 429 || self.track_rate {
            log_rate_headers(response.headers());
        }
        if let Some(e) = check_response_error(&response) {
            return Err(e);
        }
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DiscordError::Api {
                status: status.as_u16(),
                message,
            });
        }
        debug!(status = status.as_u16(), "Webhook delivered");
        Ok(())
    }

    /// Post plain content to the primary webhook.
    pub async fn send(&self, text: &str) -> Result<(), DiscordError> {
        self.post(&self.url, json!({ "content": text })).await
    }

    /// Post an embed to the primary webhook, signed with the app identity.
    pub async fn send_embed(&self, title: &str, description: &str) -> Result<(), DiscordError> {
        let body = json!({
            "username": self.app_name,
            "avatar_url": self.avatar_url,
            "content": "",
            "embeds": [{
                "title": title,
                "description": description,
                "color": EMBED_COLOR,
                "thumbnail": { "url": self.avatar_url },
            }],
        });
        self.post(&self.url, body).await
    }

    /// Forward to the banker channel, falling back to the primary webhook
    /// when no dedicated one is configured.
    pub async fn send_banker(&self, text: &str) -> Result<(), DiscordError> {
        let url = self.banker_url.as_deref().unwrap_or(&self.url);
        self.post(url, json!({ "content": text })).await
    }

    /// Announce the relay is live. Latched: sent once per connect
    /// transition, re-armed by a disconnect notice.
    pub async fn notice_connected(&self) {
        if self.silent_restarts {
            return;
        }
        {
            let mut notices = self.notices.lock().unwrap();
            if notices.connect_sent {
                return;
            }
            notices.connect_sent = true;
            notices.disconnect_sent = false;
        }
        if let Err(e) = self.send("```Chat mirroring is up and active!```").await {
            warn!(error = %e, "Failed to send connect notice");
        }
    }

    /// Announce the relay is going away; same latching as the connect notice.
    pub async fn notice_disconnected(&self) {
        if self.silent_restarts {
            return;
        }
        {
            let mut notices = self.notices.lock().unwrap();
            if notices.disconnect_sent {
                return;
            }
            notices.disconnect_sent = true;
            notices.connect_sent = false;
        }
        if let Err(e) = self
            .send("```NOTE: Chat mirroring is going away for a bit for maintenance. Be right back!```")
            .await
        {
            warn!(error = %e, "Failed to send disconnect notice");
        }
    }
}

#[async_trait]
impl Outbound for Webhook {
    async fn forward(&self, text: &str) -> Result<(), DiscordError> {
        self.send(text).await
    }

    async fn archive(&self, text: &str) {
        let Some(url) = &self.archive_url else {
            return;
        };
        if let Err(e) = self.post(url, json!({ "content": text })).await {
            warn!(error = %e, "Archive copy failed");
        }
    }
}

fn log_rate_headers(headers: &HeaderMap) {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string()
    };
    info!(
        limit = %get("x-ratelimit-limit"),
        remaining = %get("x-ratelimit-remaining"),
        reset = %get("x-ratelimit-reset"),
        reset_after = %get("x-ratelimit-reset-after"),
        "Rate limit headers"
    );
}
