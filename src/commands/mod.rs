//! In-chat commands.
//!
//! Faction members drive the relay from inside the chat room with
//! `@`-prefixed commands. The router gets first refusal on every inbound
//! message; it returns `true` only when the message should be swallowed
//! instead of mirrored. Most commands are deliberately still mirrored so
//! the Discord side sees who asked for what.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::ChatHandle;
use crate::chat::message::InboundMessage;
use crate::discord::Webhook;
use crate::relay::banker::{Admission, BankerQueue, format_remaining, mentions_amount};
use crate::relay::dispatch::CommandDispatch;
use crate::relay::queue::DeliveryQueue;
use crate::relay::stats::RelayStats;

/// Synthetic sender id used by the local debug listener; always privileged.
pub const DEV_SENDER_ID: &str = "dev";

const HELP_TEXT: &str = "\
**@help** — this message\n\
**@banker <amount>** — ping the bankers with a withdrawal request\n\
**@queue** — pending banker requests (admin)\n\
**@stats** — relay counters (admin)\n\
**@terminate** — shut the relay down (admin)";

pub struct CommandRouter {
    chat: ChatHandle,
    webhook: Arc<Webhook>,
    banker: Option<Arc<BankerQueue>>,
    banker_mention: String,
    stats: Arc<RelayStats>,
    queue: Arc<DeliveryQueue>,
    admins: Vec<String>,
    shutdown: CancellationToken,
}

impl CommandRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chat: ChatHandle,
        webhook: Arc<Webhook>,
        banker: Option<Arc<BankerQueue>>,
        banker_mention: String,
        stats: Arc<RelayStats>,
        queue: Arc<DeliveryQueue>,
        admins: Vec<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            chat,
            webhook,
            banker,
            banker_mention,
            stats,
            queue,
            admins,
            shutdown,
        }
    }

    fn is_privileged(&self, sender_id: &str) -> bool {
        sender_id == DEV_SENDER_ID || self.admins.iter().any(|a| a == sender_id)
    }

    async fn help(&self) {
        if let Err(e) = self.webhook.send_embed("Relay commands", HELP_TEXT).await {
            warn!(error = %e, "Failed to post help");
        }
        self.chat
            .send_chat_only("Command list posted in Discord.")
            .await;
    }

    async fn banker(&self, msg: &InboundMessage) {
        let Some(queue) = &self.banker else {
            return;
        };
        if !mentions_amount(&msg.text) {
            self.chat
                .send_chat_only(&format!(
                    "{}, please include an amount (a number, 'balance' or 'everything').",
                    msg.sender_name
                ))
                .await;
            return;
        }
        match queue.try_admit(&msg.sender_id) {
            Admission::Held { remaining } => {
                self.chat
                    .send_chat_only(&format!(
                        "{}, you already have a pending request. Try again in {}.",
                        msg.sender_name,
                        format_remaining(remaining)
                    ))
                    .await;
            }
            Admission::Admitted => {
                let ping = format!(
                    "{} **{}** [{}] requests: {}",
                    self.banker_mention, msg.sender_name, msg.sender_id, msg.text
                );
                if let Err(e) = self.webhook.send_banker(&ping).await {
                    warn!(error = %e, "Failed to forward banker request");
                    return;
                }
                info!(sender = %msg.sender_name, "Banker request forwarded");
                self.chat
                    .send_chat_only(&format!(
                        "{}, the bankers have been notified.",
                        msg.sender_name
                    ))
                    .await;
            }
        }
    }

    async fn queue_report(&self) {
        let pending = self.banker.as_ref().map(|q| q.pending()).unwrap_or(0);
        let depth = self.queue.depth().await;
        info!(banker_pending = pending, relay_depth = depth, "Queue report");
        self.chat
            .send_chat_only(&format!(
                "{pending} pending banker request(s), {depth} message(s) queued."
            ))
            .await;
    }

    async fn stats_report(&self) {
        let snapshot = self.stats.snapshot();
        let description = format!(
            "forwarded: {}\nduplicates: {}\npings/pongs: {}/{} ({} missed)\nmax queue depth: {}\nup since: {}",
            snapshot.forwarded,
            snapshot.duplicates,
            snapshot.pings,
            snapshot.pongs,
            snapshot.missed_pongs,
            snapshot.max_queue_depth,
            snapshot.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        );
        if let Err(e) = self.webhook.send_embed("Relay stats", &description).await {
            warn!(error = %e, "Failed to post stats");
        }
    }
}

#[async_trait]
impl CommandDispatch for CommandRouter {
    async fn dispatch(&self, msg: &InboundMessage) -> bool {
        let Some(command) = normalize(&msg.text) else {
            return false;
        };
        match command.as_str() {
            "@help" => {
                self.help().await;
                false
            }
            "@banker" => {
                self.banker(msg).await;
                false
            }
            "@queue" | "@stats" | "@terminate" => {
                if !self.is_privileged(&msg.sender_id) {
                    warn!(sender = %msg.sender_name, id = %msg.sender_id, command = %command,
                        "Privileged command denied");
                    return false;
                }
                match command.as_str() {
                    "@queue" => self.queue_report().await,
                    "@stats" => self.stats_report().await,
                    _ => {
                        info!(sender = %msg.sender_name, "Termination requested from chat");
                        self.shutdown.cancel();
                        return true;
                    }
                }
                false
            }
            other => {
                debug!(command = %other, "Unrecognized command, mirroring as chat");
                false
            }
        }
    }
}

/// Extract the command token from a message, if it has one.
///
/// The first whitespace token is lowercased; a leading backslash (mobile
/// clients escape `@`) is stripped and `!` is accepted as an alias for `@`.
pub fn normalize(text: &str) -> Option<String> {
    let first = text.split_whitespace().next()?;
    let mut token = first.to_lowercase();
    if let Some(stripped) = token.strip_prefix('\\') {
        token = stripped.to_string();
    }
    if let Some(stripped) = token.strip_prefix('!') {
        token = format!("@{stripped}");
    }
    if token.starts_with('@') && token.len() > 1 {
        Some(token)
    } else {
        None
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_extracts_command_token() {
        assert_eq!(normalize("@banker 100m please"), Some("@banker".to_string()));
        assert_eq!(normalize("@HELP"), Some("@help".to_string()));
        assert_eq!(normalize("\\@stats"), Some("@stats".to_string()));
        assert_eq!(normalize("!terminate"), Some("@terminate".to_string()));
    }

    #[test]
    fn test_normalize_rejects_plain_chat() {
        assert_eq!(normalize("hello there"), None);
        assert_eq!(normalize("email@example.com first"), None);
        assert_eq!(normalize("@"), None);
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("   "), None);
    }
}
