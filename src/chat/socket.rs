//! Chat WebSocket connection manager.
//!
//! Owns one socket at a time and drives the lifecycle state machine:
//! `Idle -> Connecting -> Open -> Closing -> Closed`. A fresh connection
//! is built for every attempt; nothing survives a dead socket except the
//! retry counter. Retries are immediate and bounded in count, not time,
//! so a persistent outage surfaces quickly through the terminal-failure
//! signal instead of retrying forever silently.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::chat::message::{InboundMessage, parse_envelope};
use crate::config::Config;
use crate::relay::stats::RelayStats;

// ============================================================================
// Public types
// ============================================================================

/// Connection lifecycle state, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Bounded reconnect policy. Counts attempts, never delays them.
#[derive(Debug)]
pub struct RetryPolicy {
    enabled: bool,
    /// `-1` means unlimited.
    max_retries: i32,
    attempted: u32,
}

/// What to do after a connection went down.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryAction {
    /// Reconnect immediately; carries the attempt number.
    Retry(u32),
    /// Recovery disabled or budget exhausted: signal terminal failure.
    GiveUp,
}

impl RetryPolicy {
    pub fn new(enabled: bool, max_retries: i32) -> Self {
        Self {
            enabled,
            max_retries,
            attempted: 0,
        }
    }

    /// A handshake succeeded: the budget starts over.
    pub fn on_connected(&mut self) {
        self.attempted = 0;
    }

    /// Decide the response to a failure and account for it.
    pub fn next(&mut self) -> RetryAction {
        if !self.enabled {
            return RetryAction::GiveUp;
        }
        if self.max_retries >= 0 && self.attempted >= self.max_retries as u32 {
            return RetryAction::GiveUp;
        }
        self.attempted += 1;
        RetryAction::Retry(self.attempted)
    }
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid origin header: {0}")]
    Origin(#[from] tungstenite::http::header::InvalidHeaderValue),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

// ============================================================================
// ChatSocket
// ============================================================================

/// How a connection ended. Clean and unclean closes are treated the same
/// for retry purposes; only the log classification differs.
enum Disconnect {
    /// We closed the socket ourselves; no reconnect.
    Deliberate,
    Clean { code: u16 },
    Unclean { reason: String },
    ConnectFailed { reason: String },
}

struct SocketConfig {
    endpoint: String,
    uid: String,
    secret: String,
    origin: String,
    room_id: String,
    recovery_enabled: bool,
    max_retries: i32,
    heartbeat_interval: std::time::Duration,
    pong_timeout: std::time::Duration,
}

/// The connection task. Consumed by [`ChatSocket::run`].
pub struct ChatSocket {
    cfg: SocketConfig,
    inbound: mpsc::Sender<InboundMessage>,
    outbound: mpsc::Receiver<String>,
    outbound_open: bool,
    state: watch::Sender<ConnectionState>,
    stats: Arc<RelayStats>,
    shutdown: CancellationToken,
    terminal: mpsc::Sender<()>,
}

impl ChatSocket {
    pub fn new(
        config: &Config,
        inbound: mpsc::Sender<InboundMessage>,
        outbound: mpsc::Receiver<String>,
        state: watch::Sender<ConnectionState>,
        stats: Arc<RelayStats>,
        shutdown: CancellationToken,
        terminal: mpsc::Sender<()>,
    ) -> Self {
        Self {
            cfg: SocketConfig {
                endpoint: config.chat.endpoint.clone(),
                uid: config.chat.uid.clone(),
                secret: config.chat.secret.clone(),
                origin: config.chat.origin.clone(),
                room_id: config.chat.room_id.clone(),
                recovery_enabled: config.chat.recovery.enabled,
                max_retries: config.chat.recovery.max_retries,
                heartbeat_interval: config.chat.heartbeat_interval(),
                pong_timeout: config.chat.pong_timeout(),
            },
            inbound,
            outbound,
            outbound_open: true,
            state,
            stats,
            shutdown,
            terminal,
        }
    }

    /// Drive the connection until deliberate shutdown or terminal failure.
    pub async fn run(mut self) {
        let mut policy = RetryPolicy::new(self.cfg.recovery_enabled, self.cfg.max_retries);
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            let disconnect = self.run_connection(&mut policy).await;
            self.set_state(ConnectionState::Closed);
            match disconnect {
                Disconnect::Deliberate => {
                    info!("Chat socket closed deliberately");
                    break;
                }
                Disconnect::Clean { code } => {
                    info!(code, "Connection closed cleanly");
                }
                Disconnect::Unclean { reason } => {
                    warn!(%reason, "Connection died");
                }
                Disconnect::ConnectFailed { reason } => {
                    warn!(%reason, "Connection attempt failed");
                }
            }
            match policy.next() {
                RetryAction::Retry(attempt) => {
                    info!(attempt, "Attempting to reconnect chat socket");
                }
                RetryAction::GiveUp => {
                    error!("Recovery disabled or retry budget exhausted, signaling terminal failure");
                    let _ = self.terminal.send(()).await;
                    break;
                }
            }
        }
        self.set_state(ConnectionState::Closed);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn build_request(&self) -> Result<tungstenite::handshake::client::Request, SocketError> {
        let mut url = Url::parse(&self.cfg.endpoint)?;
        url.query_pairs_mut()
            .append_pair("uid", &self.cfg.uid)
            .append_pair("secret", &self.cfg.secret);
        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_str(&self.cfg.origin)?);
        Ok(request)
    }

    /// One full connection: handshake, pumps, heartbeat. Returns how it ended.
    async fn run_connection(&mut self, policy: &mut RetryPolicy) -> Disconnect {
        let request = match self.build_request() {
            Ok(r) => r,
            Err(e) => {
                return Disconnect::ConnectFailed {
                    reason: e.to_string(),
                };
            }
        };
        let (stream, _response) = match connect_async(request).await {
            Ok(pair) => pair,
            Err(e) => {
                return Disconnect::ConnectFailed {
                    reason: e.to_string(),
                };
            }
        };
        info!("Chat WebSocket connected");
        policy.on_connected();
        self.set_state(ConnectionState::Open);

        let (mut write, mut read) = stream.split();
        let mut heartbeat = time::interval(self.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // A pong must arrive before this deadline or a miss is recorded.
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.set_state(ConnectionState::Closing);
                    let _ = write.send(Message::Close(None)).await;
                    return Disconnect::Deliberate;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                        return Disconnect::Unclean { reason: format!("ping failed: {e}") };
                    }
                    self.stats.incr_pings();
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.cfg.pong_timeout);
                    }
                }
                _ = async {
                    match pong_deadline {
                        Some(deadline) => time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    // Missed heartbeat: observability only, not a reconnect.
                    self.stats.incr_missed_pongs();
                    warn!(missed = self.stats.missed_pongs(), "No pong within timeout window");
                    pong_deadline = None;
                }
                frame = self.outbound.recv(), if self.outbound_open => {
                    match frame {
                        Some(text) => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                return Disconnect::Unclean { reason: format!("send failed: {e}") };
                            }
                        }
                        None => self.outbound_open = false,
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                        Some(Ok(Message::Ping(payload))) => {
                            debug!("[PING] from server");
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!("[PONG]");
                            self.stats.incr_pongs();
                            pong_deadline = None;
                        }
                        Some(Ok(Message::Close(close))) => {
                            return match close {
                                Some(frame) => Disconnect::Clean { code: frame.code.into() },
                                None => Disconnect::Unclean { reason: "close without frame".to_string() },
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Disconnect::Unclean { reason: e.to_string() };
                        }
                        None => {
                            return Disconnect::Unclean { reason: "stream ended".to_string() };
                        }
                    }
                }
            }
        }
    }

    async fn handle_text(&self, raw: &str) {
        match parse_envelope(raw, &self.cfg.room_id) {
            Ok(messages) => {
                for msg in messages {
                    debug!(id = %msg.id, seq = msg.sequence_number, "Received chat message");
                    if self.inbound.send(msg).await.is_err() {
                        warn!("Inbound channel closed, dropping chat message");
                    }
                }
            }
            Err(e) => {
                // Malformed frames are dropped, never fatal.
                warn!(error = %e, "Failed to parse inbound frame");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_gives_up_after_budget() {
        // max_retries = 2: two retries are granted, the third failure is terminal.
        let mut policy = RetryPolicy::new(true, 2);
        assert_eq!(policy.next(), RetryAction::Retry(1));
        assert_eq!(policy.next(), RetryAction::Retry(2));
        assert_eq!(policy.next(), RetryAction::GiveUp);
    }

    #[test]
    fn test_retry_policy_disabled() {
        let mut policy = RetryPolicy::new(false, 25);
        assert_eq!(policy.next(), RetryAction::GiveUp);
    }

    #[test]
    fn test_retry_policy_unlimited() {
        let mut policy = RetryPolicy::new(true, -1);
        for attempt in 1..=1000 {
            assert_eq!(policy.next(), RetryAction::Retry(attempt));
        }
    }

    #[test]
    fn test_retry_policy_resets_on_connect() {
        let mut policy = RetryPolicy::new(true, 1);
        assert_eq!(policy.next(), RetryAction::Retry(1));
        policy.on_connected();
        assert_eq!(policy.next(), RetryAction::Retry(1));
        assert_eq!(policy.next(), RetryAction::GiveUp);
    }

    #[test]
    fn test_zero_budget_fails_immediately() {
        let mut policy = RetryPolicy::new(true, 0);
        assert_eq!(policy.next(), RetryAction::GiveUp);
    }
}
