use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }
}

// ============================================================================
// ChatConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_endpoint")]
    pub endpoint: String,
    /// User id the feed was issued for. Sent as a query parameter.
    #[serde(default)]
    pub uid: String,
    /// Session secret issued by the feed. Sent as a query parameter.
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_chat_origin")]
    pub origin: String,
    /// Room whose messages are mirrored. Everything else is ignored.
    #[serde(default = "default_room_id")]
    pub room_id: String,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_seconds: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint: default_chat_endpoint(),
            uid: String::new(),
            secret: String::new(),
            origin: default_chat_origin(),
            room_id: default_room_id(),
            recovery: RecoveryConfig::default(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            pong_timeout_seconds: default_pong_timeout(),
        }
    }
}

impl ChatConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_seconds)
    }
}

fn default_chat_endpoint() -> String {
    "wss://ws-chat.torn.com/chat/ws".to_string()
}

fn default_chat_origin() -> String {
    "https://www.torn.com".to_string()
}

fn default_room_id() -> String {
    "Faction:8151".to_string()
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_pong_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

// ============================================================================
// RecoveryConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum reconnect attempts. `-1` means retry indefinitely.
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
        }
    }
}

fn default_max_retries() -> i32 {
    25
}

// ============================================================================
// RelayConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// How long a message sits in the delivery queue before forwarding.
    /// One message is drained per tick, so this is also the outbound rate.
    #[serde(default = "default_queue_delay")]
    pub queue_delay_ms: u64,
    /// Number of recent message ids kept for duplicate suppression.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// On-disk snapshot of the dedup window, loaded at startup and
    /// written at shutdown.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Copy forwarded messages to the archive webhook as well.
    #[serde(default = "default_true")]
    pub archive: bool,
    /// Log each suppressed duplicate instead of dropping silently.
    #[serde(default)]
    pub log_duplicates: bool,
    /// Allow chat messages to be interpreted as commands.
    #[serde(default = "default_true")]
    pub allow_chat_interaction: bool,
    /// Suppress the connect/disconnect notices to Discord.
    #[serde(default)]
    pub silent_restarts: bool,
    /// Log the rate-limit headers on every webhook response, not just 429s.
    #[serde(default)]
    pub track_rate: bool,
    /// Name the relay signs its own chat messages with. Used as a loop
    /// guard: messages carrying this prefix are never mirrored back.
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_delay_ms: default_queue_delay(),
            dedup_capacity: default_dedup_capacity(),
            snapshot_path: default_snapshot_path(),
            archive: true,
            log_duplicates: false,
            allow_chat_interaction: true,
            silent_restarts: false,
            track_rate: false,
            app_name: default_app_name(),
        }
    }
}

impl RelayConfig {
    pub fn queue_delay(&self) -> Duration {
        Duration::from_millis(self.queue_delay_ms)
    }

    /// The prefix this relay puts on its own chat messages.
    pub fn chat_prefix(&self) -> String {
        format!("...{} says: \"", self.app_name)
    }
}

fn default_queue_delay() -> u64 {
    2000
}

fn default_dedup_capacity() -> usize {
    1000
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("facrelay-dedup.json")
}

fn default_app_name() -> String {
    "FacRelay".to_string()
}

// ============================================================================
// DiscordConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DiscordConfig {
    /// Primary webhook messages are mirrored to.
    #[serde(default)]
    pub webhook_url: String,
    /// Alternate webhook used when `sandbox` is set.
    #[serde(default)]
    pub sandbox_webhook_url: Option<String>,
    #[serde(default)]
    pub sandbox: bool,
    /// Optional second channel that receives a copy of every forward.
    #[serde(default)]
    pub archive_webhook_url: Option<String>,
    #[serde(default)]
    pub banker: BankerConfig,
    /// Bot token for the channel REST API (history and deletion).
    #[serde(default)]
    pub bot_token: String,
    /// Channel the purge scheduler maintains.
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub purge: PurgeConfig,
    #[serde(default)]
    pub avatar_url: String,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            sandbox_webhook_url: None,
            sandbox: false,
            archive_webhook_url: None,
            banker: BankerConfig::default(),
            bot_token: String::new(),
            channel_id: String::new(),
            purge: PurgeConfig::default(),
            avatar_url: String::new(),
        }
    }
}

impl DiscordConfig {
    /// The webhook actually used for forwards, honoring the sandbox switch.
    pub fn active_webhook(&self) -> &str {
        if self.sandbox {
            if let Some(url) = &self.sandbox_webhook_url {
                return url;
            }
        }
        &self.webhook_url
    }
}

// ============================================================================
// BankerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct BankerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Webhook the banker channel forwards go to.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Role mention prepended to banker forwards, e.g. `<@&657448...>`.
    #[serde(default)]
    pub mention: String,
    /// Minutes a sender must wait between mirrored banker requests.
    #[serde(default = "default_banker_cooldown")]
    pub cooldown_minutes: u64,
}

impl Default for BankerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            mention: String::new(),
            cooldown_minutes: default_banker_cooldown(),
        }
    }
}

impl BankerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_minutes * 60)
    }
}

fn default_banker_cooldown() -> u64 {
    10
}

// ============================================================================
// PurgeConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PurgeConfig {
    /// Hours between purge cycles. `0` disables purging.
    #[serde(default = "default_purge_interval")]
    pub interval_hours: u64,
    /// Messages younger than this are kept.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// The platform refuses bulk deletion beyond this age.
    #[serde(default = "default_bulk_ceiling_days")]
    pub bulk_ceiling_days: i64,
    /// History page size, also the bulk-delete batch limit.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_page_delay")]
    pub page_delay_ms: u64,
    /// Delay between bulk-delete chunks.
    #[serde(default = "default_chunk_stagger")]
    pub chunk_stagger_ms: u64,
    /// Delay between single deletions.
    #[serde(default = "default_single_delay")]
    pub single_delay_ms: u64,
    /// Rate-limit retries allowed per single deletion before dropping it.
    #[serde(default = "default_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_purge_interval(),
            retention_days: default_retention_days(),
            bulk_ceiling_days: default_bulk_ceiling_days(),
            page_size: default_page_size(),
            page_delay_ms: default_page_delay(),
            chunk_stagger_ms: default_chunk_stagger(),
            single_delay_ms: default_single_delay(),
            max_rate_limit_retries: default_rate_limit_retries(),
        }
    }
}

impl PurgeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 60 * 60)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn chunk_stagger(&self) -> Duration {
        Duration::from_millis(self.chunk_stagger_ms)
    }

    pub fn single_delay(&self) -> Duration {
        Duration::from_millis(self.single_delay_ms)
    }
}

fn default_purge_interval() -> u64 {
    2
}

fn default_retention_days() -> i64 {
    3
}

fn default_bulk_ceiling_days() -> i64 {
    14
}

fn default_page_size() -> usize {
    100
}

fn default_page_delay() -> u64 {
    1500
}

fn default_chunk_stagger() -> u64 {
    5000
}

fn default_single_delay() -> u64 {
    3000
}

fn default_rate_limit_retries() -> u32 {
    5
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Enable the debug HTTP listener.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8001
}

fn default_request_timeout() -> u64 {
    30
}

// ============================================================================
// CommandsConfig
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CommandsConfig {
    /// Sender ids allowed to run privileged commands.
    #[serde(default)]
    pub admins: Vec<String>,
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.chat.room_id, "Faction:8151");
        assert_eq!(config.chat.recovery.max_retries, 25);
        assert!(config.chat.recovery.enabled);
        assert_eq!(config.relay.queue_delay_ms, 2000);
        assert_eq!(config.relay.dedup_capacity, 1000);
        assert_eq!(config.discord.purge.interval_hours, 2);
        assert_eq!(config.discord.purge.bulk_ceiling_days, 14);
        assert_eq!(config.discord.purge.page_size, 100);
        assert_eq!(config.server.port, 8001);
        assert!(!config.server.enabled);
        assert!(config.commands.admins.is_empty());
    }

    #[test]
    fn test_chat_prefix() {
        let relay = RelayConfig::default();
        assert_eq!(relay.chat_prefix(), "...FacRelay says: \"");
    }

    #[test]
    fn test_active_webhook_honors_sandbox() {
        let mut discord = DiscordConfig {
            webhook_url: "https://example.com/live".to_string(),
            sandbox_webhook_url: Some("https://example.com/sandbox".to_string()),
            ..DiscordConfig::default()
        };
        assert_eq!(discord.active_webhook(), "https://example.com/live");
        discord.sandbox = true;
        assert_eq!(discord.active_webhook(), "https://example.com/sandbox");
        discord.sandbox_webhook_url = None;
        assert_eq!(discord.active_webhook(), "https://example.com/live");
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let missing_path = tmp_dir.path().join("missing-config.yaml");
        let config = Config::load(missing_path.to_str().unwrap()).await.unwrap();
        assert_eq!(config.relay.queue_delay_ms, 2000);
        assert_eq!(config.chat.recovery.max_retries, 25);
    }

    #[tokio::test]
    async fn test_load_valid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
chat:
  room_id: "Faction:1234"
  recovery:
    enabled: true
    max_retries: -1
relay:
  queue_delay_ms: 500
  dedup_capacity: 64
discord:
  webhook_url: "https://example.com/hook"
  purge:
    interval_hours: 6
    retention_days: 2
commands:
  admins: ["2100735"]
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(config.chat.room_id, "Faction:1234");
        assert_eq!(config.chat.recovery.max_retries, -1);
        assert_eq!(config.relay.queue_delay_ms, 500);
        assert_eq!(config.relay.dedup_capacity, 64);
        assert_eq!(config.discord.webhook_url, "https://example.com/hook");
        assert_eq!(config.discord.purge.interval_hours, 6);
        assert_eq!(config.discord.purge.retention_days, 2);
        assert_eq!(config.commands.admins, vec!["2100735".to_string()]);
    }

    #[tokio::test]
    async fn test_load_partial_yaml_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
relay:
  queue_delay_ms: 100
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(config.relay.queue_delay_ms, 100);
        assert_eq!(config.relay.dedup_capacity, 1000); // default
        assert_eq!(config.chat.heartbeat_interval_seconds, 60); // default
        assert_eq!(config.discord.purge.single_delay_ms, 3000); // default
    }

    #[tokio::test]
    async fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(file.path().to_str().unwrap()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_config_error_display() {
        let io_error = ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "test",
        ));
        assert!(io_error.to_string().contains("failed to read config file"));
    }
}
