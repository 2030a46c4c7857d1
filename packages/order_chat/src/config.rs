use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// File config (figment-deserialized from defaults / chat.toml / env vars)
// =============================================================================
//
//   chat.toml:   [connection]
//                max_attempts = 3
//
//   env var:     ORDER_CHAT_CONNECTION__MAX_ATTEMPTS=3   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatFileConfig {
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub sync: SyncFileConfig,
    #[serde(default)]
    pub typing: TypingFileConfig,
    #[serde(default)]
    pub presence: PresenceFileConfig,
    #[serde(default)]
    pub fallback: FallbackFileConfig,
}

/// Push channel tunables (`[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_subscribe_timeout_secs")]
    pub subscribe_timeout_secs: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
            max_attempts: default_max_attempts(),
            heartbeat_secs: default_heartbeat_secs(),
            subscribe_timeout_secs: default_subscribe_timeout_secs(),
        }
    }
}

/// Message sync tunables (`[sync]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncFileConfig {
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
}

impl Default for SyncFileConfig {
    fn default() -> Self {
        Self {
            confirm_timeout_secs: default_confirm_timeout_secs(),
        }
    }
}

/// Typing indicator tunables (`[typing]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypingFileConfig {
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_idle_stop_ms")]
    pub idle_stop_ms: u64,
    #[serde(default = "default_remote_ttl_ms")]
    pub remote_ttl_ms: u64,
}

impl Default for TypingFileConfig {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle_ms(),
            idle_stop_ms: default_idle_stop_ms(),
            remote_ttl_ms: default_remote_ttl_ms(),
        }
    }
}

/// Presence tunables (`[presence]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceFileConfig {
    #[serde(default = "default_roster_poll_secs")]
    pub roster_poll_secs: u64,
    #[serde(default = "default_presence_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for PresenceFileConfig {
    fn default() -> Self {
        Self {
            roster_poll_secs: default_roster_poll_secs(),
            heartbeat_secs: default_presence_heartbeat_secs(),
        }
    }
}

/// Polling fallback tunables (`[fallback]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FallbackFileConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for FallbackFileConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            grace_secs: default_grace_secs(),
        }
    }
}

fn default_reconnect_base_ms() -> u64 {
    5_000
}
fn default_reconnect_cap_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_heartbeat_secs() -> u64 {
    60
}
fn default_subscribe_timeout_secs() -> u64 {
    10
}
fn default_confirm_timeout_secs() -> u64 {
    10
}
fn default_throttle_ms() -> u64 {
    500
}
fn default_idle_stop_ms() -> u64 {
    3_000
}
fn default_remote_ttl_ms() -> u64 {
    3_000
}
fn default_roster_poll_secs() -> u64 {
    10
}
fn default_presence_heartbeat_secs() -> u64 {
    30
}
fn default_poll_interval_ms() -> u64 {
    2_000
}
fn default_grace_secs() -> u64 {
    10
}

/// Build a figment that layers: defaults → `config_file` (if any) → ORDER_CHAT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `ORDER_CHAT_CONNECTION__MAX_ATTEMPTS=3`  →  `connection.max_attempts = 3`
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(ChatFileConfig::default()));
    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("ORDER_CHAT_").split("__"))
}

// =============================================================================
// Runtime config (derived from ChatFileConfig)
// =============================================================================

#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
    pub typing: TypingConfig,
    pub presence: PresenceConfig,
    pub fallback: FallbackConfig,
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// First reconnect delay; doubles per failure
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// Failures tolerated before the channel gives up (state ERROR)
    pub max_attempts: u32,
    pub heartbeat_interval: Duration,
    /// How long to wait for the transport to confirm a subscription
    pub subscribe_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub confirm_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct TypingConfig {
    /// Minimum spacing between two `isTyping=true` broadcasts
    pub throttle: Duration,
    /// Local typing is stopped after this much keyboard silence
    pub idle_stop: Duration,
    /// Remote typing entries expire after this long without a refresh
    pub remote_ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct PresenceConfig {
    pub roster_poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct FallbackConfig {
    pub poll_interval: Duration,
    /// How long the channel may stay DISCONNECTED before polling kicks in
    pub grace: Duration,
}

impl ChatConfig {
    pub fn from_file(fc: &ChatFileConfig) -> Self {
        Self {
            connection: ConnectionConfig {
                reconnect_base: Duration::from_millis(fc.connection.reconnect_base_ms),
                reconnect_cap: Duration::from_millis(fc.connection.reconnect_cap_ms),
                max_attempts: fc.connection.max_attempts.max(1),
                heartbeat_interval: Duration::from_secs(fc.connection.heartbeat_secs),
                subscribe_timeout: Duration::from_secs(fc.connection.subscribe_timeout_secs),
            },
            sync: SyncConfig {
                confirm_timeout: Duration::from_secs(fc.sync.confirm_timeout_secs),
            },
            typing: TypingConfig {
                throttle: Duration::from_millis(fc.typing.throttle_ms),
                idle_stop: Duration::from_millis(fc.typing.idle_stop_ms),
                remote_ttl: Duration::from_millis(fc.typing.remote_ttl_ms),
            },
            presence: PresenceConfig {
                roster_poll_interval: Duration::from_secs(fc.presence.roster_poll_secs),
                heartbeat_interval: Duration::from_secs(fc.presence.heartbeat_secs),
            },
            fallback: FallbackConfig {
                poll_interval: Duration::from_millis(fc.fallback.poll_interval_ms),
                grace: Duration::from_secs(fc.fallback.grace_secs),
            },
        }
    }

    /// Load from an optional TOML file plus env overrides.
    pub fn load(config_file: Option<&Path>) -> anyhow::Result<Self> {
        let fc: ChatFileConfig = load_config(config_file).extract()?;
        Ok(Self::from_file(&fc))
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::from_file(&ChatFileConfig::default())
    }
}
