//! Chat data model and the wire shapes exchanged over the push channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Chat identifier. One chat exists per order item, so this is the order-item id.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the push channel scoped to this chat.
    pub fn channel_name(&self) -> String {
        format!("order-chat:{}", self.0)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Admin,
}

impl SenderType {
    pub fn counterpart(self) -> Self {
        match self {
            Self::User => Self::Admin,
            Self::Admin => Self::User,
        }
    }
}

/// A chat message, as stored and as broadcast.
///
/// `id` is the storage id once confirmed. Optimistic echoes carry a
/// `temp-` placeholder id and `is_temporary = true`; that flag never
/// travels over the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender_id: String,
    pub sender_type: SenderType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub order_id: Option<String>,
    pub order_item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    /// Correlation id generated by the sending client, echoed back on broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    #[serde(skip)]
    pub is_temporary: bool,
}

pub const TEMP_ID_PREFIX: &str = "temp-";

/// Input to `MessageStore::create_message`.
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub chat_id: ChatId,
    pub sender_id: String,
    pub sender_type: SenderType,
    pub text: String,
    pub client_ref: Option<String>,
}

/// Result of the identity lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentUser {
    pub id: String,
    pub email: String,
    pub is_admin: bool,
}

/// The local participant of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub sender_type: SenderType,
}

impl Actor {
    pub fn from_user(user: &CurrentUser) -> Self {
        Self {
            user_id: user.id.clone(),
            sender_type: if user.is_admin {
                SenderType::Admin
            } else {
                SenderType::User
            },
        }
    }

    /// True when `msg` was written by the other side of the chat.
    pub fn is_counterpart(&self, msg: &Message) -> bool {
        msg.sender_type == self.sender_type.counterpart()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Status line for the UI, if the state warrants one.
    pub fn status_text(self) -> Option<&'static str> {
        match self {
            Self::Connected => None,
            Self::Connecting => Some("Conectando..."),
            Self::Disconnected | Self::Reconnecting => {
                Some("Conexão perdida. Tentando reconectar...")
            }
            Self::Error => Some("Sem conexão em tempo real. Atualizando periodicamente."),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Backoff bookkeeping for the push channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempt: u32,
    pub next_delay: Duration,
}

impl ReconnectState {
    pub fn new(base: Duration) -> Self {
        Self {
            attempt: 0,
            next_delay: base,
        }
    }

    /// `min(base * 2^attempt, cap)`, saturating.
    pub fn delay_for(attempt: u32, base: Duration, cap: Duration) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        base.checked_mul(factor).unwrap_or(cap).min(cap)
    }

    /// Record one failure and return the delay to wait before the next try.
    pub fn advance(&mut self, base: Duration, cap: Duration) -> Duration {
        let delay = Self::delay_for(self.attempt, base, cap);
        self.attempt = self.attempt.saturating_add(1);
        self.next_delay = Self::delay_for(self.attempt, base, cap);
        delay
    }

    pub fn reset(&mut self, base: Duration) {
        *self = Self::new(base);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Typing,
    Idle,
    Offline,
}

impl PresenceStatus {
    /// Online and typing both count as "present in the chat".
    pub fn is_present(self) -> bool {
        matches!(self, Self::Online | Self::Typing)
    }
}

/// One roster entry per known user per chat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

/// `typing` broadcast payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: String,
    pub is_typing: bool,
    pub timestamp: DateTime<Utc>,
}

/// Payload tracked on the channel's presence state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_id: String,
    pub status: PresenceStatus,
    pub online_at: DateTime<Utc>,
}

impl From<PresencePayload> for PresenceRecord {
    fn from(p: PresencePayload) -> Self {
        Self {
            user_id: p.user_id,
            status: p.status,
            last_seen: p.online_at,
        }
    }
}

/// Broadcast event names used on the chat channel.
pub mod events {
    pub const MESSAGE: &str = "message";
    pub const TYPING: &str = "typing";
    pub const HEARTBEAT: &str = "heartbeat";
}
