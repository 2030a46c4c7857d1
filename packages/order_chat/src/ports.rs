//! Collaborators the chat core talks to: message storage, the pub/sub
//! transport, the identity provider and the presence directory.
//!
//! Implementations return `anyhow::Result`; the core maps failures into
//! [`ChatError`](crate::ChatError) at the call site.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::model::{
    ChatId, CurrentUser, Message, NewMessage, PresencePayload, PresenceRecord, PresenceStatus,
    SenderType,
};

/// Persistent message store (remote database behind a request/response API).
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, new: NewMessage) -> Result<Message>;

    /// All messages of a chat, oldest first.
    async fn list_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>>;

    /// Messages created at or after `since`, oldest first.
    async fn list_messages_since(
        &self,
        chat_id: &ChatId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let mut all = self.list_messages(chat_id).await?;
        all.retain(|m| m.created_at >= since);
        Ok(all)
    }

    async fn mark_read(&self, message_ids: &[String]) -> Result<()>;

    /// Mark every message `reader` received in this chat as read.
    async fn mark_all_read_for_chat(&self, chat_id: &ChatId, reader: SenderType) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Events delivered on a channel subscription.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The server accepted the subscription
    Subscribed,
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
    /// Full presence snapshot for the channel
    PresenceSync(Vec<PresencePayload>),
    /// Channel closed or errored; no further events follow
    Closed { reason: String },
}

/// A live subscription. Dropping `events` does not unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Pub/sub push channel.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Request a subscription. Confirmation arrives later as
    /// [`TransportEvent::Subscribed`] on the returned receiver.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    async fn broadcast(
        &self,
        id: SubscriptionId,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<()>;

    async fn track_presence(&self, id: SubscriptionId, payload: PresencePayload) -> Result<()>;
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Result<CurrentUser>;
}

/// Pull-based presence: per-chat roster plus the user's global status.
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    async fn fetch_roster(&self, chat_id: &ChatId) -> Result<Vec<PresenceRecord>>;

    async fn set_status(&self, user_id: &str, status: PresenceStatus) -> Result<()>;

    async fn heartbeat(&self, user_id: &str) -> Result<()>;
}

/// Everything a chat session needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MessageStore>,
    pub transport: Arc<dyn PushTransport>,
    pub identity: Arc<dyn IdentityProvider>,
    pub presence: Arc<dyn PresenceDirectory>,
}
