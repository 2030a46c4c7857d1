//! In-process implementations of the collaborator ports.
//!
//! Used by the test suites and by embedders that want a chat running without
//! a backend. Each one has knobs for injecting failures.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::model::{
    ChatId, CurrentUser, Message, NewMessage, PresencePayload, PresenceRecord, PresenceStatus,
    SenderType,
};
use crate::ports::{
    IdentityProvider, MessageStore, PresenceDirectory, PushTransport, Subscription, SubscriptionId,
    TransportEvent,
};

const SUBSCRIPTION_BUFFER: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Transport
// =============================================================================

struct Subscriber {
    channel: String,
    tx: mpsc::Sender<TransportEvent>,
    presence: Option<PresencePayload>,
}

/// A broadcast that went through [`MemoryTransport`].
#[derive(Clone, Debug, PartialEq)]
pub struct SentBroadcast {
    pub channel: String,
    pub event: String,
    pub payload: Value,
}

struct TransportState {
    next_id: u64,
    subscribers: HashMap<SubscriptionId, Subscriber>,
    subscribe_calls: usize,
    fail_next: u32,
    hold_confirmations: bool,
    reject: bool,
    self_echo: bool,
    sent: Vec<SentBroadcast>,
}

/// Pub/sub hub. Every subscriber of a channel, the sender included,
/// receives each broadcast.
pub struct MemoryTransport {
    state: Mutex<TransportState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState {
                next_id: 0,
                subscribers: HashMap::new(),
                subscribe_calls: 0,
                fail_next: 0,
                hold_confirmations: false,
                reject: false,
                self_echo: true,
                sent: Vec::new(),
            }),
        }
    }

    /// The next `n` subscriptions are accepted and then closed at once.
    pub fn fail_next_subscriptions(&self, n: u32) {
        lock(&self.state).fail_next = n;
    }

    /// Leave new subscriptions unconfirmed.
    pub fn hold_confirmations(&self, hold: bool) {
        lock(&self.state).hold_confirmations = hold;
    }

    /// Make `subscribe` itself return an error.
    pub fn reject_subscriptions(&self, reject: bool) {
        lock(&self.state).reject = reject;
    }

    /// Whether a sender receives its own broadcasts.
    pub fn set_self_echo(&self, echo: bool) {
        lock(&self.state).self_echo = echo;
    }

    pub fn subscribe_calls(&self) -> usize {
        lock(&self.state).subscribe_calls
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.state)
            .subscribers
            .values()
            .filter(|s| s.channel == channel)
            .count()
    }

    /// Broadcasts sent through subscriptions, oldest first.
    pub fn sent(&self, channel: &str, event: &str) -> Vec<Value> {
        lock(&self.state)
            .sent
            .iter()
            .filter(|b| b.channel == channel && b.event == event)
            .map(|b| b.payload.clone())
            .collect()
    }

    /// Deliver an event from outside, e.g. a counterpart's client.
    pub fn publish(&self, channel: &str, event: &str, payload: Value) {
        let state = lock(&self.state);
        for sub in state.subscribers.values().filter(|s| s.channel == channel) {
            let _ = sub.tx.try_send(TransportEvent::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
    }

    /// Push a presence snapshot to every subscriber of `channel`.
    pub fn sync_presence(&self, channel: &str, roster: Vec<PresencePayload>) {
        let state = lock(&self.state);
        for sub in state.subscribers.values().filter(|s| s.channel == channel) {
            let _ = sub.tx.try_send(TransportEvent::PresenceSync(roster.clone()));
        }
    }

    /// Close every subscription on `channel`, as a server restart would.
    pub fn close_channel(&self, channel: &str, reason: &str) {
        let mut state = lock(&self.state);
        state.subscribers.retain(|_, sub| {
            if sub.channel != channel {
                return true;
            }
            let _ = sub.tx.try_send(TransportEvent::Closed {
                reason: reason.to_string(),
            });
            false
        });
    }

    fn fan_out_presence(state: &TransportState, channel: &str) {
        let roster: Vec<PresencePayload> = state
            .subscribers
            .values()
            .filter(|s| s.channel == channel)
            .filter_map(|s| s.presence.clone())
            .collect();
        for sub in state.subscribers.values().filter(|s| s.channel == channel) {
            let _ = sub.tx.try_send(TransportEvent::PresenceSync(roster.clone()));
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushTransport for MemoryTransport {
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut state = lock(&self.state);
        state.subscribe_calls += 1;
        if state.reject {
            bail!("subscription to {channel} rejected");
        }

        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        let (tx, events) = mpsc::channel(SUBSCRIPTION_BUFFER);

        if state.fail_next > 0 {
            state.fail_next -= 1;
            let _ = tx.try_send(TransportEvent::Closed {
                reason: "CHANNEL_ERROR".into(),
            });
            return Ok(Subscription { id, events });
        }

        if !state.hold_confirmations {
            let _ = tx.try_send(TransportEvent::Subscribed);
        }
        state.subscribers.insert(
            id,
            Subscriber {
                channel: channel.to_string(),
                tx,
                presence: None,
            },
        );
        Ok(Subscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(sub) = state.subscribers.remove(&id)
            && sub.presence.is_some()
        {
            Self::fan_out_presence(&state, &sub.channel);
        }
        Ok(())
    }

    async fn broadcast(&self, id: SubscriptionId, event: &str, payload: Value) -> Result<()> {
        let mut state = lock(&self.state);
        let channel = state
            .subscribers
            .get(&id)
            .map(|s| s.channel.clone())
            .ok_or_else(|| anyhow!("unknown subscription {id}"))?;
        state.sent.push(SentBroadcast {
            channel: channel.clone(),
            event: event.to_string(),
            payload: payload.clone(),
        });
        for (sub_id, sub) in state.subscribers.iter() {
            if sub.channel != channel || (*sub_id == id && !state.self_echo) {
                continue;
            }
            let _ = sub.tx.try_send(TransportEvent::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn track_presence(&self, id: SubscriptionId, payload: PresencePayload) -> Result<()> {
        let mut state = lock(&self.state);
        let sub = state
            .subscribers
            .get_mut(&id)
            .ok_or_else(|| anyhow!("unknown subscription {id}"))?;
        sub.presence = Some(payload);
        let channel = sub.channel.clone();
        Self::fan_out_presence(&state, &channel);
        Ok(())
    }
}

// =============================================================================
// Message store
// =============================================================================

#[derive(Default)]
struct StoreState {
    chats: HashMap<ChatId, Vec<Message>>,
    next_id: u64,
    last_created: Option<DateTime<Utc>>,
    create_calls: usize,
    mark_read_calls: Vec<Vec<String>>,
    mark_all_calls: Vec<(ChatId, SenderType)>,
    fail_creates: bool,
    fail_lists: bool,
    create_delay: Option<Duration>,
    list_delays: HashMap<ChatId, Duration>,
    list_calls: usize,
}

/// Message store keeping each chat sorted by creation time. Ids are
/// `msg-N`; timestamps are strictly increasing.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as if another client had written it.
    pub fn seed(&self, chat_id: &ChatId, msg: Message) {
        let mut state = lock(&self.state);
        let chat = state.chats.entry(chat_id.clone()).or_default();
        let at = chat.partition_point(|m| m.created_at <= msg.created_at);
        chat.insert(at, msg);
    }

    pub fn messages(&self, chat_id: &ChatId) -> Vec<Message> {
        lock(&self.state)
            .chats
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_creates(&self, fail: bool) {
        lock(&self.state).fail_creates = fail;
    }

    /// Make every insert take `delay` before it lands.
    pub fn delay_creates(&self, delay: Duration) {
        lock(&self.state).create_delay = Some(delay);
    }

    /// Make history fetches of `chat_id` take `delay`.
    pub fn delay_lists(&self, chat_id: &ChatId, delay: Duration) {
        lock(&self.state).list_delays.insert(chat_id.clone(), delay);
    }

    pub fn list_calls(&self) -> usize {
        lock(&self.state).list_calls
    }

    pub fn fail_lists(&self, fail: bool) {
        lock(&self.state).fail_lists = fail;
    }

    pub fn create_calls(&self) -> usize {
        lock(&self.state).create_calls
    }

    pub fn mark_read_calls(&self) -> Vec<Vec<String>> {
        lock(&self.state).mark_read_calls.clone()
    }

    pub fn mark_all_calls(&self) -> Vec<(ChatId, SenderType)> {
        lock(&self.state).mark_all_calls.clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_message(&self, new: NewMessage) -> Result<Message> {
        let delay = lock(&self.state).create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.create_calls += 1;
        if state.fail_creates {
            bail!("insert into order_chat_messages failed");
        }

        state.next_id += 1;
        let now = Utc::now();
        let created_at = match state.last_created {
            Some(last) if now <= last => last + ChronoDuration::milliseconds(1),
            _ => now,
        };
        state.last_created = Some(created_at);

        let msg = Message {
            id: format!("msg-{}", state.next_id),
            text: new.text,
            sender_id: new.sender_id,
            sender_type: new.sender_type,
            created_at,
            is_read: false,
            order_id: None,
            order_item_id: new.chat_id.as_str().to_string(),
            entry_id: None,
            client_ref: new.client_ref,
            is_temporary: false,
        };
        state
            .chats
            .entry(new.chat_id)
            .or_default()
            .push(msg.clone());
        Ok(msg)
    }

    async fn list_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>> {
        let delay = {
            let mut state = lock(&self.state);
            state.list_calls += 1;
            state.list_delays.get(chat_id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = lock(&self.state);
        if state.fail_lists {
            bail!("select from order_chat_messages failed");
        }
        Ok(state.chats.get(chat_id).cloned().unwrap_or_default())
    }

    async fn mark_read(&self, message_ids: &[String]) -> Result<()> {
        let mut state = lock(&self.state);
        state.mark_read_calls.push(message_ids.to_vec());
        for msg in state.chats.values_mut().flatten() {
            if message_ids.contains(&msg.id) {
                msg.is_read = true;
            }
        }
        Ok(())
    }

    async fn mark_all_read_for_chat(&self, chat_id: &ChatId, reader: SenderType) -> Result<()> {
        let mut state = lock(&self.state);
        state.mark_all_calls.push((chat_id.clone(), reader));
        if let Some(chat) = state.chats.get_mut(chat_id) {
            for msg in chat.iter_mut().filter(|m| m.sender_type != reader) {
                msg.is_read = true;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Presence directory
// =============================================================================

#[derive(Default)]
struct PresenceState {
    rosters: HashMap<ChatId, Vec<PresenceRecord>>,
    heartbeats: HashMap<String, usize>,
    history: HashMap<String, Vec<PresenceStatus>>,
    fail: bool,
}

#[derive(Default)]
pub struct MemoryPresence {
    state: Mutex<PresenceState>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_roster(&self, chat_id: &ChatId, roster: Vec<PresenceRecord>) {
        lock(&self.state).rosters.insert(chat_id.clone(), roster);
    }

    pub fn fail_requests(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }

    pub fn heartbeats(&self, user_id: &str) -> usize {
        lock(&self.state)
            .heartbeats
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    /// Every status set for `user_id`, oldest first.
    pub fn status_history(&self, user_id: &str) -> Vec<PresenceStatus> {
        lock(&self.state)
            .history
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PresenceDirectory for MemoryPresence {
    async fn fetch_roster(&self, chat_id: &ChatId) -> Result<Vec<PresenceRecord>> {
        let state = lock(&self.state);
        if state.fail {
            bail!("presence directory unavailable");
        }
        Ok(state.rosters.get(chat_id).cloned().unwrap_or_default())
    }

    async fn set_status(&self, user_id: &str, status: PresenceStatus) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail {
            bail!("presence directory unavailable");
        }
        state
            .history
            .entry(user_id.to_string())
            .or_default()
            .push(status);
        Ok(())
    }

    async fn heartbeat(&self, user_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail {
            bail!("presence directory unavailable");
        }
        *state.heartbeats.entry(user_id.to_string()).or_default() += 1;
        Ok(())
    }
}

// =============================================================================
// Identity
// =============================================================================

/// Identity provider answering with a fixed user, or failing.
pub struct StaticIdentity {
    user: Option<CurrentUser>,
}

impl StaticIdentity {
    pub fn new(user: CurrentUser) -> Self {
        Self { user: Some(user) }
    }

    pub fn admin(id: &str) -> Self {
        Self::new(CurrentUser {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            is_admin: true,
        })
    }

    pub fn customer(id: &str) -> Self {
        Self::new(CurrentUser {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            is_admin: false,
        })
    }

    /// Every lookup fails, as with an expired session.
    pub fn signed_out() -> Self {
        Self { user: None }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Result<CurrentUser> {
        self.user.clone().ok_or_else(|| anyhow!("no authenticated user"))
    }
}
