//! MessageSynchronizer: the merged message list of one chat.
//!
//! Local sends appear immediately as temporary entries and are swapped for
//! the stored record when its broadcast echo (or a poll result) comes back.
//! Every confirmed id is applied at most once, whichever path delivers it.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{ChatError, ChatResult};
use crate::model::{Actor, ChatId, Message, NewMessage, TEMP_ID_PREFIX};
use crate::ports::MessageStore;
use crate::timer::KeyedTimers;

/// Results of background work started by the synchronizer.
#[derive(Debug)]
pub enum SyncSignal {
    Persisted {
        client_ref: String,
        result: ChatResult<Message>,
    },
    ConfirmTimeout {
        client_ref: String,
        generation: u64,
    },
}

/// What the session has to do after a [`SyncSignal`].
#[derive(Debug, PartialEq)]
pub enum SyncOutcome {
    /// Stored; broadcast this record so the other side sees it
    Persisted(Message),
    /// The send is dead and its temporary entry is gone
    SendFailed { client_ref: String, error: ChatError },
    Ignored,
}

/// How an incoming record was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// Already in the list
    Duplicate,
    /// Replaced the temporary entry of a local send
    Confirmed { client_ref: String },
    Appended { counterpart: bool },
}

/// A local send awaiting its echo.
#[derive(Debug, Clone)]
struct PendingSend {
    client_ref: String,
    temp_id: String,
    text: String,
    /// Storage id, once `create_message` returned
    stored_id: Option<String>,
}

pub struct MessageSynchronizer {
    chat_id: ChatId,
    actor: Actor,
    store: Arc<dyn MessageStore>,
    config: SyncConfig,
    messages: Vec<Message>,
    confirmed_ids: HashSet<String>,
    pending: Vec<PendingSend>,
    confirm_timers: KeyedTimers<String>,
    unread_count: usize,
    /// Ids already sent to `mark_read`
    read_submitted: HashSet<String>,
    cursor: watch::Sender<Option<DateTime<Utc>>>,
    signals: mpsc::Sender<SyncSignal>,
}

impl MessageSynchronizer {
    pub fn new(
        chat_id: ChatId,
        actor: Actor,
        store: Arc<dyn MessageStore>,
        config: SyncConfig,
        signals: mpsc::Sender<SyncSignal>,
    ) -> Self {
        let (cursor, _) = watch::channel(None);
        Self {
            chat_id,
            actor,
            store,
            config,
            messages: Vec::new(),
            confirmed_ids: HashSet::new(),
            pending: Vec::new(),
            confirm_timers: KeyedTimers::new(),
            unread_count: 0,
            read_submitted: HashSet::new(),
            cursor,
            signals,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn unread_count(&self) -> usize {
        self.unread_count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Creation time of the newest confirmed message, for incremental polling.
    pub fn cursor(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.cursor.subscribe()
    }

    /// Fetch the chat history and merge it in.
    ///
    /// Unread counterpart messages are counted and a best-effort mark-read is
    /// fired for them in the background.
    pub async fn load_history(&mut self) -> ChatResult<&[Message]> {
        let history = self
            .store
            .list_messages(&self.chat_id)
            .await
            .map_err(ChatError::persistence)?;
        let fetched = history.len();
        for msg in history {
            if self.confirmed_ids.contains(&msg.id) {
                continue;
            }
            self.confirmed_ids.insert(msg.id.clone());
            self.insert_sorted(msg);
        }
        self.advance_cursor();

        let unread: Vec<String> = self
            .messages
            .iter()
            .filter(|m| !m.is_temporary && !m.is_read && self.actor.is_counterpart(m))
            .map(|m| m.id.clone())
            .collect();
        self.unread_count = unread.len();
        info!(chat_id = %self.chat_id, fetched, unread = self.unread_count, "history loaded");

        self.submit_read(unread);
        Ok(&self.messages)
    }

    /// Optimistically append `text` and persist it in the background.
    /// Returns the correlation id of the send.
    pub fn send_message(&mut self, text: &str) -> ChatResult<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::Validation("message text is empty".into()));
        }

        let client_ref = Uuid::new_v4().to_string();
        let temp_id = format!("{TEMP_ID_PREFIX}{client_ref}");
        // never earlier than the tail, so appending keeps the list sorted
        let created_at = self
            .messages
            .last()
            .map_or_else(Utc::now, |last| last.created_at.max(Utc::now()));
        let temp = Message {
            id: temp_id.clone(),
            text: text.to_string(),
            sender_id: self.actor.user_id.clone(),
            sender_type: self.actor.sender_type,
            created_at,
            is_read: true,
            order_id: None,
            order_item_id: self.chat_id.as_str().to_string(),
            entry_id: None,
            client_ref: Some(client_ref.clone()),
            is_temporary: true,
        };
        self.messages.push(temp);
        self.pending.push(PendingSend {
            client_ref: client_ref.clone(),
            temp_id,
            text: text.to_string(),
            stored_id: None,
        });

        let new = NewMessage {
            chat_id: self.chat_id.clone(),
            sender_id: self.actor.user_id.clone(),
            sender_type: self.actor.sender_type,
            text: text.to_string(),
            client_ref: Some(client_ref.clone()),
        };
        let store = self.store.clone();
        let signals = self.signals.clone();
        let r = client_ref.clone();
        tokio::spawn(async move {
            let result = store
                .create_message(new)
                .await
                .map_err(ChatError::persistence);
            let _ = signals
                .send(SyncSignal::Persisted {
                    client_ref: r,
                    result,
                })
                .await;
        });

        self.confirm_timers.arm(
            client_ref.clone(),
            self.config.confirm_timeout,
            &self.signals,
            |client_ref, generation| SyncSignal::ConfirmTimeout {
                client_ref,
                generation,
            },
        );

        debug!(chat_id = %self.chat_id, client_ref = %client_ref, "message queued");
        Ok(client_ref)
    }

    pub fn handle_signal(&mut self, signal: SyncSignal) -> SyncOutcome {
        match signal {
            SyncSignal::Persisted { client_ref, result } => match result {
                Ok(mut stored) => {
                    if let Some(p) = self.pending.iter_mut().find(|p| p.client_ref == client_ref) {
                        p.stored_id = Some(stored.id.clone());
                    }
                    stored.client_ref = Some(client_ref);
                    SyncOutcome::Persisted(stored)
                }
                Err(error) => {
                    if !self.rollback(&client_ref) {
                        return SyncOutcome::Ignored;
                    }
                    warn!(chat_id = %self.chat_id, client_ref = %client_ref, error = %error, "send failed");
                    SyncOutcome::SendFailed { client_ref, error }
                }
            },
            SyncSignal::ConfirmTimeout {
                client_ref,
                generation,
            } => {
                if !self.confirm_timers.fire(&client_ref, generation) || !self.rollback(&client_ref)
                {
                    return SyncOutcome::Ignored;
                }
                warn!(chat_id = %self.chat_id, client_ref = %client_ref, "send not confirmed");
                SyncOutcome::SendFailed {
                    client_ref,
                    error: ChatError::UnconfirmedSend {
                        timeout: self.config.confirm_timeout,
                    },
                }
            }
        }
    }

    /// Merge one confirmed record from the push channel or the poller.
    pub fn apply_incoming(&mut self, mut msg: Message) -> Applied {
        if msg.id.starts_with(TEMP_ID_PREFIX) {
            debug!(chat_id = %self.chat_id, id = %msg.id, "ignoring unconfirmed record");
            return Applied::Duplicate;
        }
        if self.confirmed_ids.contains(&msg.id) {
            return Applied::Duplicate;
        }
        msg.is_temporary = false;

        if msg.sender_id == self.actor.user_id
            && let Some(index) = self.find_pending(&msg)
        {
            let pending = self.pending.remove(index);
            self.confirm_timers.cancel(&pending.client_ref);
            if let Some(at) = self.messages.iter().position(|m| m.id == pending.temp_id) {
                self.confirmed_ids.insert(msg.id.clone());
                self.replace_temporary(at, msg);
                self.advance_cursor();
                return Applied::Confirmed {
                    client_ref: pending.client_ref,
                };
            }
        }

        let counterpart = self.actor.is_counterpart(&msg);
        if counterpart && !msg.is_read {
            self.unread_count += 1;
        }
        self.confirmed_ids.insert(msg.id.clone());
        self.insert_sorted(msg);
        self.advance_cursor();
        Applied::Appended { counterpart }
    }

    /// Flag every counterpart message as read and submit the ids not yet sent.
    /// Returns how many ids were submitted.
    pub fn mark_as_read(&mut self) -> usize {
        let mut ids = Vec::new();
        for msg in self.messages.iter_mut() {
            if msg.is_temporary || msg.is_read || !self.actor.is_counterpart(msg) {
                continue;
            }
            msg.is_read = true;
            ids.push(msg.id.clone());
        }
        self.unread_count = 0;
        self.submit_read(ids)
    }

    /// Cancel every confirmation timer. Pending sends stay visible.
    pub fn shutdown(&mut self) {
        self.confirm_timers.clear();
    }

    fn submit_read(&mut self, ids: Vec<String>) -> usize {
        let ids: Vec<String> = ids
            .into_iter()
            .filter(|id| self.read_submitted.insert(id.clone()))
            .collect();
        if ids.is_empty() {
            return 0;
        }
        let count = ids.len();
        let store = self.store.clone();
        let chat_id = self.chat_id.clone();
        tokio::spawn(async move {
            if let Err(e) = store.mark_read(&ids).await {
                warn!(chat_id = %chat_id, count = ids.len(), error = %e, "mark read failed");
            }
        });
        count
    }

    /// Correlation id first, then the storage id, then sender + text.
    fn find_pending(&self, msg: &Message) -> Option<usize> {
        if let Some(client_ref) = &msg.client_ref
            && let Some(i) = self.pending.iter().position(|p| &p.client_ref == client_ref)
        {
            return Some(i);
        }
        if let Some(i) = self
            .pending
            .iter()
            .position(|p| p.stored_id.as_deref() == Some(msg.id.as_str()))
        {
            return Some(i);
        }
        if msg.client_ref.is_some() {
            // tagged for a send we no longer track
            return None;
        }
        self.pending
            .iter()
            .position(|p| p.stored_id.is_none() && p.text == msg.text)
    }

    fn rollback(&mut self, client_ref: &str) -> bool {
        let Some(index) = self.pending.iter().position(|p| p.client_ref == client_ref) else {
            return false;
        };
        let pending = self.pending.remove(index);
        self.confirm_timers.cancel(&pending.client_ref);
        self.messages.retain(|m| m.id != pending.temp_id);
        true
    }

    /// Put the stored record where the temporary entry was, unless its
    /// timestamp no longer fits between the neighbours there.
    fn replace_temporary(&mut self, at: usize, msg: Message) {
        let after_prev = at == 0 || self.messages[at - 1].created_at <= msg.created_at;
        let before_next = self
            .messages
            .get(at + 1)
            .is_none_or(|next| msg.created_at <= next.created_at);
        if after_prev && before_next {
            self.messages[at] = msg;
        } else {
            self.messages.remove(at);
            self.insert_sorted(msg);
        }
    }

    fn insert_sorted(&mut self, msg: Message) {
        let at = self
            .messages
            .partition_point(|m| m.created_at <= msg.created_at);
        self.messages.insert(at, msg);
    }

    fn advance_cursor(&self) {
        let newest = self
            .messages
            .iter()
            .filter(|m| !m.is_temporary)
            .map(|m| m.created_at)
            .max();
        self.cursor.send_if_modified(|current| {
            if newest > *current {
                *current = newest;
                true
            } else {
                false
            }
        });
    }
}
