//! ChatOrchestrator: the registry of open chat sessions.
//!
//! At most one session exists per chat id. Opening an id that is already
//! open, or still opening, hands back that session instead of stacking a
//! second subscription. Opens of different ids never wait on each other.
//! The orchestrator also owns the user's global presence, which stays
//! online while at least one chat is open.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info};

use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::model::{Actor, ChatId};
use crate::ports::Collaborators;
use crate::presence::GlobalPresence;
use crate::session::{ChatHandle, open_session};

/// Registry slot of one chat. Empty while the session is being opened.
type SessionSlot = Arc<OnceCell<ChatHandle>>;

fn is_live(slot: &SessionSlot) -> bool {
    slot.get().is_none_or(|handle| !handle.is_closed())
}

pub struct ChatOrchestrator {
    collaborators: Collaborators,
    config: ChatConfig,
    sessions: RwLock<HashMap<ChatId, SessionSlot>>,
    global_presence: Mutex<GlobalPresence>,
}

impl ChatOrchestrator {
    pub fn new(collaborators: Collaborators, config: ChatConfig) -> Self {
        let global_presence = GlobalPresence::new(collaborators.presence.clone(), &config.presence);
        Self {
            collaborators,
            config,
            sessions: RwLock::new(HashMap::new()),
            global_presence: Mutex::new(global_presence),
        }
    }

    /// Open `chat_id`, or return the session already open for it.
    pub async fn open(&self, chat_id: ChatId) -> ChatResult<ChatHandle> {
        let slot = {
            let mut sessions = self.sessions.write().await;
            let live = sessions.get(&chat_id).filter(|slot| is_live(slot)).cloned();
            live.unwrap_or_else(|| {
                let slot = SessionSlot::default();
                sessions.insert(chat_id.clone(), slot.clone());
                slot
            })
        };
        if let Some(handle) = slot.get() {
            debug!(chat_id = %chat_id, "reusing open session");
            return Ok(handle.clone());
        }

        // concurrent opens of the same id wait here for the first one
        match slot.get_or_try_init(|| self.start_session(chat_id.clone())).await {
            Ok(handle) => Ok(handle.clone()),
            Err(e) => {
                let mut sessions = self.sessions.write().await;
                if sessions
                    .get(&chat_id)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && !slot.initialized())
                {
                    sessions.remove(&chat_id);
                }
                Err(e)
            }
        }
    }

    async fn start_session(&self, chat_id: ChatId) -> ChatResult<ChatHandle> {
        let user = self
            .collaborators
            .identity
            .current_user()
            .await
            .map_err(ChatError::auth)?;
        let handle = open_session(chat_id, &user, &self.collaborators, &self.config).await?;
        self.global_presence.lock().await.activate(&user.id);
        Ok(handle)
    }

    /// The live session for `chat_id`, if any.
    pub async fn get(&self, chat_id: &ChatId) -> Option<ChatHandle> {
        self.sessions
            .read()
            .await
            .get(chat_id)
            .and_then(|slot| slot.get())
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Ids of the chats with a live session, sorted.
    pub async fn open_chats(&self) -> Vec<ChatId> {
        let mut ids: Vec<ChatId> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.get().is_some_and(|h| !h.is_closed()))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Close and forget `chat_id`. Returns false if it was not open.
    pub async fn close(&self, chat_id: &ChatId) -> bool {
        let (handle, now_empty) = {
            let mut sessions = self.sessions.write().await;
            // sessions closed through their own handle
            sessions.retain(|_, slot| is_live(slot));
            let handle = sessions.get(chat_id).and_then(|slot| slot.get()).cloned();
            if handle.is_some() {
                sessions.remove(chat_id);
            }
            (handle, sessions.is_empty())
        };
        if let Some(handle) = &handle {
            handle.close().await;
        }
        if now_empty {
            self.global_presence.lock().await.deactivate();
        }
        handle.is_some()
    }

    /// Visibility of the hosting view: idle while hidden, online again on return.
    pub async fn set_visible(&self, visible: bool) {
        self.global_presence.lock().await.set_visible(visible);
    }

    /// Mark everything the current user received in `chat_id` as read,
    /// whether or not the chat is open.
    pub async fn mark_chat_read(&self, chat_id: &ChatId) -> ChatResult<()> {
        if let Some(handle) = self.get(chat_id).await {
            handle.mark_as_read().await?;
        }
        let user = self
            .collaborators
            .identity
            .current_user()
            .await
            .map_err(ChatError::auth)?;
        let reader = Actor::from_user(&user).sender_type;
        self.collaborators
            .store
            .mark_all_read_for_chat(chat_id, reader)
            .await
            .map_err(ChatError::persistence)
    }

    /// Close every session and go offline.
    pub async fn shutdown(&self) {
        let handles: Vec<ChatHandle> = self
            .sessions
            .write()
            .await
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();
        let count = handles.len();
        join_all(handles.iter().map(|h| h.close())).await;
        self.global_presence.lock().await.deactivate();
        info!(closed = count, "chat orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryPresence, MemoryStore, MemoryTransport, StaticIdentity};
    use crate::model::{PresenceStatus, SenderType};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        transport: Arc<MemoryTransport>,
        presence: Arc<MemoryPresence>,
        orchestrator: ChatOrchestrator,
    }

    fn fixture(identity: StaticIdentity) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(MemoryTransport::new());
        let presence = Arc::new(MemoryPresence::new());
        let orchestrator = ChatOrchestrator::new(
            Collaborators {
                store: store.clone(),
                transport: transport.clone(),
                identity: Arc::new(identity),
                presence: presence.clone(),
            },
            ChatConfig::default(),
        );
        Fixture {
            store,
            transport,
            presence,
            orchestrator,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_reuses_the_session() {
        let f = fixture(StaticIdentity::admin("admin-1"));
        let chat = ChatId::new("item-1");

        let first = f.orchestrator.open(chat.clone()).await.unwrap();
        let second = f.orchestrator.open(chat.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.transport.subscribe_calls(), 1);
        assert_eq!(f.transport.subscriber_count("order-chat:item-1"), 1);
        assert_eq!(first.chat_id(), second.chat_id());
        assert_eq!(f.orchestrator.open_chats().await, vec![chat]);
    }

    #[tokio::test(start_paused = true)]
    async fn signed_out_user_cannot_open() {
        let f = fixture(StaticIdentity::signed_out());
        let err = f.orchestrator.open(ChatId::new("item-1")).await.err().unwrap();
        assert_eq!(err.error_code(), "auth");
        assert!(f.orchestrator.open_chats().await.is_empty());
        assert_eq!(f.transport.subscribe_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn last_close_goes_offline() {
        let f = fixture(StaticIdentity::admin("admin-1"));
        let a = ChatId::new("item-1");
        let b = ChatId::new("item-2");
        f.orchestrator.open(a.clone()).await.unwrap();
        f.orchestrator.open(b.clone()).await.unwrap();

        assert!(f.orchestrator.close(&a).await);
        assert!(!f.orchestrator.close(&a).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.presence.status_history("admin-1"), vec![PresenceStatus::Online]);

        f.orchestrator.close(&b).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            f.presence.status_history("admin-1"),
            vec![PresenceStatus::Online, PresenceStatus::Offline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_is_replaced_on_open() {
        let f = fixture(StaticIdentity::admin("admin-1"));
        let chat = ChatId::new("item-1");
        let first = f.orchestrator.open(chat.clone()).await.unwrap();
        first.close().await;

        let second = f.orchestrator.open(chat).await.unwrap();
        assert!(!second.is_closed());
        assert_eq!(f.transport.subscribe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_open_does_not_block_other_chats() {
        let f = fixture(StaticIdentity::admin("admin-1"));
        let slow = ChatId::new("item-slow");
        let fast = ChatId::new("item-fast");
        f.store.delay_lists(&slow, Duration::from_secs(60));

        let others = async {
            let handle = tokio::time::timeout(Duration::from_secs(1), f.orchestrator.open(fast.clone()))
                .await
                .expect("fast open waited on the slow one")
                .unwrap();
            let chats = tokio::time::timeout(Duration::from_millis(500), f.orchestrator.open_chats())
                .await
                .expect("registry read waited on the slow open");
            (handle, chats)
        };
        let (slow_handle, (fast_handle, chats)) = tokio::join!(f.orchestrator.open(slow.clone()), others);

        assert_eq!(chats, vec![fast.clone()]);
        assert_eq!(fast_handle.chat_id(), &fast);
        assert_eq!(slow_handle.unwrap().chat_id(), &slow);
        assert_eq!(f.orchestrator.open_chats().await, vec![fast, slow]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_opens_share_one_session() {
        let f = fixture(StaticIdentity::admin("admin-1"));
        let chat = ChatId::new("item-1");
        f.store.delay_lists(&chat, Duration::from_secs(5));

        let (a, b) = tokio::join!(
            f.orchestrator.open(chat.clone()),
            f.orchestrator.open(chat.clone())
        );
        a.unwrap();
        b.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.store.list_calls(), 1);
        assert_eq!(f.transport.subscribe_calls(), 1);
        assert_eq!(f.orchestrator.open_chats().await, vec![chat]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_leaves_no_slot() {
        let f = fixture(StaticIdentity::admin("admin-1"));
        f.store.fail_lists(true);
        let chat = ChatId::new("item-1");
        assert!(f.orchestrator.open(chat.clone()).await.is_err());
        assert!(f.orchestrator.get(&chat).await.is_none());

        f.store.fail_lists(false);
        f.orchestrator.open(chat.clone()).await.unwrap();
        assert_eq!(f.orchestrator.open_chats().await, vec![chat]);
    }

    #[tokio::test(start_paused = true)]
    async fn session_closed_by_its_handle_is_pruned() {
        let f = fixture(StaticIdentity::admin("admin-1"));
        let chat = ChatId::new("item-1");
        let handle = f.orchestrator.open(chat.clone()).await.unwrap();
        handle.close().await;

        assert!(f.orchestrator.open_chats().await.is_empty());
        assert!(f.orchestrator.get(&chat).await.is_none());
        assert!(!f.orchestrator.close(&chat).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            f.presence.status_history("admin-1"),
            vec![PresenceStatus::Online, PresenceStatus::Offline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mark_chat_read_uses_reader_role() {
        let f = fixture(StaticIdentity::admin("admin-1"));
        let chat = ChatId::new("item-9");
        f.orchestrator.mark_chat_read(&chat).await.unwrap();
        assert_eq!(f.store.mark_all_calls(), vec![(chat, SenderType::Admin)]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_everything() {
        let f = fixture(StaticIdentity::admin("admin-1"));
        let a = f.orchestrator.open(ChatId::new("item-1")).await.unwrap();
        let b = f.orchestrator.open(ChatId::new("item-2")).await.unwrap();

        f.orchestrator.shutdown().await;
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(f.orchestrator.open_chats().await.is_empty());
        assert_eq!(f.transport.subscriber_count("order-chat:item-1"), 0);
    }
}
