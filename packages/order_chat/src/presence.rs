//! Presence: who is in a chat right now, and the local user's global status.
//!
//! [`PresenceTracker`] keeps the per-chat roster. Push-channel presence syncs
//! replace it wholesale; a periodic pull from the presence directory replaces
//! it again so a missed sync frame cannot leave stale entries around.
//!
//! [`GlobalPresence`] is cross-chat: one per client, owned by the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::PresenceConfig;
use crate::error::{ChatError, ChatResult};
use crate::model::{ChatId, PresencePayload, PresenceRecord, PresenceStatus};
use crate::ports::PresenceDirectory;
use crate::timer::Periodic;

#[derive(Debug)]
pub enum PresenceSignal {
    Roster(ChatResult<Vec<PresenceRecord>>),
}

pub struct PresenceTracker {
    chat_id: ChatId,
    self_id: String,
    roster: HashMap<String, PresenceRecord>,
    directory: Arc<dyn PresenceDirectory>,
    config: PresenceConfig,
    poll: Periodic,
    signals: mpsc::Sender<PresenceSignal>,
}

impl PresenceTracker {
    pub fn new(
        chat_id: ChatId,
        self_id: String,
        directory: Arc<dyn PresenceDirectory>,
        config: PresenceConfig,
        signals: mpsc::Sender<PresenceSignal>,
    ) -> Self {
        Self {
            chat_id,
            self_id,
            roster: HashMap::new(),
            directory,
            config,
            poll: Periodic::new(),
            signals,
        }
    }

    /// Start the self-heal roster poll.
    pub fn start(&mut self) {
        let directory = self.directory.clone();
        let chat_id = self.chat_id.clone();
        let signals = self.signals.clone();
        self.poll
            .start(self.config.roster_poll_interval, false, move || {
                let directory = directory.clone();
                let chat_id = chat_id.clone();
                let signals = signals.clone();
                async move {
                    let result = directory
                        .fetch_roster(&chat_id)
                        .await
                        .map_err(|e| ChatError::Presence(format!("{e:#}")));
                    let _ = signals.send(PresenceSignal::Roster(result)).await;
                }
            });
    }

    pub fn stop(&mut self) {
        self.poll.stop();
    }

    /// Replace the roster with a snapshot pushed by the transport.
    /// Returns true if the counterpart-online answer changed.
    pub fn on_presence_sync(&mut self, roster: Vec<PresencePayload>) -> bool {
        self.replace(roster.into_iter().map(PresenceRecord::from).collect())
    }

    /// Returns true if the counterpart-online answer changed.
    pub fn handle_signal(&mut self, signal: PresenceSignal) -> bool {
        match signal {
            PresenceSignal::Roster(Ok(records)) => self.replace(records),
            PresenceSignal::Roster(Err(e)) => {
                warn!(chat_id = %self.chat_id, error = %e, "roster poll failed");
                false
            }
        }
    }

    /// Anyone other than the local user is online or typing.
    pub fn other_users_online(&self) -> bool {
        self.roster
            .values()
            .any(|r| r.user_id != self.self_id && r.status.is_present())
    }

    pub fn roster(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<_> = self.roster.values().cloned().collect();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }

    /// Payload the session tracks on the channel for the local user.
    pub fn self_payload(&self, status: PresenceStatus) -> PresencePayload {
        PresencePayload {
            user_id: self.self_id.clone(),
            status,
            online_at: Utc::now(),
        }
    }

    fn replace(&mut self, records: Vec<PresenceRecord>) -> bool {
        let before = self.other_users_online();
        let mut roster: HashMap<String, PresenceRecord> = HashMap::new();
        // several tabs of one user collapse into the most present record
        for record in records {
            match roster.get(&record.user_id) {
                Some(existing) if rank(existing) >= rank(&record) => {}
                _ => {
                    roster.insert(record.user_id.clone(), record);
                }
            }
        }
        self.roster = roster;
        let after = self.other_users_online();
        if before != after {
            debug!(chat_id = %self.chat_id, counterpart_online = after, "presence changed");
        }
        before != after
    }
}

fn rank(record: &PresenceRecord) -> (u8, chrono::DateTime<Utc>) {
    let status = match record.status {
        PresenceStatus::Typing => 3,
        PresenceStatus::Online => 2,
        PresenceStatus::Idle => 1,
        PresenceStatus::Offline => 0,
    };
    (status, record.last_seen)
}

/// The local user's cross-chat status: online while a chat is open and the
/// view is visible, idle while hidden, offline after teardown.
pub struct GlobalPresence {
    directory: Arc<dyn PresenceDirectory>,
    heartbeat_interval: std::time::Duration,
    user_id: Option<String>,
    status: PresenceStatus,
    heartbeat: Periodic,
}

impl GlobalPresence {
    pub fn new(directory: Arc<dyn PresenceDirectory>, config: &PresenceConfig) -> Self {
        Self {
            directory,
            heartbeat_interval: config.heartbeat_interval,
            user_id: None,
            status: PresenceStatus::Offline,
            heartbeat: Periodic::new(),
        }
    }

    pub fn status(&self) -> PresenceStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.user_id.is_some()
    }

    /// Mark `user_id` online and start heartbeating. No-op when already active.
    pub fn activate(&mut self, user_id: &str) {
        if self.user_id.as_deref() == Some(user_id) {
            return;
        }
        self.deactivate();
        self.user_id = Some(user_id.to_string());
        self.set_status(PresenceStatus::Online);
    }

    /// Visibility change of the hosting view.
    pub fn set_visible(&mut self, visible: bool) {
        if self.user_id.is_none() {
            return;
        }
        let status = if visible {
            PresenceStatus::Online
        } else {
            PresenceStatus::Idle
        };
        self.set_status(status);
    }

    /// Mark offline without waiting for the directory.
    pub fn deactivate(&mut self) {
        if self.user_id.is_none() {
            return;
        }
        self.set_status(PresenceStatus::Offline);
        self.user_id = None;
    }

    fn set_status(&mut self, status: PresenceStatus) {
        let Some(user_id) = self.user_id.clone() else {
            return;
        };
        if self.status == status {
            return;
        }
        self.status = status;

        // fire-and-forget; may run during teardown outside a runtime
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let directory = self.directory.clone();
            let uid = user_id.clone();
            runtime.spawn(async move {
                if let Err(e) = directory.set_status(&uid, status).await {
                    warn!(user_id = %uid, ?status, error = %e, "presence update failed");
                }
            });
        }

        if status == PresenceStatus::Online {
            let directory = self.directory.clone();
            self.heartbeat
                .start(self.heartbeat_interval, false, move || {
                    let directory = directory.clone();
                    let user_id = user_id.clone();
                    async move {
                        if let Err(e) = directory.heartbeat(&user_id).await {
                            warn!(user_id = %user_id, error = %e, "presence heartbeat failed");
                        }
                    }
                });
        } else {
            self.heartbeat.stop();
        }
    }
}

impl Drop for GlobalPresence {
    fn drop(&mut self) {
        self.deactivate();
    }
}
