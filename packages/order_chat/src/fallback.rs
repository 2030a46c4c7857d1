//! FallbackPoller: pull-based sync while the push channel is unavailable.
//!
//! Results are posted back to the session and merged through the same
//! dedup path as push traffic, so a message delivered by both paths is
//! applied once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::config::FallbackConfig;
use crate::error::{ChatError, ChatResult};
use crate::model::{ChatId, Message};
use crate::ports::MessageStore;
use crate::timer::Periodic;

#[derive(Debug)]
pub enum FallbackSignal {
    Polled(ChatResult<Vec<Message>>),
}

pub struct FallbackPoller {
    chat_id: ChatId,
    store: Arc<dyn MessageStore>,
    config: FallbackConfig,
    cursor: watch::Receiver<Option<DateTime<Utc>>>,
    poll: Periodic,
    activations: u32,
    signals: mpsc::Sender<FallbackSignal>,
}

impl FallbackPoller {
    pub fn new(
        chat_id: ChatId,
        store: Arc<dyn MessageStore>,
        config: FallbackConfig,
        cursor: watch::Receiver<Option<DateTime<Utc>>>,
        signals: mpsc::Sender<FallbackSignal>,
    ) -> Self {
        Self {
            chat_id,
            store,
            config,
            cursor,
            poll: Periodic::new(),
            activations: 0,
            signals,
        }
    }

    pub fn is_running(&self) -> bool {
        self.poll.is_running()
    }

    /// How many times polling was switched on.
    pub fn activations(&self) -> u32 {
        self.activations
    }

    /// Start polling. Returns false if already running.
    pub fn start(&mut self) -> bool {
        if self.poll.is_running() {
            return false;
        }
        self.activations += 1;
        info!(
            chat_id = %self.chat_id,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "fallback polling started"
        );

        let store = self.store.clone();
        let chat_id = self.chat_id.clone();
        let cursor = self.cursor.clone();
        let signals = self.signals.clone();
        self.poll.start(self.config.poll_interval, true, move || {
            let since = *cursor.borrow();
            fetch(store.clone(), chat_id.clone(), since, signals.clone())
        });
        true
    }

    /// One catch-up fetch from the cursor, e.g. right after a reconnect.
    pub fn poll_once(&self) {
        let since = *self.cursor.borrow();
        tokio::spawn(fetch(
            self.store.clone(),
            self.chat_id.clone(),
            since,
            self.signals.clone(),
        ));
    }

    /// Stop polling. Returns false if it was not running.
    pub fn stop(&mut self) -> bool {
        if !self.poll.is_running() {
            return false;
        }
        self.poll.stop();
        info!(chat_id = %self.chat_id, "fallback polling stopped");
        true
    }
}

async fn fetch(
    store: Arc<dyn MessageStore>,
    chat_id: ChatId,
    since: Option<DateTime<Utc>>,
    signals: mpsc::Sender<FallbackSignal>,
) {
    let result = match since {
        Some(since) => store.list_messages_since(&chat_id, since).await,
        None => store.list_messages(&chat_id).await,
    }
    .map_err(ChatError::persistence);
    if let Ok(batch) = &result {
        debug!(chat_id = %chat_id, fetched = batch.len(), "poll tick");
    }
    let _ = signals.send(FallbackSignal::Polled(result)).await;
}
