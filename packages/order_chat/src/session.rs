//! One open chat: an actor task owning every component of the session.
//!
//! Callers talk to it through a [`ChatHandle`]. Commands, transport events
//! and timer expiries all arrive on channels drained by a single loop, so
//! session state is only ever touched by one task.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::connection::{ConnectionManager, ConnectionSignal, InboundEvent};
use crate::error::{ChatError, ChatResult};
use crate::fallback::{FallbackPoller, FallbackSignal};
use crate::model::{
    Actor, ChatId, ConnectionState, CurrentUser, Message, PresenceStatus, events,
};
use crate::ports::Collaborators;
use crate::presence::{PresenceSignal, PresenceTracker};
use crate::sync::{Applied, MessageSynchronizer, SyncOutcome, SyncSignal};
use crate::timer::DelayTimer;
use crate::typing::{TypingCoordinator, TypingOutcome, TypingSignal};

const COMMAND_BUFFER: usize = 32;
const SIGNAL_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

/// Notifications published to session subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum ChatEvent {
    /// Emitted once per state edge
    ConnectionChanged {
        state: ConnectionState,
        connected: bool,
    },
    MessagesChanged,
    UnreadChanged(usize),
    TypingChanged(Vec<String>),
    PresenceChanged {
        counterpart_online: bool,
    },
    FallbackChanged {
        active: bool,
    },
    Error {
        code: String,
        message: &'static str,
    },
}

impl ChatEvent {
    fn error(err: &ChatError) -> Self {
        Self::Error {
            code: err.error_code().to_string(),
            message: err.user_message(),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub chat_id: ChatId,
    pub state: ConnectionState,
    pub status_text: Option<&'static str>,
    pub messages: Vec<Message>,
    pub unread_count: usize,
    pub counterpart_online: bool,
    pub typing_users: Vec<String>,
    pub polling: bool,
    pub pending_sends: usize,
}

#[derive(Debug)]
enum SessionCommand {
    SendMessage {
        text: String,
        respond_to: oneshot::Sender<ChatResult<SendReceipt>>,
    },
    StartTyping,
    StopTyping,
    MarkAsRead {
        respond_to: oneshot::Sender<usize>,
    },
    Reconnect {
        respond_to: oneshot::Sender<ChatResult<()>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<ChatSnapshot>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// An accepted send. The temporary entry is already in the message list.
#[derive(Debug)]
pub struct SendReceipt {
    pub client_ref: String,
    confirmation: oneshot::Receiver<ChatResult<Message>>,
}

impl SendReceipt {
    /// Wait for the stored record, or for the reason the send was dropped.
    pub async fn confirmed(self) -> ChatResult<Message> {
        self.confirmation.await.unwrap_or(Err(ChatError::SessionClosed))
    }
}

/// Handle to a running chat session.
#[derive(Clone)]
pub struct ChatHandle {
    chat_id: ChatId,
    sender: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatHandle {
    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// True once the session task has exited.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn send_message(&self, text: &str) -> ChatResult<SendReceipt> {
        let (tx, rx) = oneshot::channel();
        self.command(SessionCommand::SendMessage {
            text: text.to_string(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }

    pub async fn start_typing(&self) -> ChatResult<()> {
        self.command(SessionCommand::StartTyping).await
    }

    pub async fn stop_typing(&self) -> ChatResult<()> {
        self.command(SessionCommand::StopTyping).await
    }

    /// Returns how many messages were newly submitted as read.
    pub async fn mark_as_read(&self) -> ChatResult<usize> {
        let (tx, rx) = oneshot::channel();
        self.command(SessionCommand::MarkAsRead { respond_to: tx })
            .await?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }

    /// Retry the push channel now, skipping any pending backoff.
    pub async fn reconnect(&self) -> ChatResult<()> {
        let (tx, rx) = oneshot::channel();
        self.command(SessionCommand::Reconnect { respond_to: tx })
            .await?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }

    pub async fn snapshot(&self) -> ChatResult<ChatSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.command(SessionCommand::Snapshot { respond_to: tx })
            .await?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }

    pub async fn status(&self) -> ChatResult<ConnectionState> {
        Ok(self.snapshot().await?.state)
    }

    pub async fn unread_count(&self) -> ChatResult<usize> {
        Ok(self.snapshot().await?.unread_count)
    }

    pub async fn messages(&self) -> ChatResult<Vec<Message>> {
        Ok(self.snapshot().await?.messages)
    }

    pub async fn is_counterpart_online(&self) -> ChatResult<bool> {
        Ok(self.snapshot().await?.counterpart_online)
    }

    /// Tear the session down. Every timer and the subscription are gone
    /// when this returns. Closing twice is fine.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Close { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    async fn command(&self, cmd: SessionCommand) -> ChatResult<()> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| ChatError::SessionClosed)
    }
}

/// Receiving ends drained by the session loop.
struct Inbox {
    commands: mpsc::Receiver<SessionCommand>,
    connection: mpsc::Receiver<ConnectionSignal>,
    sync: mpsc::Receiver<SyncSignal>,
    presence: mpsc::Receiver<PresenceSignal>,
    typing: mpsc::Receiver<TypingSignal>,
    fallback: mpsc::Receiver<FallbackSignal>,
    grace: mpsc::Receiver<u64>,
}

struct ChatSession {
    chat_id: ChatId,
    connection: ConnectionManager,
    sync: MessageSynchronizer,
    presence: PresenceTracker,
    typing: TypingCoordinator,
    fallback: FallbackPoller,
    /// Running while the channel is down and polling has not started yet
    grace: DelayTimer,
    grace_tx: mpsc::Sender<u64>,
    grace_period: std::time::Duration,
    /// Sends awaiting their stored record, by correlation id
    receipts: HashMap<String, oneshot::Sender<ChatResult<Message>>>,
    connected_once: bool,
    events: broadcast::Sender<ChatEvent>,
}

/// Open a session for `chat_id` as `user`: load history, then connect.
///
/// A history failure fails the open. A refused connection does not; the
/// session starts polling instead while reconnects continue in the background.
pub async fn open_session(
    chat_id: ChatId,
    user: &CurrentUser,
    collaborators: &Collaborators,
    config: &ChatConfig,
) -> ChatResult<ChatHandle> {
    let actor = Actor::from_user(user);
    let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let (connection_tx, connection_rx) = mpsc::channel(SIGNAL_BUFFER);
    let (sync_tx, sync_rx) = mpsc::channel(SIGNAL_BUFFER);
    let (presence_tx, presence_rx) = mpsc::channel(SIGNAL_BUFFER);
    let (typing_tx, typing_rx) = mpsc::channel(SIGNAL_BUFFER);
    let (fallback_tx, fallback_rx) = mpsc::channel(SIGNAL_BUFFER);
    let (grace_tx, grace_rx) = mpsc::channel(4);

    let sync = MessageSynchronizer::new(
        chat_id.clone(),
        actor.clone(),
        collaborators.store.clone(),
        config.sync.clone(),
        sync_tx,
    );
    let fallback = FallbackPoller::new(
        chat_id.clone(),
        collaborators.store.clone(),
        config.fallback.clone(),
        sync.cursor(),
        fallback_tx,
    );
    let mut session = ChatSession {
        connection: ConnectionManager::new(
            chat_id.clone(),
            collaborators.transport.clone(),
            config.connection.clone(),
            connection_tx,
            events.clone(),
        ),
        presence: PresenceTracker::new(
            chat_id.clone(),
            actor.user_id.clone(),
            collaborators.presence.clone(),
            config.presence.clone(),
            presence_tx,
        ),
        typing: TypingCoordinator::new(actor.user_id.clone(), config.typing.clone(), typing_tx),
        chat_id: chat_id.clone(),
        sync,
        fallback,
        grace: DelayTimer::new(),
        grace_tx,
        grace_period: config.fallback.grace,
        receipts: HashMap::new(),
        connected_once: false,
        events: events.clone(),
    };

    let loaded = session.sync.load_history().await?.len();
    info!(chat_id = %chat_id, user_id = %actor.user_id, messages = loaded, "chat opened");

    // the directory answers even while the push channel is out
    session.presence.start();

    let before = session.connection.state();
    if let Err(e) = session.connection.connect().await {
        warn!(chat_id = %chat_id, error = %e, "realtime unavailable, polling instead");
        session.start_fallback();
    }
    session.on_connection(before).await;

    let inbox = Inbox {
        commands,
        connection: connection_rx,
        sync: sync_rx,
        presence: presence_rx,
        typing: typing_rx,
        fallback: fallback_rx,
        grace: grace_rx,
    };
    tokio::spawn(session.run(inbox));

    Ok(ChatHandle {
        chat_id,
        sender,
        events,
    })
}

impl ChatSession {
    async fn run(mut self, mut inbox: Inbox) {
        debug!(chat_id = %self.chat_id, "session loop started");
        loop {
            tokio::select! {
                cmd = inbox.commands.recv() => {
                    let Some(cmd) = cmd else {
                        // every handle dropped
                        self.shutdown().await;
                        break;
                    };
                    if let Some(respond_to) = self.handle_command(cmd).await {
                        self.shutdown().await;
                        inbox.commands.close();
                        let _ = respond_to.send(());
                        break;
                    }
                }
                Some(signal) = inbox.connection.recv() => {
                    let before = self.connection.state();
                    if let Some(event) = self.connection.handle_signal(signal).await {
                        self.handle_inbound(event).await;
                    }
                    self.on_connection(before).await;
                }
                Some(signal) = inbox.sync.recv() => self.handle_sync(signal).await,
                Some(signal) = inbox.presence.recv() => {
                    if self.presence.handle_signal(signal) {
                        self.emit_presence();
                    }
                }
                Some(signal) = inbox.typing.recv() => {
                    let outcome = self.typing.handle_signal(signal);
                    self.apply_typing(outcome).await;
                }
                Some(FallbackSignal::Polled(result)) = inbox.fallback.recv() => match result {
                    Ok(batch) => {
                        for msg in batch {
                            self.apply_message(msg);
                        }
                    }
                    Err(e) => warn!(chat_id = %self.chat_id, error = %e, "poll failed"),
                },
                Some(generation) = inbox.grace.recv() => {
                    if self.grace.fire(generation) && !self.connection.is_connected() {
                        info!(chat_id = %self.chat_id, state = %self.connection.state(), "grace window over");
                        self.start_fallback();
                    }
                }
            }
        }
        debug!(chat_id = %self.chat_id, "session loop stopped");
    }

    /// Returns the close responder when the loop has to stop.
    async fn handle_command(&mut self, cmd: SessionCommand) -> Option<oneshot::Sender<()>> {
        match cmd {
            SessionCommand::SendMessage { text, respond_to } => {
                let result = self.send_message(&text).await;
                let _ = respond_to.send(result);
            }
            SessionCommand::StartTyping => {
                let outcome = self.typing.start_typing();
                self.apply_typing(outcome).await;
            }
            SessionCommand::StopTyping => {
                let outcome = self.typing.stop_typing();
                self.apply_typing(outcome).await;
            }
            SessionCommand::MarkAsRead { respond_to } => {
                let had_unread = self.sync.unread_count() > 0;
                let submitted = self.sync.mark_as_read();
                if had_unread {
                    self.emit(ChatEvent::UnreadChanged(0));
                }
                let _ = respond_to.send(submitted);
            }
            SessionCommand::Reconnect { respond_to } => {
                let before = self.connection.state();
                let result = self.connection.reconnect_now().await;
                self.on_connection(before).await;
                let _ = respond_to.send(result);
            }
            SessionCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            SessionCommand::Close { respond_to } => return Some(respond_to),
        }
        None
    }

    async fn send_message(&mut self, text: &str) -> ChatResult<SendReceipt> {
        let client_ref = self.sync.send_message(text)?;
        let (tx, rx) = oneshot::channel();
        self.receipts.insert(client_ref.clone(), tx);
        self.emit(ChatEvent::MessagesChanged);

        let outcome = self.typing.stop_typing();
        self.apply_typing(outcome).await;

        Ok(SendReceipt {
            client_ref,
            confirmation: rx,
        })
    }

    async fn handle_sync(&mut self, signal: SyncSignal) {
        match self.sync.handle_signal(signal) {
            SyncOutcome::Persisted(stored) => {
                if !self.connection.is_connected() {
                    // nobody to echo it back; the stored record is the confirmation
                    self.apply_message(stored);
                    return;
                }
                let payload = match serde_json::to_value(&stored) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(chat_id = %self.chat_id, error = %e, "message not serializable");
                        self.apply_message(stored);
                        return;
                    }
                };
                if let Err(e) = self.connection.send_broadcast(events::MESSAGE, payload).await {
                    warn!(chat_id = %self.chat_id, id = %stored.id, error = %e, "message broadcast failed");
                    self.apply_message(stored);
                }
            }
            SyncOutcome::SendFailed { client_ref, error } => {
                if let Some(receipt) = self.receipts.remove(&client_ref) {
                    let _ = receipt.send(Err(error.clone()));
                }
                self.emit(ChatEvent::MessagesChanged);
                self.emit(ChatEvent::error(&error));
            }
            SyncOutcome::Ignored => {}
        }
    }

    async fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Message(msg) => self.apply_message(msg),
            InboundEvent::Typing(payload) => {
                if self
                    .typing
                    .on_incoming_typing(&payload.user_id, payload.is_typing)
                {
                    self.emit(ChatEvent::TypingChanged(self.typing.typing_users()));
                }
            }
            InboundEvent::PresenceSync(roster) => {
                if self.presence.on_presence_sync(roster) {
                    self.emit_presence();
                }
            }
        }
    }

    /// Merge one confirmed record, from either the push channel or a poll.
    fn apply_message(&mut self, msg: Message) {
        let id = msg.id.clone();
        let sender_id = msg.sender_id.clone();
        match self.sync.apply_incoming(msg) {
            Applied::Duplicate => {}
            Applied::Confirmed { client_ref } => {
                if let Some(receipt) = self.receipts.remove(&client_ref)
                    && let Some(stored) = self.sync.messages().iter().find(|m| m.id == id)
                {
                    let _ = receipt.send(Ok(stored.clone()));
                }
                self.emit(ChatEvent::MessagesChanged);
            }
            Applied::Appended { counterpart } => {
                self.emit(ChatEvent::MessagesChanged);
                if counterpart {
                    self.emit(ChatEvent::UnreadChanged(self.sync.unread_count()));
                }
                if self.typing.clear_user(&sender_id) {
                    self.emit(ChatEvent::TypingChanged(self.typing.typing_users()));
                }
            }
        }
    }

    async fn apply_typing(&mut self, outcome: TypingOutcome) {
        match outcome {
            TypingOutcome::Broadcast(is_typing) => {
                let payload = self.typing.payload(is_typing);
                match serde_json::to_value(&payload) {
                    Ok(value) => {
                        if let Err(e) = self.connection.send_broadcast(events::TYPING, value).await {
                            debug!(chat_id = %self.chat_id, error = %e, "typing broadcast dropped");
                        }
                    }
                    Err(e) => warn!(chat_id = %self.chat_id, error = %e, "typing payload not serializable"),
                }
                let status = if is_typing {
                    PresenceStatus::Typing
                } else {
                    PresenceStatus::Online
                };
                self.track_self(status).await;
            }
            TypingOutcome::RemoteChanged => {
                self.emit(ChatEvent::TypingChanged(self.typing.typing_users()));
            }
            TypingOutcome::Nothing => {}
        }
    }

    /// React to a connection state change made by the last call.
    async fn on_connection(&mut self, before: ConnectionState) {
        let now = self.connection.state();
        if now == before {
            return;
        }
        match now {
            ConnectionState::Connected => {
                self.grace.cancel();
                self.stop_fallback();
                if self.connected_once {
                    // pick up whatever was sent while the channel was down
                    self.fallback.poll_once();
                }
                self.connected_once = true;
                self.track_self(PresenceStatus::Online).await;
            }
            ConnectionState::Error => {
                self.grace.cancel();
                self.emit(ChatEvent::error(&ChatError::Connection(
                    "reconnect attempts exhausted".into(),
                )));
                self.start_fallback();
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                if !self.fallback.is_running() && !self.grace.is_armed() {
                    self.grace.arm(self.grace_period, &self.grace_tx, |g| g);
                }
            }
            ConnectionState::Connecting => {}
        }
    }

    async fn track_self(&self, status: PresenceStatus) {
        if !self.connection.is_connected() {
            return;
        }
        if let Err(e) = self
            .connection
            .track_presence(self.presence.self_payload(status))
            .await
        {
            debug!(chat_id = %self.chat_id, ?status, error = %e, "presence track failed");
        }
    }

    fn start_fallback(&mut self) {
        if self.fallback.start() {
            self.emit(ChatEvent::FallbackChanged { active: true });
        }
    }

    fn stop_fallback(&mut self) {
        if self.fallback.stop() {
            self.emit(ChatEvent::FallbackChanged { active: false });
        }
    }

    fn emit_presence(&self) {
        self.emit(ChatEvent::PresenceChanged {
            counterpart_online: self.presence.other_users_online(),
        });
    }

    fn emit(&self, event: ChatEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> ChatSnapshot {
        let state = self.connection.state();
        ChatSnapshot {
            chat_id: self.chat_id.clone(),
            state,
            status_text: state.status_text(),
            messages: self.sync.messages().to_vec(),
            unread_count: self.sync.unread_count(),
            counterpart_online: self.presence.other_users_online(),
            typing_users: self.typing.typing_users(),
            polling: self.fallback.is_running(),
            pending_sends: self.sync.pending_count(),
        }
    }

    async fn shutdown(&mut self) {
        self.stop_fallback();
        self.grace.cancel();
        self.presence.stop();
        if self.typing.is_signaling() {
            let outcome = self.typing.stop_typing();
            self.apply_typing(outcome).await;
        }
        self.track_self(PresenceStatus::Offline).await;
        self.typing.shutdown();
        self.sync.shutdown();
        self.connection.disconnect().await;
        for (_, receipt) in self.receipts.drain() {
            let _ = receipt.send(Err(ChatError::SessionClosed));
        }
        info!(chat_id = %self.chat_id, "chat closed");
    }
}
