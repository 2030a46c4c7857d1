//! ConnectionManager: the push-channel subscription of one chat.
//!
//! Owns exactly one subscription at a time and drives the
//! DISCONNECTED / CONNECTING / CONNECTED / RECONNECTING / ERROR machine:
//!
//! - a failed or timed-out attempt schedules a retry with exponential backoff
//!   (`min(base * 2^n, cap)`), keeping the state at RECONNECTING
//! - losing an established channel passes through DISCONNECTED first
//! - after `max_attempts` consecutive failures the state parks at ERROR and
//!   the session falls back to polling
//!
//! Transport callbacks and timer expiries arrive as [`ConnectionSignal`]s on
//! the session's channel and are applied by [`ConnectionManager::handle_signal`],
//! so all state changes happen on the session task.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{ChatError, ChatResult};
use crate::model::{
    ChatId, ConnectionState, Message, PresencePayload, ReconnectState, TypingPayload, events,
};
use crate::ports::{PushTransport, SubscriptionId, TransportEvent};
use crate::session::ChatEvent;
use crate::timer::{DelayTimer, Periodic};

/// Inputs the session feeds back into the manager.
#[derive(Debug)]
pub enum ConnectionSignal {
    /// Event read from the subscription opened at `epoch`
    Transport { epoch: u64, event: TransportEvent },
    /// The subscription's event stream ended without a close frame
    StreamEnded { epoch: u64 },
    ReconnectDue { generation: u64 },
    SubscribeTimeout { generation: u64 },
}

/// Decoded chat traffic handed to the other components.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(Message),
    Typing(TypingPayload),
    PresenceSync(Vec<PresencePayload>),
}

pub struct ConnectionManager {
    chat_id: ChatId,
    channel: String,
    transport: Arc<dyn PushTransport>,
    config: ConnectionConfig,
    state: ConnectionState,
    reconnect: ReconnectState,
    /// Bumped for every subscription so late events from an old one are dropped
    epoch: u64,
    subscription: Option<SubscriptionId>,
    reader_cancel: Option<CancellationToken>,
    heartbeat: Periodic,
    reconnect_timer: DelayTimer,
    subscribe_timer: DelayTimer,
    signals: mpsc::Sender<ConnectionSignal>,
    events: broadcast::Sender<ChatEvent>,
}

impl ConnectionManager {
    pub fn new(
        chat_id: ChatId,
        transport: Arc<dyn PushTransport>,
        config: ConnectionConfig,
        signals: mpsc::Sender<ConnectionSignal>,
        events: broadcast::Sender<ChatEvent>,
    ) -> Self {
        let reconnect = ReconnectState::new(config.reconnect_base);
        Self {
            channel: chat_id.channel_name(),
            chat_id,
            transport,
            config,
            state: ConnectionState::Disconnected,
            reconnect,
            epoch: 0,
            subscription: None,
            reader_cancel: None,
            heartbeat: Periodic::new(),
            reconnect_timer: DelayTimer::new(),
            subscribe_timer: DelayTimer::new(),
            signals,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.reconnect
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// Open the channel. A no-op while CONNECTING or CONNECTED.
    ///
    /// An error means the transport refused the subscription outright; a retry
    /// has already been scheduled when this returns.
    pub async fn connect(&mut self) -> ChatResult<()> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!(chat_id = %self.chat_id, state = %self.state, "connect ignored");
            return Ok(());
        }
        if self.state != ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }
        self.subscribe().await
    }

    /// Manual retry: forget the backoff and connect right away.
    pub async fn reconnect_now(&mut self) -> ChatResult<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        info!(chat_id = %self.chat_id, "manual reconnect");
        self.reconnect_timer.cancel();
        self.reconnect.reset(self.config.reconnect_base);
        self.set_state(ConnectionState::Connecting);
        self.subscribe().await
    }

    /// Tear the channel down. Always safe to call.
    pub async fn disconnect(&mut self) {
        self.reconnect_timer.cancel();
        self.teardown_subscription().await;
        self.reconnect.reset(self.config.reconnect_base);
        self.set_state(ConnectionState::Disconnected);
    }

    pub async fn send_broadcast(&self, event: &str, payload: serde_json::Value) -> ChatResult<()> {
        let id = self.connected_subscription()?;
        self.transport
            .broadcast(id, event, payload)
            .await
            .map_err(ChatError::connection)
    }

    pub async fn track_presence(&self, payload: PresencePayload) -> ChatResult<()> {
        let id = self.connected_subscription()?;
        self.transport
            .track_presence(id, payload)
            .await
            .map_err(ChatError::connection)
    }

    /// Apply one signal. Returns decoded chat traffic, if the signal carried any.
    pub async fn handle_signal(&mut self, signal: ConnectionSignal) -> Option<InboundEvent> {
        match signal {
            ConnectionSignal::Transport { epoch, event } => {
                if epoch != self.epoch || self.subscription.is_none() {
                    debug!(chat_id = %self.chat_id, epoch, "dropping event from stale subscription");
                    return None;
                }
                self.handle_transport_event(event).await
            }
            ConnectionSignal::StreamEnded { epoch } => {
                if epoch == self.epoch && self.subscription.is_some() {
                    self.on_channel_lost("subscription stream ended").await;
                }
                None
            }
            ConnectionSignal::ReconnectDue { generation } => {
                if self.reconnect_timer.fire(generation)
                    && self.state == ConnectionState::Reconnecting
                {
                    info!(
                        chat_id = %self.chat_id,
                        attempt = self.reconnect.attempt,
                        "reconnection attempt"
                    );
                    // failures reschedule themselves
                    let _ = self.connect().await;
                }
                None
            }
            ConnectionSignal::SubscribeTimeout { generation } => {
                if self.subscribe_timer.fire(generation)
                    && matches!(
                        self.state,
                        ConnectionState::Connecting | ConnectionState::Reconnecting
                    )
                {
                    warn!(
                        chat_id = %self.chat_id,
                        timeout_ms = self.config.subscribe_timeout.as_millis() as u64,
                        "subscription not confirmed in time"
                    );
                    self.on_channel_lost("subscription timed out").await;
                }
                None
            }
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Option<InboundEvent> {
        match event {
            TransportEvent::Subscribed => {
                self.subscribe_timer.cancel();
                self.reconnect.reset(self.config.reconnect_base);
                self.set_state(ConnectionState::Connected);
                self.start_heartbeat();
                None
            }
            TransportEvent::Broadcast { event, payload } => decode_broadcast(&event, payload),
            TransportEvent::PresenceSync(roster) => Some(InboundEvent::PresenceSync(roster)),
            TransportEvent::Closed { reason } => {
                self.on_channel_lost(&reason).await;
                None
            }
        }
    }

    async fn subscribe(&mut self) -> ChatResult<()> {
        self.teardown_subscription().await;
        self.epoch += 1;
        let epoch = self.epoch;

        let subscription = match self.transport.subscribe(&self.channel).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(chat_id = %self.chat_id, error = %e, "subscribe failed");
                self.schedule_reconnect();
                return Err(ChatError::connection(e));
            }
        };

        debug!(chat_id = %self.chat_id, subscription = %subscription.id, epoch, "subscription requested");
        self.subscription = Some(subscription.id);

        // Reader task: transport events -> session channel
        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        let signals = self.signals.clone();
        let mut events = subscription.events;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = reader_cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else {
                            let _ = signals.send(ConnectionSignal::StreamEnded { epoch }).await;
                            break;
                        };
                        // nothing follows a close
                        let last = matches!(event, TransportEvent::Closed { .. });
                        if signals.send(ConnectionSignal::Transport { epoch, event }).await.is_err()
                            || last
                        {
                            break;
                        }
                    }
                }
            }
        });
        self.reader_cancel = Some(cancel);

        self.subscribe_timer
            .arm(self.config.subscribe_timeout, &self.signals, |generation| {
                ConnectionSignal::SubscribeTimeout { generation }
            });
        Ok(())
    }

    async fn on_channel_lost(&mut self, reason: &str) {
        let was_connected = self.state == ConnectionState::Connected;
        warn!(chat_id = %self.chat_id, state = %self.state, reason, "channel lost");
        self.teardown_subscription().await;
        if was_connected {
            self.set_state(ConnectionState::Disconnected);
        }
        self.schedule_reconnect();
    }

    /// Count one failure and either arm the retry timer or give up.
    fn schedule_reconnect(&mut self) {
        let failures = self.reconnect.attempt.saturating_add(1);
        if failures >= self.config.max_attempts {
            self.reconnect.attempt = failures;
            warn!(
                chat_id = %self.chat_id,
                failures,
                "reconnect budget exhausted"
            );
            self.set_state(ConnectionState::Error);
            return;
        }

        let delay = self
            .reconnect
            .advance(self.config.reconnect_base, self.config.reconnect_cap);
        info!(
            chat_id = %self.chat_id,
            attempt = self.reconnect.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect_timer.arm(delay, &self.signals, |generation| {
            ConnectionSignal::ReconnectDue { generation }
        });
    }

    fn start_heartbeat(&mut self) {
        let Some(id) = self.subscription else {
            return;
        };
        let transport = self.transport.clone();
        let chat_id = self.chat_id.clone();
        self.heartbeat
            .start(self.config.heartbeat_interval, false, move || {
                let transport = transport.clone();
                let chat_id = chat_id.clone();
                async move {
                    let payload = json!({ "timestamp": Utc::now() });
                    if let Err(e) = transport.broadcast(id, events::HEARTBEAT, payload).await {
                        // the transport's own close event is what counts as a disconnect
                        warn!(chat_id = %chat_id, error = %e, "heartbeat failed");
                    }
                }
            });
    }

    async fn teardown_subscription(&mut self) {
        self.heartbeat.stop();
        self.subscribe_timer.cancel();
        if let Some(cancel) = self.reader_cancel.take() {
            cancel.cancel();
        }
        if let Some(id) = self.subscription.take()
            && let Err(e) = self.transport.unsubscribe(id).await
        {
            debug!(chat_id = %self.chat_id, subscription = %id, error = %e, "unsubscribe failed");
        }
    }

    fn connected_subscription(&self) -> ChatResult<SubscriptionId> {
        match (self.state, self.subscription) {
            (ConnectionState::Connected, Some(id)) => Ok(id),
            _ => Err(ChatError::NotConnected),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!(chat_id = %self.chat_id, from = %self.state, to = %state, "connection state");
        self.state = state;
        let _ = self.events.send(ChatEvent::ConnectionChanged {
            state,
            connected: state.is_connected(),
        });
    }
}

fn decode_broadcast(event: &str, payload: serde_json::Value) -> Option<InboundEvent> {
    match event {
        events::MESSAGE => match serde_json::from_value::<Message>(payload) {
            Ok(msg) => Some(InboundEvent::Message(msg)),
            Err(e) => {
                warn!(error = %e, "malformed message broadcast");
                None
            }
        },
        events::TYPING => match serde_json::from_value::<TypingPayload>(payload) {
            Ok(typing) => Some(InboundEvent::Typing(typing)),
            Err(e) => {
                warn!(error = %e, "malformed typing broadcast");
                None
            }
        },
        events::HEARTBEAT => None,
        other => {
            debug!(event = other, "ignoring unknown broadcast event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use std::time::Duration;

    fn config(max_attempts: u32) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_base: Duration::from_secs(5),
            reconnect_cap: Duration::from_secs(30),
            max_attempts,
            heartbeat_interval: Duration::from_secs(60),
            subscribe_timeout: Duration::from_secs(10),
        }
    }

    fn assert_elapsed(since: tokio::time::Instant, secs: u64) {
        let elapsed = since.elapsed();
        assert!(
            elapsed >= Duration::from_secs(secs) && elapsed < Duration::from_secs(secs + 1),
            "expected ~{secs}s, got {elapsed:?}"
        );
    }

    struct Harness {
        manager: ConnectionManager,
        signals: mpsc::Receiver<ConnectionSignal>,
        events: broadcast::Receiver<ChatEvent>,
    }

    fn harness(transport: Arc<MemoryTransport>, max_attempts: u32) -> Harness {
        let (signal_tx, signals) = mpsc::channel(64);
        let (event_tx, events) = broadcast::channel(64);
        let manager = ConnectionManager::new(
            ChatId::new("item-1"),
            transport,
            config(max_attempts),
            signal_tx,
            event_tx,
        );
        Harness {
            manager,
            signals,
            events,
        }
    }

    impl Harness {
        async fn pump(&mut self) -> Option<InboundEvent> {
            let signal = self.signals.recv().await.expect("signal channel open");
            self.manager.handle_signal(signal).await
        }

        fn states(&mut self) -> Vec<ConnectionState> {
            let mut out = Vec::new();
            while let Ok(ev) = self.events.try_recv() {
                if let ChatEvent::ConnectionChanged { state, .. } = ev {
                    out.push(state);
                }
            }
            out
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connects_on_confirmation() {
        let transport = Arc::new(MemoryTransport::new());
        let mut h = harness(transport.clone(), 3);

        h.manager.connect().await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        h.pump().await;
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(
            h.states(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(transport.subscriber_count("order-chat:item-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        let mut h = harness(transport.clone(), 3);

        h.manager.connect().await.unwrap();
        h.manager.connect().await.unwrap();
        h.pump().await;
        h.manager.connect().await.unwrap();
        assert_eq!(transport.subscribe_calls(), 1);
        assert_eq!(transport.subscriber_count("order-chat:item-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_requires_connection() {
        let transport = Arc::new(MemoryTransport::new());
        let mut h = harness(transport, 3);

        let err = h
            .manager
            .send_broadcast(events::TYPING, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::NotConnected);

        h.manager.connect().await.unwrap();
        h.pump().await;
        h.manager
            .send_broadcast(events::HEARTBEAT, json!({}))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_then_park_in_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_next_subscriptions(3);
        let mut h = harness(transport.clone(), 3);

        h.manager.connect().await.unwrap();
        h.pump().await; // Closed
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);
        assert_eq!(h.manager.reconnect_state().attempt, 1);

        let before = tokio::time::Instant::now();
        h.pump().await; // ReconnectDue after 5s
        assert_elapsed(before, 5);
        h.pump().await; // Closed
        assert_eq!(h.manager.reconnect_state().attempt, 2);

        let before = tokio::time::Instant::now();
        h.pump().await; // ReconnectDue after 10s
        assert_elapsed(before, 10);
        h.pump().await; // Closed -> budget exhausted
        assert_eq!(h.manager.state(), ConnectionState::Error);

        assert_eq!(
            h.states(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Reconnecting,
                ConnectionState::Error
            ]
        );
        assert_eq!(transport.subscribe_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_channel_passes_through_disconnected() {
        let transport = Arc::new(MemoryTransport::new());
        let mut h = harness(transport.clone(), 3);
        h.manager.connect().await.unwrap();
        h.pump().await;
        h.states();

        transport.close_channel("order-chat:item-1", "server restart");
        h.pump().await;
        assert_eq!(
            h.states(),
            vec![ConnectionState::Disconnected, ConnectionState::Reconnecting]
        );

        h.pump().await; // ReconnectDue
        h.pump().await; // Subscribed
        assert_eq!(h.manager.state(), ConnectionState::Connected);
        assert_eq!(h.manager.reconnect_state().attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_subscription_times_out() {
        let transport = Arc::new(MemoryTransport::new());
        transport.hold_confirmations(true);
        let mut h = harness(transport, 3);

        h.manager.connect().await.unwrap();
        let before = tokio::time::Instant::now();
        h.pump().await;
        assert_elapsed(before, 10);
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_subscribe_reports_error_and_retries() {
        let transport = Arc::new(MemoryTransport::new());
        transport.reject_subscriptions(true);
        let mut h = harness(transport, 3);

        let err = h.manager.connect().await.unwrap_err();
        assert_eq!(err.error_code(), "connection");
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reconnect_from_error() {
        let transport = Arc::new(MemoryTransport::new());
        transport.reject_subscriptions(true);
        let mut h = harness(transport.clone(), 1);

        let _ = h.manager.connect().await;
        assert_eq!(h.manager.state(), ConnectionState::Error);

        transport.reject_subscriptions(false);
        h.manager.reconnect_now().await.unwrap();
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        h.pump().await;
        assert_eq!(h.manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_drops_late_events() {
        let transport = Arc::new(MemoryTransport::new());
        let mut h = harness(transport.clone(), 3);
        h.manager.connect().await.unwrap();
        h.pump().await;

        h.manager.disconnect().await;
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.subscriber_count("order-chat:item-1"), 0);

        let late = ConnectionSignal::Transport {
            epoch: 1,
            event: TransportEvent::Closed {
                reason: "late".into(),
            },
        };
        assert!(h.manager.handle_signal(late).await.is_none());
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn decodes_broadcasts() {
        let typing = decode_broadcast(
            events::TYPING,
            json!({"userId": "u-2", "isTyping": true, "timestamp": "2026-01-02T10:00:00Z"}),
        );
        assert!(matches!(typing, Some(InboundEvent::Typing(t)) if t.user_id == "u-2"));
        assert!(decode_broadcast(events::MESSAGE, json!({"nope": 1})).is_none());
        assert!(decode_broadcast(events::HEARTBEAT, json!({})).is_none());
        assert!(decode_broadcast("reaction", json!({})).is_none());
    }
}
