//! TypingCoordinator: the local "is typing" signal and the set of other
//! participants currently typing.

use std::collections::BTreeSet;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::config::TypingConfig;
use crate::model::TypingPayload;
use crate::timer::{DelayTimer, KeyedTimers, Throttle};

#[derive(Debug)]
pub enum TypingSignal {
    /// Keyboard has been silent for `idle_stop`
    IdleStop { generation: u64 },
    /// Throttle window reopened while a start was held back
    Flush { generation: u64 },
    RemoteExpired { user_id: String, generation: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingOutcome {
    /// Broadcast `isTyping` with this value
    Broadcast(bool),
    /// The visible typing set changed
    RemoteChanged,
    Nothing,
}

pub struct TypingCoordinator {
    self_id: String,
    config: TypingConfig,
    signaling: bool,
    throttle: Throttle,
    idle_stop: DelayTimer,
    flush: DelayTimer,
    remote: KeyedTimers<String>,
    typing_users: BTreeSet<String>,
    signals: mpsc::Sender<TypingSignal>,
}

impl TypingCoordinator {
    pub fn new(self_id: String, config: TypingConfig, signals: mpsc::Sender<TypingSignal>) -> Self {
        Self {
            self_id,
            throttle: Throttle::new(config.throttle),
            config,
            signaling: false,
            idle_stop: DelayTimer::new(),
            flush: DelayTimer::new(),
            remote: KeyedTimers::new(),
            typing_users: BTreeSet::new(),
            signals,
        }
    }

    pub fn is_signaling(&self) -> bool {
        self.signaling
    }

    /// Other participants currently typing. Never contains the local user.
    pub fn typing_users(&self) -> Vec<String> {
        self.typing_users.iter().cloned().collect()
    }

    /// A keystroke. Returns `Broadcast(true)` when the signal should go out now.
    pub fn start_typing(&mut self) -> TypingOutcome {
        self.idle_stop
            .arm(self.config.idle_stop, &self.signals, |generation| {
                TypingSignal::IdleStop { generation }
            });
        if self.signaling {
            return TypingOutcome::Nothing;
        }
        match self.throttle.try_acquire(Instant::now()) {
            Ok(()) => {
                self.signaling = true;
                TypingOutcome::Broadcast(true)
            }
            Err(remaining) => {
                if !self.flush.is_armed() {
                    self.flush.arm(remaining, &self.signals, |generation| {
                        TypingSignal::Flush { generation }
                    });
                }
                TypingOutcome::Nothing
            }
        }
    }

    /// Stop right away; the stop signal is never throttled.
    pub fn stop_typing(&mut self) -> TypingOutcome {
        self.idle_stop.cancel();
        self.flush.cancel();
        if self.signaling {
            self.signaling = false;
            TypingOutcome::Broadcast(false)
        } else {
            TypingOutcome::Nothing
        }
    }

    pub fn handle_signal(&mut self, signal: TypingSignal) -> TypingOutcome {
        match signal {
            TypingSignal::IdleStop { generation } => {
                if !self.idle_stop.fire(generation) {
                    return TypingOutcome::Nothing;
                }
                debug!(user_id = %self.self_id, "typing auto-stop");
                self.stop_typing()
            }
            TypingSignal::Flush { generation } => {
                // still typing if the idle timer is running
                if !self.flush.fire(generation) || self.signaling || !self.idle_stop.is_armed() {
                    return TypingOutcome::Nothing;
                }
                match self.throttle.try_acquire(Instant::now()) {
                    Ok(()) => {
                        self.signaling = true;
                        TypingOutcome::Broadcast(true)
                    }
                    Err(_) => TypingOutcome::Nothing,
                }
            }
            TypingSignal::RemoteExpired {
                user_id,
                generation,
            } => {
                if self.remote.fire(&user_id, generation) && self.typing_users.remove(&user_id) {
                    TypingOutcome::RemoteChanged
                } else {
                    TypingOutcome::Nothing
                }
            }
        }
    }

    /// Apply a typing broadcast. Returns true if the visible set changed.
    pub fn on_incoming_typing(&mut self, user_id: &str, is_typing: bool) -> bool {
        if user_id == self.self_id {
            return false;
        }
        if is_typing {
            self.remote.arm(
                user_id.to_string(),
                self.config.remote_ttl,
                &self.signals,
                |user_id, generation| TypingSignal::RemoteExpired {
                    user_id,
                    generation,
                },
            );
            self.typing_users.insert(user_id.to_string())
        } else {
            self.clear_user(user_id)
        }
    }

    /// Drop `user_id` from the typing set, e.g. once their message arrived.
    pub fn clear_user(&mut self, user_id: &str) -> bool {
        let key = user_id.to_string();
        self.remote.cancel(&key);
        self.typing_users.remove(&key)
    }

    /// Wire payload for the local user's typing signal.
    pub fn payload(&self, is_typing: bool) -> TypingPayload {
        TypingPayload {
            user_id: self.self_id.clone(),
            is_typing,
            timestamp: Utc::now(),
        }
    }

    /// Cancel every timer and forget remote typists.
    pub fn shutdown(&mut self) {
        self.idle_stop.cancel();
        self.flush.cancel();
        self.remote.clear();
        self.typing_users.clear();
        self.signaling = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn coordinator() -> (TypingCoordinator, mpsc::Receiver<TypingSignal>) {
        let (tx, rx) = mpsc::channel(16);
        let config = TypingConfig {
            throttle: Duration::from_millis(500),
            idle_stop: Duration::from_secs(3),
            remote_ttl: Duration::from_secs(3),
        };
        (TypingCoordinator::new("admin-1".into(), config, tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_collapse_into_one_send() {
        let (mut t, _rx) = coordinator();
        assert_eq!(t.start_typing(), TypingOutcome::Broadcast(true));
        for _ in 0..10 {
            assert_eq!(t.start_typing(), TypingOutcome::Nothing);
        }
        assert!(t.is_signaling());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_stop_after_silence() {
        let (mut t, mut rx) = coordinator();
        t.start_typing();
        tokio::time::sleep(Duration::from_secs(2)).await;
        t.start_typing(); // re-arms the idle timer

        let start = Instant::now();
        let signal = rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(t.handle_signal(signal), TypingOutcome::Broadcast(false));
        assert!(!t.is_signaling());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_immediate_and_single() {
        let (mut t, _rx) = coordinator();
        t.start_typing();
        assert_eq!(t.stop_typing(), TypingOutcome::Broadcast(false));
        assert_eq!(t.stop_typing(), TypingOutcome::Nothing);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_within_window_is_deferred() {
        let (mut t, mut rx) = coordinator();
        assert_eq!(t.start_typing(), TypingOutcome::Broadcast(true));
        t.stop_typing();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(t.start_typing(), TypingOutcome::Nothing);
        let start = Instant::now();
        let signal = rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert_eq!(t.handle_signal(signal), TypingOutcome::Broadcast(true));
    }

    #[tokio::test(start_paused = true)]
    async fn own_id_never_visible() {
        let (mut t, _rx) = coordinator();
        assert!(!t.on_incoming_typing("admin-1", true));
        assert!(t.on_incoming_typing("cust-1", true));
        assert_eq!(t.typing_users(), vec!["cust-1".to_string()]);
        assert!(t.on_incoming_typing("cust-1", false));
        assert!(t.typing_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_typing_expires() {
        let (mut t, mut rx) = coordinator();
        t.on_incoming_typing("cust-1", true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        t.on_incoming_typing("cust-1", true); // refresh

        let start = Instant::now();
        let signal = rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(t.handle_signal(signal), TypingOutcome::RemoteChanged);
        assert!(t.typing_users().is_empty());
    }
}
