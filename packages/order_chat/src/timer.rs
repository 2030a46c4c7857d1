//! Small timer utilities shared by the session components.
//!
//! Timers never touch session state directly. A [`DelayTimer`] posts a message
//! into the owning actor's channel when it expires; the message carries the
//! generation it was armed with so the actor can drop ticks that were already
//! in flight when the timer got cancelled or re-armed.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One-shot, re-armable delay.
#[derive(Debug, Default)]
pub struct DelayTimer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl DelayTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, cancelling any previous arming. `msg` builds the message
    /// posted on expiry from the generation number. Returns that generation.
    pub fn arm<M, F>(&mut self, delay: Duration, tx: &mpsc::Sender<M>, msg: F) -> u64
    where
        M: Send + 'static,
        F: FnOnce(u64) -> M + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let tx = tx.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(msg(generation)).await;
        }));
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Accept an expiry tick. Returns false for stale ticks; a fresh tick
    /// disarms the timer.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.handle.is_some() && generation == self.generation {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

impl Drop for DelayTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A family of [`DelayTimer`]s keyed by `K` (one per typing user, one per pending send).
#[derive(Debug)]
pub struct KeyedTimers<K> {
    timers: HashMap<K, DelayTimer>,
}

impl<K: Eq + Hash + Clone + Send + 'static> KeyedTimers<K> {
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
        }
    }

    pub fn arm<M, F>(&mut self, key: K, delay: Duration, tx: &mpsc::Sender<M>, msg: F) -> u64
    where
        M: Send + 'static,
        F: FnOnce(K, u64) -> M + Send + 'static,
    {
        let k = key.clone();
        self.timers
            .entry(key)
            .or_default()
            .arm(delay, tx, move |generation| msg(k, generation))
    }

    pub fn cancel(&mut self, key: &K) {
        if let Some(mut timer) = self.timers.remove(key) {
            timer.cancel();
        }
    }

    pub fn fire(&mut self, key: &K, generation: u64) -> bool {
        let fired = self
            .timers
            .get_mut(key)
            .is_some_and(|timer| timer.fire(generation));
        if fired {
            self.timers.remove(key);
        }
        fired
    }

    pub fn contains(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        // DelayTimer aborts its task on drop
        self.timers.clear();
    }
}

impl<K: Eq + Hash + Clone + Send + 'static> Default for KeyedTimers<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Leading-edge throttle: at most one acquisition per window.
#[derive(Debug, Clone)]
pub struct Throttle {
    window: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// `Ok` if the caller may act now (and records it), otherwise the time
    /// left until the window reopens.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        if let Some(last) = self.last {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.window {
                return Err(self.window - elapsed);
            }
        }
        self.last = Some(now);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// A cancellable periodic task.
#[derive(Debug, Default)]
pub struct Periodic {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period` until stopped. With `immediate`, the first
    /// tick runs right away. Restarting stops the previous loop first.
    pub fn start<F, Fut>(&mut self, period: Duration, immediate: bool, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let start = if immediate {
                Instant::now()
            } else {
                Instant::now() + period
            };
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }
        });
        self.cancel = Some(cancel);
        self.handle = Some(handle);
    }

    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn delay_timer_fires_once() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = DelayTimer::new();
        let generation = timer.arm(Duration::from_secs(3), &tx, |g| g);
        assert!(timer.is_armed());

        let got = rx.recv().await.unwrap();
        assert_eq!(got, generation);
        assert!(timer.fire(got));
        assert!(!timer.is_armed());
        assert!(!timer.fire(got));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_makes_old_generation_stale() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timer = DelayTimer::new();
        let first = timer.arm(Duration::from_secs(1), &tx, |g| g);
        let second = timer.arm(Duration::from_secs(2), &tx, |g| g);
        assert_ne!(first, second);

        let got = rx.recv().await.unwrap();
        assert_eq!(got, second);
        assert!(!timer.fire(first));
        assert!(timer.fire(second));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_posts() {
        let (tx, mut rx) = mpsc::channel::<u64>(4);
        let mut timer = DelayTimer::new();
        timer.arm(Duration::from_secs(1), &tx, |g| g);
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn keyed_timers_are_independent() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut timers = KeyedTimers::new();
        timers.arm("ana".to_string(), Duration::from_secs(1), &tx, |k, g| (k, g));
        timers.arm("bia".to_string(), Duration::from_secs(2), &tx, |k, g| (k, g));
        timers.cancel(&"bia".to_string());

        let (key, generation) = rx.recv().await.unwrap();
        assert_eq!(key, "ana");
        assert!(timers.fire(&key, generation));
        assert!(timers.is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn throttle_windows() {
        let mut throttle = Throttle::new(Duration::from_millis(500));
        let t0 = Instant::now();
        assert!(throttle.try_acquire(t0).is_ok());
        assert_eq!(
            throttle.try_acquire(t0 + Duration::from_millis(200)),
            Err(Duration::from_millis(300))
        );
        assert!(throttle.try_acquire(t0 + Duration::from_millis(500)).is_ok());
        throttle.reset();
        assert!(throttle.try_acquire(t0 + Duration::from_millis(600)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut periodic = Periodic::new();
        let c = count.clone();
        periodic.start(Duration::from_secs(2), false, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(6_500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        periodic.stop();
        assert!(!periodic.is_running());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
