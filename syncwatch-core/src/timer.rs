//! Cancellable timers owned by the component that created them
//!
//! A `Timer` wraps one spawned task. Cancelling or dropping the timer aborts
//! the task, so a room teardown can never leave a loop running against a
//! stale room id.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

/// Every timer and background listener a room session owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Periodic store reconciliation
    Reconcile,
    /// Periodic own-ban poll
    BanPoll,
    /// Presence heartbeat
    PresenceHeartbeat,
    /// Trailing edge of the outbound seek throttle
    SeekFlush,
    /// Trailing edge of the seek store-write debounce
    SeekWrite,
    /// `player-action` channel listener
    PlayerChannel,
    /// `member-update` channel listener
    MemberChannel,
    /// `presence` channel listener
    PresenceChannel,
    /// Store change feed listener
    ChangeFeed,
}

/// A single cancellable task
#[derive(Debug)]
pub struct Timer {
    task: Option<JoinHandle<()>>,
}

impl Timer {
    /// Run `fut` once after `delay`
    pub fn after<F>(runtime: &Handle, delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        Self { task: Some(task) }
    }

    /// Run `tick` every `period`, first tick one period from now
    pub fn every<F, Fut>(runtime: &Handle, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        Self { task: Some(task) }
    }

    /// Wrap a long-running task (subscription listeners)
    pub fn task<F>(runtime: &Handle, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            task: Some(runtime.spawn(fut)),
        }
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The set of timers owned by one room session
#[derive(Debug, Default)]
pub struct TimerSet {
    timers: HashMap<TimerKind, Timer>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a timer, cancelling any previous timer of the same kind
    pub fn insert(&mut self, kind: TimerKind, timer: Timer) {
        if let Some(mut previous) = self.timers.insert(kind, timer) {
            previous.cancel();
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(mut timer) = self.timers.remove(&kind) {
            timer.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        let count = self.timers.len();
        for (_, mut timer) in self.timers.drain() {
            timer.cancel();
        }
        debug!("Cancelled {} room timers", count);
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _timer = Timer::after(&Handle::current(), Duration::from_millis(100), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mut timer = Timer::after(&Handle::current(), Duration::from_millis(100), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(timer.task.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_ticks_until_cancel_all() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let mut timers = TimerSet::new();
        timers.insert(
            TimerKind::Reconcile,
            Timer::every(&Handle::current(), Duration::from_secs(1), move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        timers.cancel_all();
        assert!(timers.is_empty());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_replaces_previous_timer() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut timers = TimerSet::new();
        for _ in 0..3 {
            let counter = Arc::clone(&hits);
            timers.insert(
                TimerKind::SeekFlush,
                Timer::after(&Handle::current(), Duration::from_millis(100), async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timers.len(), 1);
    }
}
