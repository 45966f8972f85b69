use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::constants::{RETRY_ACTIVE_DELAY, RETRY_IDLE_DELAY};

/**
    System-wide count of running subscriptions.
*/
#[derive(Debug, Default)]
pub struct Activity {
    subscriptions: AtomicUsize,
}

impl Activity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unsubscribe(&self) {
        let _ = self
            .subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn active(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn any_active(&self) -> bool {
        self.active() > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Woken,
    Cancelled,
}

/**
    Reconnect delay: short while someone is watching, long otherwise.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub active: Duration,
    pub idle: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            active: RETRY_ACTIVE_DELAY,
            idle: RETRY_IDLE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, activity: &Activity) -> Duration {
        if activity.any_active() {
            self.active
        } else {
            self.idle
        }
    }

    /**
        Sleep for the current delay unless woken by a config change or
        cancelled first.
    */
    pub async fn wait(
        &self,
        activity: &Activity,
        wake: &Notify,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let delay = self.delay(activity);
        tokio::select! {
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = wake.notified() => WaitOutcome::Woken,
            _ = tokio::time::sleep(delay) => WaitOutcome::Elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Instant;

    use super::*;

    #[test]
    fn delay_follows_activity() {
        let policy = RetryPolicy::default();
        let activity = Activity::new();
        assert_eq!(policy.delay(&activity), Duration::from_secs(60));
        activity.subscribe();
        assert_eq!(policy.delay(&activity), Duration::from_secs(3));
        activity.unsubscribe();
        activity.unsubscribe();
        assert_eq!(activity.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_wait_lasts_a_minute() {
        let policy = RetryPolicy::default();
        let activity = Activity::new();
        let start = Instant::now();
        let outcome = policy
            .wait(&activity, &Notify::new(), &CancellationToken::new())
            .await;
        assert_eq!(outcome, WaitOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn active_wait_lasts_three_seconds() {
        let policy = RetryPolicy::default();
        let activity = Activity::new();
        activity.subscribe();
        let start = Instant::now();
        policy
            .wait(&activity, &Notify::new(), &CancellationToken::new())
            .await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn wake_interrupts_wait() {
        let policy = RetryPolicy::default();
        let activity = Activity::new();
        let wake = Arc::new(Notify::new());
        let notifier = wake.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            notifier.notify_waiters();
        });
        let start = Instant::now();
        let outcome = policy.wait(&activity, &wake, &CancellationToken::new()).await;
        assert_eq!(outcome, WaitOutcome::Woken);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn wake_outside_wait_is_forgotten() {
        let policy = RetryPolicy::default();
        let activity = Activity::new();
        activity.subscribe();
        let wake = Notify::new();
        wake.notify_waiters();

        let start = Instant::now();
        let outcome = policy.wait(&activity, &wake, &CancellationToken::new()).await;
        assert_eq!(outcome, WaitOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
