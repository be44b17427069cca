// View deadline timer
//
// One deadline per view. Replacing or cancelling it never leaves anything
// running in the background: the timer is only an `Instant`, and the
// future handed to the event loop owns a copy of it.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct ViewTimer {
    deadline: Option<Instant>,
}

impl ViewTimer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm the timer `period` from now, replacing any previous deadline
    pub fn set(&mut self, period: Duration) {
        self.deadline = Some(Instant::now() + period);
    }

    /// Disarm; cancelling an unarmed or already fired timer is a no-op
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// The deadline has passed; stays true until the timer is re-armed
    pub fn is_deadline(&self) -> bool {
        self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Completes at the current deadline, or never when disarmed.
    ///
    /// The future does not borrow the timer, so the event loop can keep
    /// it across iterations and replace it after every view reset.
    pub fn timeout(&self) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        }
    }
}

/// View timeout with exponential backoff across consecutive view changes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
        }
    }
}

impl TimeoutPolicy {
    /// `min(base * 2^failures, max)`
    pub fn period(&self, consecutive_failures: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(consecutive_failures.min(16));
        self.base.saturating_mul(multiplier).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timer_fires_and_reports_deadline() {
        let mut timer = ViewTimer::new();
        assert!(!timer.is_deadline());
        timer.set(Duration::from_millis(10));
        assert!(!timer.is_deadline());

        timer.timeout().await;
        assert!(timer.is_deadline());
        assert!(timer.is_deadline());

        timer.cancel();
        timer.cancel();
        assert!(!timer.is_deadline());
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_disarmed_timer_never_fires() {
        let timer = ViewTimer::new();
        let mut fired = tokio_test::task::spawn(timer.timeout());
        tokio_test::assert_pending!(fired.poll());
        tokio_test::assert_pending!(fired.poll());
    }

    #[tokio::test]
    async fn test_replaced_deadline_wins() {
        let mut timer = ViewTimer::new();
        timer.set(Duration::from_secs(30));
        let stale = timer.timeout();
        timer.set(Duration::from_millis(5));

        tokio::time::timeout(Duration::from_secs(1), timer.timeout())
            .await
            .expect("new deadline should fire");
        // the stale future still targets the old deadline
        let stale_fired = tokio::time::timeout(Duration::from_millis(20), stale).await;
        assert!(stale_fired.is_err());
    }

    #[test]
    fn test_timeout_backoff() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.period(0), Duration::from_secs(2));
        assert_eq!(policy.period(1), Duration::from_secs(4));
        assert_eq!(policy.period(3), Duration::from_secs(16));
        assert_eq!(policy.period(5), Duration::from_secs(60));
        assert_eq!(policy.period(40), Duration::from_secs(60));
    }
}
