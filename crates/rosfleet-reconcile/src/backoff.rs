//! Retry budget with exponential backoff.

use std::time::{Duration, Instant};

use rosfleet_core::ControllerSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            base,
            max,
        }
    }

    /// Delay before attempt `failures + 1`: base, doubled per failure,
    /// capped at `max`.
    pub fn delay(&self, failures: u32) -> Duration {
        let mut delay = self.base;
        for _ in 1..failures {
            delay = (delay * 2).min(self.max);
            if delay == self.max {
                break;
            }
        }
        delay.min(self.max)
    }
}

/// Failure counter for one retried activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub failures: u32,
    pub next_at: Option<Instant>,
}

impl RetryState {
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_at.is_none_or(|at| at <= now)
    }

    /// Record a failure. Returns false once the budget is spent.
    pub fn record_failure(&mut self, policy: &RetryPolicy, now: Instant) -> bool {
        self.failures += 1;
        if self.failures >= policy.max_attempts {
            self.next_at = None;
            return false;
        }
        self.next_at = Some(now + policy.delay(self.failures));
        true
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timing and budgets of the deployment controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerPolicy {
    pub schedule: RetryPolicy,
    /// In-place redeploys of one module before it is re-placed.
    pub recovery_attempts: u32,
    pub unreachable_grace: Duration,
    pub status_poll_interval: Duration,
}

impl ControllerPolicy {
    pub fn from_config(config: &ControllerSection) -> Self {
        Self {
            schedule: RetryPolicy::new(config.schedule_attempts, config.backoff_base, config.backoff_max),
            recovery_attempts: config.recovery_attempts,
            unreachable_grace: config.unreachable_grace,
            status_poll_interval: config.status_poll_interval,
        }
    }
}

impl Default for ControllerPolicy {
    fn default() -> Self {
        Self::from_config(&ControllerSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_max() {
        let policy = RetryPolicy::new(10, Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(30), Duration::from_secs(10));
    }

    #[test]
    fn budget_runs_out() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(60));
        let now = Instant::now();
        let mut state = RetryState::default();
        assert!(state.is_due(now));
        assert!(state.record_failure(&policy, now));
        assert!(!state.is_due(now));
        assert!(state.is_due(now + Duration::from_secs(1)));
        assert!(state.record_failure(&policy, now));
        assert_eq!(state.next_at, Some(now + Duration::from_secs(2)));
        assert!(!state.record_failure(&policy, now));
    }
}
