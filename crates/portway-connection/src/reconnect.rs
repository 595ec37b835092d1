//! Reconnection backoff
//!
//! The agent retries a server with `min(2^attempt seconds, max_interval)`
//! between attempts, optionally capped at a maximum attempt count. The
//! delay computation is separated from the sleep so the connection loop can
//! race the wait against signals (SIGHUP short-circuits it) and shutdown.

use std::time::Duration;

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    max_interval: Duration,
    /// `None` = retry forever.
    max_attempts: Option<usize>,
    attempt: usize,
}

impl Backoff {
    pub fn new(max_interval: Duration, max_attempts: Option<usize>) -> Self {
        Self {
            max_interval,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the attempt budget is
    /// spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let exp = self.attempt.min(32) as u32;
        let delay = Duration::from_secs(1)
            .checked_mul(2u32.saturating_pow(exp))
            .unwrap_or(self.max_interval)
            .min(self.max_interval);

        self.attempt += 1;
        Some(delay)
    }

    /// Reset after a connection that proved stable.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(10), None);

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(8)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(10)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = Backoff::new(Duration::from_secs(60), None);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let mut backoff = Backoff::new(Duration::from_secs(60), Some(3));

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(300), None);
        for _ in 0..100 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay <= Duration::from_secs(300));
        }
    }
}
