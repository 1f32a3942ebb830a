//! Attempt bookkeeping shared by the SOAP retry loop and the status poller.
use std::time::Duration;

use crate::config::BackoffPolicy;

/// Counts attempts against a [`BackoffPolicy`] and hands out jittered delays.
#[derive(Debug)]
pub struct Attempts<'a> {
    policy: &'a BackoffPolicy,
    made: u32,
}

impl<'a> Attempts<'a> {
    pub fn new(policy: &'a BackoffPolicy) -> Self {
        Self { policy, made: 0 }
    }

    /// Starts the next attempt; `None` once the policy is used up.
    pub fn begin(&mut self) -> Option<u32> {
        if self.made >= self.policy.max_attempts {
            return None;
        }
        self.made += 1;
        Some(self.made)
    }

    pub fn made(&self) -> u32 {
        self.made
    }

    pub fn exhausted(&self) -> bool {
        self.made >= self.policy.max_attempts
    }

    /// Delay to wait after the current attempt failed.
    pub fn delay(&self) -> Duration {
        self.policy.delay_for(self.made.max(1), &mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_at_max_attempts() {
        let policy = BackoffPolicy::new(3, 10, 100);
        let mut attempts = Attempts::new(&policy);
        assert_eq!(attempts.begin(), Some(1));
        assert_eq!(attempts.begin(), Some(2));
        assert!(!attempts.exhausted());
        assert_eq!(attempts.begin(), Some(3));
        assert!(attempts.exhausted());
        assert_eq!(attempts.begin(), None);
        assert_eq!(attempts.made(), 3);
    }

    #[test]
    fn delay_stays_within_policy_cap() {
        let policy = BackoffPolicy::new(10, 100, 1_000).with_jitter_percent(50);
        let mut attempts = Attempts::new(&policy);
        for _ in 0..10 {
            attempts.begin();
            let delay = attempts.delay();
            let base = policy.base_delay_for(attempts.made());
            // near the cap the jitter window slides below it
            assert!(delay >= base - base / 2);
            assert!(delay <= Duration::from_millis(1_000));
        }
    }
}
