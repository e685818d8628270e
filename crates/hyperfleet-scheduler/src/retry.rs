//! Bounded exponential backoff for lifecycle actions.
//!
//! Retry state is process-local: a restart clears it and every pending
//! action gets a fresh budget.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use hyperfleet_core::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts allowed before a create is abandoned.
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before attempt `failures + 1`: `base * 2^(failures - 1)`, capped.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exp = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_retries
    }
}

/// Failure count and next eligible attempt for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub failures: u32,
    pub next_attempt: Instant,
}

/// Retry bookkeeping keyed by instance.
#[derive(Debug, Default)]
pub struct RetryBook {
    entries: HashMap<InstanceId, RetryState>,
}

impl RetryBook {
    pub fn is_due(&self, instance: &str, now: Instant) -> bool {
        self.entries
            .get(instance)
            .is_none_or(|s| s.next_attempt <= now)
    }

    pub fn failures(&self, instance: &str) -> u32 {
        self.entries.get(instance).map_or(0, |s| s.failures)
    }

    /// Record a failure and schedule the next attempt. Returns the new state.
    pub fn record_failure(&mut self, instance: &str, policy: &RetryPolicy, now: Instant) -> RetryState {
        let failures = self.failures(instance) + 1;
        let state = RetryState {
            failures,
            next_attempt: now + policy.backoff(failures),
        };
        self.entries.insert(instance.to_string(), state);
        state
    }

    pub fn clear(&mut self, instance: &str) {
        self.entries.remove(instance);
    }

    pub fn get(&self, instance: &str) -> Option<RetryState> {
        self.entries.get(instance).copied()
    }
}
