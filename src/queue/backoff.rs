//! # Per-key exponential backoff
//!
//! Tracks consecutive failures for every key and turns the count into a
//! retry delay: `base * 2^failures`, capped at `cap`.
//!
//! ```
//! use reconcile_rs::queue::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
//! assert_eq!(backoff.delay_for(0), Duration::from_millis(5));
//! assert_eq!(backoff.delay_for(3), Duration::from_millis(40));
//! ```

use std::collections::HashMap;
use std::time::Duration;

use crate::model::Key;

/// Delay calculator. Stateless; the failure count lives in [`FailureTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay for a key that has already failed `failures` times.
    ///
    /// Monotonic non-decreasing in `failures` and never above `cap`.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        1u32.checked_shl(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |delay| delay.min(self.cap))
    }
}

/// Consecutive-failure counters, keyed by work item key.
#[derive(Debug)]
pub struct FailureTracker {
    backoff: ExponentialBackoff,
    failures: HashMap<Key, u32>,
}

impl FailureTracker {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            backoff,
            failures: HashMap::new(),
        }
    }

    /// Record one more failure for `key` and return how long to wait before
    /// retrying it.
    pub fn next_delay(&mut self, key: &Key) -> Duration {
        let count = self.failures.entry(key.clone()).or_insert(0);
        let delay = self.backoff.delay_for(*count);
        *count = count.saturating_add(1);
        delay
    }

    /// Reset the counter for `key` after a success (or a give-up).
    pub fn forget(&mut self, key: &Key) {
        self.failures.remove(key);
    }

    pub fn num_requeues(&self, key: &Key) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys with a non-zero failure count.
    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}
