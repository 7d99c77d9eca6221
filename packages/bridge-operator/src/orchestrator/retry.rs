//! Activity retry policies
//!
//! Exponential backoff bounded by an attempt budget per activity class. Whether
//! a failure is retried at all is decided by [`BridgeError::is_retryable`];
//! the policy only says how often and how long to wait.
//!
//! [`BridgeError::is_retryable`]: crate::error::BridgeError::is_retryable

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse activity families sharing a retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityClass {
    /// Deterministic checks; a failure repeats identically
    Validation,
    /// Ledger reads and writes
    Storage,
    /// Chain calls that may hit a flaky node
    Rpc,
    /// Polling for on-chain inclusion
    Confirmation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn for_class(class: ActivityClass) -> Self {
        match class {
            ActivityClass::Validation => Self {
                max_attempts: 1,
                initial_backoff: Duration::ZERO,
                max_backoff: Duration::ZERO,
                backoff_multiplier: 1.0,
            },
            ActivityClass::Storage => Self {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(5),
                backoff_multiplier: 2.0,
            },
            ActivityClass::Rpc => Self {
                max_attempts: 8,
                initial_backoff: Duration::from_secs(2),
                max_backoff: Duration::from_secs(60),
                backoff_multiplier: 2.0,
            },
            ActivityClass::Confirmation => Self {
                max_attempts: 30,
                initial_backoff: Duration::from_secs(3),
                max_backoff: Duration::from_secs(30),
                backoff_multiplier: 1.5,
            },
        }
    }

    /// Fixed short backoff, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt fits after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl From<ActivityClass> for RetryPolicy {
    fn from(class: ActivityClass) -> Self {
        Self::for_class(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let rpc = RetryPolicy::for_class(ActivityClass::Rpc);

        assert_eq!(rpc.backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(rpc.backoff_for_attempt(1), Duration::from_secs(4));
        assert_eq!(rpc.backoff_for_attempt(2), Duration::from_secs(8));
        assert_eq!(rpc.backoff_for_attempt(5), Duration::from_secs(60)); // capped

        let storage = RetryPolicy::for_class(ActivityClass::Storage);
        assert_eq!(storage.backoff_for_attempt(0), Duration::from_millis(500));
        assert_eq!(storage.backoff_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_attempt_budgets() {
        let validation = RetryPolicy::for_class(ActivityClass::Validation);
        assert!(!validation.should_retry(1));

        let rpc = RetryPolicy::for_class(ActivityClass::Rpc);
        assert!(rpc.should_retry(7));
        assert!(!rpc.should_retry(8));

        let confirmation = RetryPolicy::from(ActivityClass::Confirmation);
        assert_eq!(confirmation.max_attempts, 30);
        assert_eq!(confirmation.backoff_for_attempt(20), Duration::from_secs(30));
    }
}
