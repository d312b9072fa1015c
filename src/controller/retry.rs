//! Retry classification and backoff for the watch loops
//!
//! A reconcile pass ends in one of three ways. `Retryable` outcomes (a
//! dependency that is not there yet) are redelivered with an exponential
//! backoff for as long as it takes. `Fatal` outcomes are retried a bounded
//! number of times and then dropped until the object changes again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Result of one reconcile pass
#[derive(Debug)]
pub enum ReconcileOutcome {
    Success,
    Retryable(String),
    Fatal(String),
}

impl ReconcileOutcome {
    /// Classify an error handed to a controller's error policy
    pub fn from_error(error: &Error) -> Self {
        if error.is_retriable() {
            ReconcileOutcome::Retryable(error.to_string())
        } else {
            ReconcileOutcome::Fatal(error.to_string())
        }
    }
}

impl From<Result<()>> for ReconcileOutcome {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => ReconcileOutcome::Success,
            Err(e) => ReconcileOutcome::from_error(&e),
        }
    }
}

/// Calculate exponential backoff duration
///
/// # Arguments
/// * `attempt` - Current retry attempt number (0-indexed)
/// * `base_delay_secs` - Base delay in seconds (default: 15)
/// * `max_delay_secs` - Maximum delay cap in seconds (default: 300 = 5 minutes)
pub fn calculate_backoff(
    attempt: u32,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
) -> Duration {
    let base = base_delay_secs.unwrap_or(15);
    let max = max_delay_secs.unwrap_or(300);

    // Exponential: base * 2^attempt, capped at max
    let delay_secs = base.saturating_mul(2_u64.saturating_pow(attempt.min(5)));
    Duration::from_secs(delay_secs.min(max))
}

/// Per-object attempt counter shared by a controller's error policy
#[derive(Debug)]
pub struct RetryTracker {
    attempts: Mutex<HashMap<String, u32>>,
    max_fatal_retries: u32,
}

const RETRYABLE_BASE_SECS: u64 = 5;
const FATAL_BASE_SECS: u64 = 15;

impl RetryTracker {
    pub fn new(max_fatal_retries: u32) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_fatal_retries,
        }
    }

    fn bump(&self, key: &str) -> u32 {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counter = attempts.entry(key.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn reset(&self, key: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// What the watch loop should do after `outcome` for `key`
    pub fn next_action(&self, key: &str, outcome: &ReconcileOutcome, resync: Duration) -> Action {
        match outcome {
            ReconcileOutcome::Success => {
                self.reset(key);
                Action::requeue(resync)
            }
            ReconcileOutcome::Retryable(reason) => {
                let attempt = self.bump(key);
                let delay = calculate_backoff(attempt - 1, Some(RETRYABLE_BASE_SECS), None);
                debug!("{} not ready ({}), retrying in {:?}", key, reason, delay);
                Action::requeue(delay)
            }
            ReconcileOutcome::Fatal(error) => {
                let attempt = self.bump(key);
                if attempt > self.max_fatal_retries {
                    warn!(
                        "Giving up on {} after {} attempts: {}; waiting for the next change",
                        key,
                        attempt - 1,
                        error
                    );
                    self.reset(key);
                    return Action::await_change();
                }
                Action::requeue(calculate_backoff(attempt - 1, Some(FATAL_BASE_SECS), None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Backoff
    // =========================================================================

    #[test]
    fn test_backoff_calculation() {
        assert_eq!(calculate_backoff(0, None, None), Duration::from_secs(15));
        assert_eq!(calculate_backoff(1, None, None), Duration::from_secs(30));
        assert_eq!(calculate_backoff(2, None, None), Duration::from_secs(60));
        assert_eq!(calculate_backoff(4, None, None), Duration::from_secs(240));
        // capped at 300 s (5 min)
        assert_eq!(calculate_backoff(5, None, None), Duration::from_secs(300));
        assert_eq!(calculate_backoff(50, None, None), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_custom_base() {
        assert_eq!(calculate_backoff(0, Some(5), Some(60)), Duration::from_secs(5));
        assert_eq!(calculate_backoff(3, Some(5), Some(60)), Duration::from_secs(40));
        assert_eq!(calculate_backoff(4, Some(5), Some(60)), Duration::from_secs(60));
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    #[test]
    fn test_outcome_classification() {
        assert!(matches!(ReconcileOutcome::from(Ok(())), ReconcileOutcome::Success));
        assert!(matches!(
            ReconcileOutcome::from(Err(Error::ResourceNotReady("lb".into()))),
            ReconcileOutcome::Retryable(_)
        ));
        assert!(matches!(
            ReconcileOutcome::from(Err(Error::IntegrityError("subnets".into()))),
            ReconcileOutcome::Fatal(_)
        ));
    }

    #[test]
    fn test_retryable_keeps_backing_off() {
        let tracker = RetryTracker::new(1);
        let outcome = ReconcileOutcome::Retryable("pending".into());
        let resync = Duration::from_secs(600);

        assert_eq!(
            tracker.next_action("ns/a", &outcome, resync),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            tracker.next_action("ns/a", &outcome, resync),
            Action::requeue(Duration::from_secs(10))
        );
        assert_eq!(tracker.attempts("ns/a"), 2);

        tracker.next_action("ns/a", &ReconcileOutcome::Success, resync);
        assert_eq!(tracker.attempts("ns/a"), 0);
    }

    #[test]
    fn test_fatal_is_dropped_after_max_retries() {
        let tracker = RetryTracker::new(2);
        let resync = Duration::from_secs(600);
        let fatal = || ReconcileOutcome::from_error(&Error::IntegrityError("two subnets".into()));

        assert_eq!(
            tracker.next_action("ns/b", &fatal(), resync),
            Action::requeue(Duration::from_secs(15))
        );
        assert_eq!(
            tracker.next_action("ns/b", &fatal(), resync),
            Action::requeue(Duration::from_secs(30))
        );
        assert_eq!(tracker.next_action("ns/b", &fatal(), resync), Action::await_change());
        assert_eq!(tracker.attempts("ns/b"), 0);
    }
}
