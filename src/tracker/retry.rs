//! Retry decisions for failed attempts.

use std::fmt;
use std::sync::Arc;

use crate::model::{AttemptRecord, AttemptStatus};

/// Predicate deciding whether a non-passing attempt is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&AttemptRecord) -> bool + Send + Sync>;

/// What happens after an attempt is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the test again; `next_attempt` is the index of the coming attempt.
    Retry { next_attempt: u32 },
    /// No further attempts. The record can be sealed.
    Seal,
}

/// Decides whether a test gets another attempt.
///
/// A test is retried while it has consumed fewer than `max_attempts`
/// attempts and the predicate accepts the last (non-passing) attempt.
/// A passing attempt always ends the test.
///
/// # Example
///
/// ```
/// use shardmerge::tracker::{RetryDecision, RetryPolicy};
///
/// let policy = RetryPolicy::new(3);
/// assert_eq!(policy.max_attempts(), 3);
/// assert_eq!(policy.decide(&[]), RetryDecision::Retry { next_attempt: 0 });
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    predicate: RetryPredicate,
}

impl RetryPolicy {
    /// Creates a policy allowing up to `max_attempts` attempts per test.
    ///
    /// Values below 1 are clamped. Failed and timed-out attempts are
    /// retried; interrupted attempts are not.
    pub fn new(max_attempts: u32) -> Self {
        Self::with_retry_statuses(max_attempts, &[AttemptStatus::Failed, AttemptStatus::TimedOut])
    }

    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self::new(1)
    }

    /// Creates a policy retrying only attempts whose status is listed.
    pub fn with_retry_statuses(max_attempts: u32, statuses: &[AttemptStatus]) -> Self {
        let statuses = statuses.to_vec();
        Self {
            max_attempts: max_attempts.max(1),
            predicate: Arc::new(move |attempt| statuses.contains(&attempt.status)),
        }
    }

    /// Replaces the retry predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&AttemptRecord) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides the next step given the attempts recorded so far.
    pub fn decide(&self, attempts: &[AttemptRecord]) -> RetryDecision {
        let consumed = attempts.len() as u32;
        let Some(last) = attempts.last() else {
            return RetryDecision::Retry { next_attempt: 0 };
        };

        if last.status.is_passed() {
            return RetryDecision::Seal;
        }

        if consumed < self.max_attempts && (self.predicate)(last) {
            RetryDecision::Retry {
                next_attempt: consumed,
            }
        } else {
            RetryDecision::Seal
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retries()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::attempt;
    use AttemptStatus::*;

    #[test]
    fn test_retry_until_budget_exhausted() {
        let policy = RetryPolicy::new(3);

        let mut attempts = vec![attempt(0, Failed)];
        assert_eq!(policy.decide(&attempts), RetryDecision::Retry { next_attempt: 1 });
        attempts.push(attempt(1, Failed));
        assert_eq!(policy.decide(&attempts), RetryDecision::Retry { next_attempt: 2 });
        attempts.push(attempt(2, Failed));
        assert_eq!(policy.decide(&attempts), RetryDecision::Seal);
    }

    #[test]
    fn test_pass_always_seals() {
        let policy = RetryPolicy::new(5);
        assert_eq!(policy.decide(&[attempt(0, Passed)]), RetryDecision::Seal);
        assert_eq!(
            policy.decide(&[attempt(0, Failed), attempt(1, Passed)]),
            RetryDecision::Seal
        );
    }

    #[test]
    fn test_zero_max_attempts_is_clamped() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.decide(&[attempt(0, Failed)]), RetryDecision::Seal);
    }

    #[test]
    fn test_interrupted_not_retried_by_default() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.decide(&[attempt(0, Interrupted)]), RetryDecision::Seal);
    }

    #[test]
    fn test_custom_predicate() {
        let policy = RetryPolicy::new(3).with_predicate(|a| {
            a.error_summary
                .as_deref()
                .is_some_and(|e| e.contains("attempt 0"))
        });
        assert_eq!(
            policy.decide(&[attempt(0, Failed)]),
            RetryDecision::Retry { next_attempt: 1 }
        );
        assert_eq!(
            policy.decide(&[attempt(0, Failed), attempt(1, Failed)]),
            RetryDecision::Seal
        );
    }

    #[test]
    fn test_retry_statuses_timed_out_only() {
        let policy = RetryPolicy::with_retry_statuses(2, &[TimedOut]);
        assert_eq!(policy.decide(&[attempt(0, Failed)]), RetryDecision::Seal);
        assert_eq!(
            policy.decide(&[attempt(0, TimedOut)]),
            RetryDecision::Retry { next_attempt: 1 }
        );
    }
}
