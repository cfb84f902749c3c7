//! Per-test attempt tracking inside one worker.
//!
//! The [`AttemptTracker`] owns the in-progress history of every test the
//! worker has started. Each recorded attempt is fed to the [`RetryPolicy`],
//! which either asks for another attempt or lets the tracker seal the
//! record into an immutable [`TestRecord`].
//!
//! # State Machine
//!
//! ```text
//!  Pending ──► Running(0) ──► Running(1) ──► ... ──► Sealed(status)
//!                  │               │                     ▲
//!                  └───────────────┴─────────────────────┘
//!                     pass, budget exhausted, or abort
//! ```
//!
//! `Sealed` is terminal: attempts recorded against a sealed test are
//! rejected. Tests still open when the worker shuts down are sealed by
//! [`AttemptTracker::interrupt_open`] with a synthesized `interrupted`
//! attempt, so a crash never makes a test disappear.
//!
//! There is exactly one writer per test (the worker's own event stream), so
//! the tracker takes `&mut self` and holds no locks.

pub mod retry;

use std::collections::HashMap;

use tracing::debug;

use crate::model::{Attachment, AttemptRecord, AttemptStatus, FinalStatus, TestIdentity, TestRecord};

pub use retry::{RetryDecision, RetryPolicy, RetryPredicate};

/// Result type for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Errors raised by invalid lifecycle transitions.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The test was already sealed; its record is immutable.
    #[error("Test already sealed as {status}: {identity}")]
    AlreadySealed {
        identity: TestIdentity,
        status: FinalStatus,
    },

    /// `begin` or `skip` was called for a test the tracker already knows.
    #[error("Test already tracked: {0}")]
    AlreadyTracked(TestIdentity),

    /// An operation needed an open test that was never begun.
    #[error("Unknown test: {0}")]
    UnknownTest(TestIdentity),

    /// `skip` arrived after the test had already recorded attempts.
    #[error("Cannot skip {identity}: {attempts} attempt(s) already recorded")]
    SkipAfterAttempts { identity: TestIdentity, attempts: usize },
}

/// Lifecycle state of one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    /// Registered, no attempt started yet.
    Pending,
    /// Attempt `attempt` is (or is about to be) executing.
    Running { attempt: u32 },
    /// Terminal.
    Sealed(FinalStatus),
}

/// What the worker should do after an attempt was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Re-queue the test for another attempt.
    Retry { next_attempt: u32 },
    /// The test is finished; hand the record to the shard aggregator.
    Sealed(TestRecord),
}

/// An attempt as recorded, plus the resulting disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAttempt {
    pub attempt: AttemptRecord,
    pub disposition: Disposition,
}

impl RecordedAttempt {
    /// The sealed record, if this attempt finished the test.
    pub fn sealed(&self) -> Option<&TestRecord> {
        match &self.disposition {
            Disposition::Sealed(record) => Some(record),
            Disposition::Retry { .. } => None,
        }
    }

    pub fn into_sealed(self) -> Option<TestRecord> {
        match self.disposition {
            Disposition::Sealed(record) => Some(record),
            Disposition::Retry { .. } => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    declared_order: u64,
    attempts: Vec<AttemptRecord>,
    state: TestState,
}

/// Tracks attempt history for the tests of one worker.
///
/// # Example
///
/// ```
/// use shardmerge::model::{AttemptStatus, FinalStatus, TestIdentity};
/// use shardmerge::tracker::{AttemptTracker, Disposition, RetryPolicy};
///
/// let mut tracker = AttemptTracker::new(RetryPolicy::new(2));
/// let id = TestIdentity::new("chromium", "tests/cart.spec.ts", "adds item");
/// tracker.begin(id.clone(), 0)?;
///
/// let first = tracker.record_attempt(&id, AttemptStatus::Failed, 120, Some("boom".into()))?;
/// assert_eq!(first.disposition, Disposition::Retry { next_attempt: 1 });
///
/// let second = tracker.record_attempt(&id, AttemptStatus::Passed, 95, None)?;
/// assert_eq!(second.sealed().unwrap().final_status, FinalStatus::Flaky);
/// # Ok::<(), shardmerge::tracker::TrackerError>(())
/// ```
#[derive(Debug)]
pub struct AttemptTracker {
    policy: RetryPolicy,
    entries: HashMap<TestIdentity, Entry>,
    next_order: u64,
}

impl AttemptTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
            next_order: 0,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Registers a test as `Pending`.
    pub fn begin(&mut self, identity: TestIdentity, declared_order: u64) -> TrackerResult<()> {
        if self.entries.contains_key(&identity) {
            return Err(TrackerError::AlreadyTracked(identity));
        }
        self.bump_order(declared_order);
        debug!("Begin {} (declared order {})", identity, declared_order);
        self.entries.insert(
            identity,
            Entry {
                declared_order,
                attempts: Vec::new(),
                state: TestState::Pending,
            },
        );
        Ok(())
    }

    /// Moves a `Pending` test to `Running(0)` and returns the attempt index.
    ///
    /// A test already running keeps its current attempt index.
    pub fn start(&mut self, identity: &TestIdentity) -> TrackerResult<u32> {
        let entry = self
            .entries
            .get_mut(identity)
            .ok_or_else(|| TrackerError::UnknownTest(identity.clone()))?;
        match entry.state {
            TestState::Pending => {
                entry.state = TestState::Running { attempt: 0 };
                Ok(0)
            }
            TestState::Running { attempt } => Ok(attempt),
            TestState::Sealed(status) => Err(TrackerError::AlreadySealed {
                identity: identity.clone(),
                status,
            }),
        }
    }

    /// Records the outcome of one attempt.
    ///
    /// A test that was never begun is registered implicitly, ordered after
    /// every test seen so far.
    pub fn record_attempt(
        &mut self,
        identity: &TestIdentity,
        status: AttemptStatus,
        duration_ms: u64,
        error: Option<String>,
    ) -> TrackerResult<RecordedAttempt> {
        self.record_attempt_with(identity, status, duration_ms, error, Vec::new())
    }

    /// Like [`record_attempt`](Self::record_attempt), carrying attachments.
    pub fn record_attempt_with(
        &mut self,
        identity: &TestIdentity,
        status: AttemptStatus,
        duration_ms: u64,
        error: Option<String>,
        attachments: Vec<Attachment>,
    ) -> TrackerResult<RecordedAttempt> {
        let attempt = self.push_attempt(identity, status, duration_ms, error, attachments)?;

        let disposition = match self.policy.decide(&self.entry(identity)?.attempts) {
            RetryDecision::Retry { next_attempt } => {
                debug!("Retrying {} (attempt {})", identity, next_attempt);
                self.entry_mut(identity)?.state = TestState::Running {
                    attempt: next_attempt,
                };
                Disposition::Retry { next_attempt }
            }
            RetryDecision::Seal => Disposition::Sealed(self.seal(identity)?),
        };

        Ok(RecordedAttempt {
            attempt,
            disposition,
        })
    }

    /// Records a terminal attempt and seals the test regardless of budget.
    ///
    /// Used when the worker gives up on a test, e.g. on a worker-level
    /// timeout (`AttemptStatus::TimedOut`).
    pub fn abort(
        &mut self,
        identity: &TestIdentity,
        status: AttemptStatus,
        duration_ms: u64,
        error: Option<String>,
    ) -> TrackerResult<TestRecord> {
        self.push_attempt(identity, status, duration_ms, error, Vec::new())?;
        self.seal(identity)
    }

    /// Seals a test that never ran.
    ///
    /// An unknown test is registered at `declared_order` first. A test that
    /// was already begun keeps its original declared order, and may be
    /// skipped as long as no attempt has been recorded for it.
    pub fn skip(&mut self, identity: TestIdentity, declared_order: u64) -> TrackerResult<TestRecord> {
        match self.entries.get(&identity) {
            None => self.begin(identity.clone(), declared_order)?,
            Some(entry) if !entry.attempts.is_empty() => {
                return Err(TrackerError::SkipAfterAttempts {
                    attempts: entry.attempts.len(),
                    identity,
                });
            }
            // Sealed tests are rejected by `seal`.
            Some(_) => {}
        }
        self.seal(&identity)
    }

    /// Current lifecycle state, if the test is known.
    pub fn state(&self, identity: &TestIdentity) -> Option<TestState> {
        self.entries.get(identity).map(|e| e.state)
    }

    /// Number of tests not yet sealed.
    pub fn open_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| !matches!(e.state, TestState::Sealed(_)))
            .count()
    }

    /// Seals every open test with a synthesized `interrupted` attempt.
    ///
    /// Returned records are ordered by declared order.
    pub fn interrupt_open(&mut self) -> Vec<TestRecord> {
        let mut open: Vec<(u64, TestIdentity)> = self
            .entries
            .iter()
            .filter(|(_, e)| !matches!(e.state, TestState::Sealed(_)))
            .map(|(id, e)| (e.declared_order, id.clone()))
            .collect();
        open.sort();

        let mut sealed = Vec::with_capacity(open.len());
        for (_, identity) in open {
            let Some(entry) = self.entries.get_mut(&identity) else {
                continue;
            };
            entry.attempts.push(AttemptRecord {
                attempt_index: entry.attempts.len() as u32,
                status: AttemptStatus::Interrupted,
                duration_ms: 0,
                error_summary: Some("Worker stopped before the attempt finished".to_string()),
                attachments: Vec::new(),
            });
            let attempts = std::mem::take(&mut entry.attempts);
            let record = TestRecord::seal(identity, entry.declared_order, attempts);
            entry.state = TestState::Sealed(record.final_status);
            debug!("Interrupted open test {}", record.identity);
            sealed.push(record);
        }
        sealed
    }

    fn push_attempt(
        &mut self,
        identity: &TestIdentity,
        status: AttemptStatus,
        duration_ms: u64,
        error: Option<String>,
        attachments: Vec<Attachment>,
    ) -> TrackerResult<AttemptRecord> {
        if !self.entries.contains_key(identity) {
            let order = self.next_order;
            self.begin(identity.clone(), order)?;
        }

        let entry = self.entry_mut(identity)?;
        if let TestState::Sealed(status) = entry.state {
            return Err(TrackerError::AlreadySealed {
                identity: identity.clone(),
                status,
            });
        }

        let attempt = AttemptRecord {
            attempt_index: entry.attempts.len() as u32,
            status,
            duration_ms,
            error_summary: if status.is_passed() { None } else { error },
            attachments,
        };
        entry.attempts.push(attempt.clone());
        entry.state = TestState::Running {
            attempt: attempt.attempt_index,
        };
        Ok(attempt)
    }

    fn seal(&mut self, identity: &TestIdentity) -> TrackerResult<TestRecord> {
        let entry = self.entry_mut(identity)?;
        if let TestState::Sealed(status) = entry.state {
            return Err(TrackerError::AlreadySealed {
                identity: identity.clone(),
                status,
            });
        }

        // The tracker keeps only the status; the attempts move into the record.
        let attempts = std::mem::take(&mut entry.attempts);
        let record = TestRecord::seal(identity.clone(), entry.declared_order, attempts);
        entry.state = TestState::Sealed(record.final_status);
        debug!("Sealed {} as {}", identity, record.final_status);
        Ok(record)
    }

    fn entry(&self, identity: &TestIdentity) -> TrackerResult<&Entry> {
        self.entries
            .get(identity)
            .ok_or_else(|| TrackerError::UnknownTest(identity.clone()))
    }

    fn entry_mut(&mut self, identity: &TestIdentity) -> TrackerResult<&mut Entry> {
        self.entries
            .get_mut(identity)
            .ok_or_else(|| TrackerError::UnknownTest(identity.clone()))
    }

    fn bump_order(&mut self, declared_order: u64) {
        self.next_order = self.next_order.max(declared_order.saturating_add(1));
    }
}

impl Default for AttemptTracker {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AttemptStatus::*;

    fn id(title: &str) -> TestIdentity {
        TestIdentity::new("chromium", "tests/app.spec.ts", title)
    }

    fn run(tracker: &mut AttemptTracker, title: &str, statuses: &[AttemptStatus]) -> Vec<RecordedAttempt> {
        statuses
            .iter()
            .map(|s| tracker.record_attempt(&id(title), *s, 50, Some("err".into())).unwrap())
            .collect()
    }

    #[test]
    fn test_single_pass_seals_passed() {
        let mut tracker = AttemptTracker::new(RetryPolicy::new(3));
        tracker.begin(id("a"), 0).unwrap();
        let out = run(&mut tracker, "a", &[Passed]);
        let record = out[0].sealed().unwrap();
        assert_eq!(record.final_status, FinalStatus::Passed);
        assert_eq!(record.attempts.len(), 1);
        assert!(record.attempts[0].error_summary.is_none());
        assert_eq!(tracker.state(&id("a")), Some(TestState::Sealed(FinalStatus::Passed)));
    }

    #[test]
    fn test_fail_fail_pass_is_flaky() {
        let mut tracker = AttemptTracker::new(RetryPolicy::new(3));
        tracker.begin(id("a"), 7).unwrap();
        let out = run(&mut tracker, "a", &[Failed, Failed, Passed]);

        assert_eq!(out[0].disposition, Disposition::Retry { next_attempt: 1 });
        assert_eq!(out[1].disposition, Disposition::Retry { next_attempt: 2 });
        let record = out[2].sealed().unwrap();
        assert_eq!(record.final_status, FinalStatus::Flaky);
        assert_eq!(record.declared_order, 7);
        assert_eq!(
            record.attempts.iter().map(|a| a.attempt_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_three_failures_seal_failed() {
        let mut tracker = AttemptTracker::new(RetryPolicy::new(3));
        let out = run(&mut tracker, "a", &[Failed, Failed, Failed]);
        let record = out[2].sealed().unwrap();
        assert_eq!(record.final_status, FinalStatus::Failed);
        assert_eq!(record.attempts.len(), 3);
    }

    #[test]
    fn test_last_timeout_seals_timed_out() {
        let mut tracker = AttemptTracker::new(RetryPolicy::new(2));
        let out = run(&mut tracker, "a", &[Failed, TimedOut]);
        assert_eq!(out[1].sealed().unwrap().final_status, FinalStatus::TimedOut);
    }

    #[test]
    fn test_record_after_seal_rejected() {
        let mut tracker = AttemptTracker::new(RetryPolicy::new(1));
        run(&mut tracker, "a", &[Passed]);
        let err = tracker.record_attempt(&id("a"), Failed, 1, None).unwrap_err();
        assert!(matches!(err, TrackerError::AlreadySealed { status: FinalStatus::Passed, .. }));
    }

    #[test]
    fn test_state_transitions() {
        let mut tracker = AttemptTracker::new(RetryPolicy::new(2));
        tracker.begin(id("a"), 0).unwrap();
        assert_eq!(tracker.state(&id("a")), Some(TestState::Pending));
        assert_eq!(tracker.start(&id("a")).unwrap(), 0);
        assert_eq!(tracker.state(&id("a")), Some(TestState::Running { attempt: 0 }));
        run(&mut tracker, "a", &[Failed]);
        assert_eq!(tracker.state(&id("a")), Some(TestState::Running { attempt: 1 }));
        assert_eq!(tracker.open_count(), 1);
        run(&mut tracker, "a", &[Failed]);
        assert_eq!(tracker.state(&id("a")), Some(TestState::Sealed(FinalStatus::Failed)));
        assert_eq!(tracker.open_count(), 0);
    }

    #[test]
    fn test_begin_twice_rejected() {
        let mut tracker = AttemptTracker::default();
        tracker.begin(id("a"), 0).unwrap();
        assert!(matches!(tracker.begin(id("a"), 1), Err(TrackerError::AlreadyTracked(_))));
    }

    #[test]
    fn test_start_unknown_rejected() {
        let mut tracker = AttemptTracker::default();
        assert!(matches!(tracker.start(&id("nope")), Err(TrackerError::UnknownTest(_))));
    }

    #[test]
    fn test_implicit_begin_orders_after_known_tests() {
        let mut tracker = AttemptTracker::default();
        tracker.begin(id("a"), 4).unwrap();
        let out = run(&mut tracker, "b", &[Passed]);
        assert_eq!(out[0].sealed().unwrap().declared_order, 5);
    }

    #[test]
    fn test_abort_seals_despite_budget() {
        let mut tracker = AttemptTracker::new(RetryPolicy::new(5));
        run(&mut tracker, "a", &[Failed]);
        let record = tracker.abort(&id("a"), TimedOut, 30_000, Some("worker timeout".into())).unwrap();
        assert_eq!(record.final_status, FinalStatus::TimedOut);
        assert_eq!(record.attempts.len(), 2);
    }

    #[test]
    fn test_skip_has_no_attempts() {
        let mut tracker = AttemptTracker::default();
        let record = tracker.skip(id("a"), 3).unwrap();
        assert_eq!(record.final_status, FinalStatus::Skipped);
        assert!(record.attempts.is_empty());
    }

    #[test]
    fn test_skip_after_begin_seals_skipped() {
        let mut tracker = AttemptTracker::default();
        tracker.begin(id("announced"), 4).unwrap();
        let record = tracker.skip(id("announced"), 9).unwrap();
        assert_eq!(record.final_status, FinalStatus::Skipped);
        assert_eq!(record.declared_order, 4);
        assert!(record.attempts.is_empty());

        tracker.begin(id("started"), 5).unwrap();
        tracker.start(&id("started")).unwrap();
        let record = tracker.skip(id("started"), 5).unwrap();
        assert_eq!(record.final_status, FinalStatus::Skipped);

        assert_eq!(tracker.open_count(), 0);
        assert!(tracker.interrupt_open().is_empty());
    }

    #[test]
    fn test_skip_rejected_after_attempts_or_seal() {
        let mut tracker = AttemptTracker::new(RetryPolicy::new(3));
        run(&mut tracker, "retrying", &[Failed]);
        assert!(matches!(
            tracker.skip(id("retrying"), 0),
            Err(TrackerError::SkipAfterAttempts { attempts: 1, .. })
        ));
        assert_eq!(tracker.state(&id("retrying")), Some(TestState::Running { attempt: 1 }));

        run(&mut tracker, "done", &[Passed]);
        assert!(matches!(
            tracker.skip(id("done"), 0),
            Err(TrackerError::AlreadySealed { status: FinalStatus::Passed, .. })
        ));
    }

    #[test]
    fn test_interrupt_open_synthesizes_attempt() {
        let mut tracker = AttemptTracker::new(RetryPolicy::new(3));
        tracker.begin(id("pending"), 2).unwrap();
        run(&mut tracker, "retrying", &[Failed]);
        run(&mut tracker, "done", &[Passed]);

        let sealed = tracker.interrupt_open();
        assert_eq!(sealed.len(), 2);
        // "retrying" was implicitly given order 3, after "pending".
        assert_eq!(sealed[0].identity.title, "pending");
        assert_eq!(sealed[0].attempts.len(), 1);
        assert_eq!(sealed[0].attempts[0].status, Interrupted);
        assert_eq!(sealed[0].final_status, FinalStatus::Failed);

        assert_eq!(sealed[1].identity.title, "retrying");
        assert_eq!(sealed[1].attempts.len(), 2);
        assert_eq!(sealed[1].attempts[1].attempt_index, 1);
        assert_eq!(sealed[1].final_status, FinalStatus::Failed);

        assert_eq!(tracker.open_count(), 0);
        assert!(tracker.interrupt_open().is_empty());
    }
}
