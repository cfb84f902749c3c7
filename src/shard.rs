//! Per-shard aggregation of sealed test records.
//!
//! Each worker owns exactly one [`ShardAggregator`]. It wraps the worker's
//! [`AttemptTracker`], collects every record the tracker seals, and at the
//! end of the shard flushes everything into an immutable [`ShardSnapshot`].
//!
//! # Flush Semantics
//!
//! Flushing is one-way. Tests still open at flush time (the executor crashed
//! or the worker was stopped) are sealed as failed with a synthesized
//! `interrupted` attempt rather than being dropped. After a flush every
//! mutating call fails with [`ShardError::AlreadyFlushed`].
//!
//! ```text
//!   executor ──► begin/record/skip/time_out ──► AttemptTracker
//!                                                   │ sealed
//!                                                   ▼
//!                                          ShardAggregator.records
//!                                                   │ flush()
//!                                                   ▼
//!                                             ShardSnapshot ──► write_snapshot()
//! ```

pub mod snapshot;

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::model::{Attachment, AttemptStatus, TestIdentity, TestRecord, Totals};
use crate::tracker::{AttemptTracker, RecordedAttempt, RetryPolicy, TrackerError};

pub use snapshot::{
    SNAPSHOT_FORMAT_VERSION, SnapshotError, SnapshotResult, deserialize, read_snapshot, serialize,
    snapshot_file_name, write_snapshot,
};

/// Result type for shard aggregator operations.
pub type ShardResult<T> = Result<T, ShardError>;

/// Errors raised by the shard aggregator.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// The shard was already flushed; its snapshot is final.
    #[error("Shard {shard_index} already flushed")]
    AlreadyFlushed { shard_index: u32 },

    /// Shard coordinates out of range.
    #[error("Invalid shard {shard_index} of {shard_total}")]
    InvalidShard { shard_index: u32, shard_total: u32 },

    /// A record for this identity was already collected.
    #[error("Duplicate test record in shard: {0}")]
    DuplicateRecord(TestIdentity),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Immutable summary of one shard's sealed test records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSnapshot {
    pub format_version: u32,

    /// Zero-based index of this shard.
    pub shard_index: u32,

    /// Number of shards the run was split into.
    pub shard_total: u32,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Sealed records, ordered by declared order.
    pub test_records: Vec<TestRecord>,
}

impl ShardSnapshot {
    pub fn totals(&self) -> Totals {
        Totals::tally(&self.test_records)
    }
}

/// Collects sealed records for one shard.
///
/// # Example
///
/// ```
/// use shardmerge::model::{AttemptStatus, TestIdentity};
/// use shardmerge::shard::ShardAggregator;
/// use shardmerge::tracker::RetryPolicy;
///
/// let mut shard = ShardAggregator::new(0, 2, RetryPolicy::new(2))?;
/// let id = TestIdentity::new("chromium", "tests/home.spec.ts", "renders");
/// shard.begin_test(id.clone(), 0)?;
/// shard.record_attempt(&id, AttemptStatus::Passed, 40, None)?;
///
/// let snapshot = shard.flush()?;
/// assert_eq!(snapshot.test_records.len(), 1);
/// assert!(shard.flush().is_err());
/// # Ok::<(), shardmerge::shard::ShardError>(())
/// ```
#[derive(Debug)]
pub struct ShardAggregator {
    shard_index: u32,
    shard_total: u32,
    tracker: AttemptTracker,
    records: Vec<TestRecord>,
    seen: HashSet<TestIdentity>,
    started_at: DateTime<Utc>,
    flushed: bool,
}

impl ShardAggregator {
    /// Creates the aggregator for shard `shard_index` of `shard_total`.
    pub fn new(shard_index: u32, shard_total: u32, policy: RetryPolicy) -> ShardResult<Self> {
        if shard_total == 0 || shard_index >= shard_total {
            return Err(ShardError::InvalidShard {
                shard_index,
                shard_total,
            });
        }

        Ok(Self {
            shard_index,
            shard_total,
            tracker: AttemptTracker::new(policy),
            records: Vec::new(),
            seen: HashSet::new(),
            started_at: Utc::now(),
            flushed: false,
        })
    }

    /// Overrides the recorded start time.
    pub fn with_started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self
    }

    pub fn shard_index(&self) -> u32 {
        self.shard_index
    }

    pub fn shard_total(&self) -> u32 {
        self.shard_total
    }

    pub fn tracker(&self) -> &AttemptTracker {
        &self.tracker
    }

    /// Records sealed so far, in declared order.
    pub fn records(&self) -> &[TestRecord] {
        &self.records
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Adds a sealed record, keeping the list ordered by declared order.
    pub fn on_test_sealed(&mut self, record: TestRecord) -> ShardResult<()> {
        self.ensure_open()?;
        if !self.seen.insert(record.identity.clone()) {
            return Err(ShardError::DuplicateRecord(record.identity));
        }

        let key = (record.declared_order, &record.identity);
        let pos = self
            .records
            .partition_point(|r| (r.declared_order, &r.identity) < key);
        debug!(
            "Shard {} collected {} ({})",
            self.shard_index, record.identity, record.final_status
        );
        self.records.insert(pos, record);
        Ok(())
    }

    /// Registers a test that is about to run.
    pub fn begin_test(&mut self, identity: TestIdentity, declared_order: u64) -> ShardResult<()> {
        self.ensure_open()?;
        self.ensure_not_collected(&identity)?;
        self.tracker.begin(identity, declared_order)?;
        Ok(())
    }

    /// Marks a registered test as running and returns its attempt index.
    pub fn start_test(&mut self, identity: &TestIdentity) -> ShardResult<u32> {
        self.ensure_open()?;
        Ok(self.tracker.start(identity)?)
    }

    /// Records an attempt; a sealing attempt also stores the record.
    pub fn record_attempt(
        &mut self,
        identity: &TestIdentity,
        status: AttemptStatus,
        duration_ms: u64,
        error: Option<String>,
    ) -> ShardResult<RecordedAttempt> {
        self.record_attempt_with(identity, status, duration_ms, error, Vec::new())
    }

    pub fn record_attempt_with(
        &mut self,
        identity: &TestIdentity,
        status: AttemptStatus,
        duration_ms: u64,
        error: Option<String>,
        attachments: Vec<Attachment>,
    ) -> ShardResult<RecordedAttempt> {
        self.ensure_open()?;
        self.ensure_not_collected(identity)?;
        let recorded =
            self.tracker
                .record_attempt_with(identity, status, duration_ms, error, attachments)?;
        if let Some(record) = recorded.sealed() {
            self.on_test_sealed(record.clone())?;
        }
        Ok(recorded)
    }

    /// Seals a test that was never run.
    pub fn skip_test(&mut self, identity: TestIdentity, declared_order: u64) -> ShardResult<()> {
        self.ensure_open()?;
        self.ensure_not_collected(&identity)?;
        let record = self.tracker.skip(identity, declared_order)?;
        self.on_test_sealed(record)
    }

    /// Seals a test whose worker timed out mid-attempt.
    pub fn time_out(&mut self, identity: &TestIdentity, duration_ms: u64) -> ShardResult<TestRecord> {
        self.ensure_open()?;
        self.ensure_not_collected(identity)?;
        let record = self.tracker.abort(
            identity,
            AttemptStatus::TimedOut,
            duration_ms,
            Some(format!("Worker timed out after {}ms", duration_ms)),
        )?;
        self.on_test_sealed(record.clone())?;
        Ok(record)
    }

    /// Seals the shard and returns its snapshot.
    ///
    /// Open tests are sealed as interrupted first. Can only succeed once.
    pub fn flush(&mut self) -> ShardResult<ShardSnapshot> {
        self.ensure_open()?;

        let interrupted = self.tracker.interrupt_open();
        if !interrupted.is_empty() {
            warn!(
                "Shard {} flushed with {} unfinished tests; marking them interrupted",
                self.shard_index,
                interrupted.len()
            );
        }
        // Every interrupted record is collected before any error surfaces.
        let mut first_err = None;
        for record in interrupted {
            if let Err(e) = self.on_test_sealed(record) {
                warn!("Shard {}: {}", self.shard_index, e);
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        self.flushed = true;
        let test_records = std::mem::take(&mut self.records);
        let finished_at = Utc::now().max(self.started_at);

        let snapshot = ShardSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            shard_index: self.shard_index,
            shard_total: self.shard_total,
            started_at: self.started_at,
            finished_at,
            test_records,
        };

        let totals = snapshot.totals();
        info!(
            "Shard {}/{} flushed: {} passed, {} failed, {} flaky, {} skipped",
            self.shard_index, self.shard_total, totals.passed, totals.failed, totals.flaky, totals.skipped
        );

        Ok(snapshot)
    }

    /// A collected record is final; its identity can never be reopened.
    fn ensure_not_collected(&self, identity: &TestIdentity) -> ShardResult<()> {
        if self.seen.contains(identity) {
            return Err(ShardError::DuplicateRecord(identity.clone()));
        }
        Ok(())
    }

    fn ensure_open(&self) -> ShardResult<()> {
        if self.flushed {
            return Err(ShardError::AlreadyFlushed {
                shard_index: self.shard_index,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FinalStatus;
    use crate::model::tests::record;
    use AttemptStatus::*;

    fn id(title: &str) -> TestIdentity {
        TestIdentity::new("chromium", "tests/app.spec.ts", title)
    }

    #[test]
    fn test_invalid_shard_rejected() {
        assert!(matches!(
            ShardAggregator::new(2, 2, RetryPolicy::default()),
            Err(ShardError::InvalidShard { shard_index: 2, shard_total: 2 })
        ));
        assert!(ShardAggregator::new(0, 0, RetryPolicy::default()).is_err());
    }

    #[test]
    fn test_records_kept_in_declared_order() {
        let mut shard = ShardAggregator::new(0, 1, RetryPolicy::default()).unwrap();
        shard.on_test_sealed(record("c", 9, &[Passed])).unwrap();
        shard.on_test_sealed(record("a", 1, &[Passed])).unwrap();
        shard.on_test_sealed(record("b", 4, &[Failed])).unwrap();

        let orders: Vec<u64> = shard.records().iter().map(|r| r.declared_order).collect();
        assert_eq!(orders, vec![1, 4, 9]);
    }

    #[test]
    fn test_duplicate_record_rejected() {
        let mut shard = ShardAggregator::new(0, 1, RetryPolicy::default()).unwrap();
        shard.on_test_sealed(record("a", 1, &[Passed])).unwrap();
        assert!(matches!(
            shard.on_test_sealed(record("a", 1, &[Passed])),
            Err(ShardError::DuplicateRecord(_))
        ));
    }

    #[test]
    fn test_sealing_attempt_is_collected() {
        let mut shard = ShardAggregator::new(1, 2, RetryPolicy::new(2)).unwrap();
        shard.begin_test(id("b"), 1).unwrap();
        shard.record_attempt(&id("b"), Failed, 10, Some("x".into())).unwrap();
        assert!(shard.records().is_empty());
        shard.record_attempt(&id("b"), Failed, 10, Some("x".into())).unwrap();
        assert_eq!(shard.records().len(), 1);
        assert_eq!(shard.records()[0].final_status, FinalStatus::Failed);
    }

    #[test]
    fn test_flush_interrupts_open_tests() {
        let mut shard = ShardAggregator::new(0, 1, RetryPolicy::new(3)).unwrap();
        shard.begin_test(id("done"), 0).unwrap();
        shard.record_attempt(&id("done"), Passed, 5, None).unwrap();
        shard.begin_test(id("crashed"), 1).unwrap();
        shard.start_test(&id("crashed")).unwrap();

        let snapshot = shard.flush().unwrap();
        assert_eq!(snapshot.test_records.len(), 2);
        let crashed = &snapshot.test_records[1];
        assert_eq!(crashed.identity.title, "crashed");
        assert_eq!(crashed.final_status, FinalStatus::Failed);
        assert_eq!(crashed.attempts.last().unwrap().status, Interrupted);
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert!(snapshot.finished_at >= snapshot.started_at);
    }

    #[test]
    fn test_time_out_seals_timed_out() {
        let mut shard = ShardAggregator::new(0, 1, RetryPolicy::new(3)).unwrap();
        shard.begin_test(id("slow"), 0).unwrap();
        let record = shard.time_out(&id("slow"), 30_000).unwrap();
        assert_eq!(record.final_status, FinalStatus::TimedOut);
        assert_eq!(shard.records().len(), 1);
    }

    #[test]
    fn test_skip_after_begin_is_skipped() {
        let mut shard = ShardAggregator::new(0, 1, RetryPolicy::new(2)).unwrap();
        shard.begin_test(id("announced"), 0).unwrap();
        shard.skip_test(id("announced"), 0).unwrap();
        shard.begin_test(id("started"), 1).unwrap();
        shard.start_test(&id("started")).unwrap();
        shard.skip_test(id("started"), 1).unwrap();

        let snapshot = shard.flush().unwrap();
        let statuses: Vec<FinalStatus> = snapshot.test_records.iter().map(|r| r.final_status).collect();
        assert_eq!(statuses, vec![FinalStatus::Skipped, FinalStatus::Skipped]);
        assert!(snapshot.test_records.iter().all(|r| r.attempts.is_empty()));
        assert_eq!(snapshot.totals().failed, 0);
    }

    #[test]
    fn test_collected_identity_cannot_be_reopened() {
        let mut shard = ShardAggregator::new(0, 1, RetryPolicy::new(2)).unwrap();
        shard.on_test_sealed(record("a", 0, &[Passed])).unwrap();

        assert!(matches!(shard.begin_test(id("a"), 0), Err(ShardError::DuplicateRecord(_))));
        assert!(matches!(
            shard.record_attempt(&id("a"), Failed, 1, None),
            Err(ShardError::DuplicateRecord(_))
        ));
        assert!(matches!(shard.skip_test(id("a"), 0), Err(ShardError::DuplicateRecord(_))));
        assert!(matches!(shard.time_out(&id("a"), 1), Err(ShardError::DuplicateRecord(_))));
        assert_eq!(shard.tracker().open_count(), 0);

        shard.begin_test(id("b"), 1).unwrap();
        let snapshot = shard.flush().unwrap();
        let titles: Vec<&str> = snapshot.test_records.iter().map(|r| r.identity.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "b"]);
        assert_eq!(snapshot.test_records[0].final_status, FinalStatus::Passed);
    }

    #[test]
    fn test_failed_flush_keeps_interrupted_records() {
        let mut shard = ShardAggregator::new(0, 1, RetryPolicy::new(2)).unwrap();
        shard.begin_test(id("a"), 0).unwrap();
        shard.begin_test(id("b"), 1).unwrap();
        // Collected directly while the tracker still has it open.
        shard.on_test_sealed(record("a", 0, &[Passed])).unwrap();

        assert!(matches!(shard.flush(), Err(ShardError::DuplicateRecord(_))));
        assert!(!shard.is_flushed());

        let snapshot = shard.flush().unwrap();
        let titles: Vec<&str> = snapshot.test_records.iter().map(|r| r.identity.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "b"]);
        assert_eq!(snapshot.test_records[1].attempts[0].status, Interrupted);
    }

    #[test]
    fn test_operations_after_flush_fail() {
        let mut shard = ShardAggregator::new(0, 1, RetryPolicy::default()).unwrap();
        shard.skip_test(id("s"), 0).unwrap();
        shard.flush().unwrap();
        assert!(shard.is_flushed());

        assert!(matches!(shard.flush(), Err(ShardError::AlreadyFlushed { shard_index: 0 })));
        assert!(matches!(
            shard.on_test_sealed(record("x", 5, &[Passed])),
            Err(ShardError::AlreadyFlushed { .. })
        ));
        assert!(matches!(
            shard.record_attempt(&id("y"), Passed, 1, None),
            Err(ShardError::AlreadyFlushed { .. })
        ));
    }
}
