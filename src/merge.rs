//! Deterministic merging of shard snapshots.
//!
//! [`merge`] is a pure function: it takes whatever snapshots were collected
//! for a run and produces a fresh [`AggregateReport`]. The output depends
//! only on the *set* of inputs, never on their order. Records are sorted
//! by declared order (pre-sharding enumeration position), so the report is
//! identical no matter which shard finished first or how the snapshot
//! files were listed.
//!
//! # Validation
//!
//! | Condition | Result |
//! |-----------|--------|
//! | shard index outside `0..shard_total` | [`MergeError::ShardOutOfRange`] |
//! | snapshot written for another shard total | [`MergeError::ShardTotalMismatch`] |
//! | same shard twice, identical content | deduplicated |
//! | same shard twice, different content | [`MergeError::DuplicateShard`] |
//! | same test in two shards, identical record | deduplicated |
//! | same test in two shards, different record | [`MergeError::ConflictingTestIdentity`] |
//! | shards missing | report with `complete = false` |
//!
//! Conflicts mean the shard assignment itself overlapped. They are never
//! resolved silently.

pub mod collect;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::model::{TestIdentity, TestRecord, Totals};
use crate::shard::{ShardSnapshot, SnapshotError};

pub use collect::collect_snapshots;

/// Result type for merge operations.
pub type MergeResult<T> = Result<T, MergeError>;

/// Fatal merge errors. Each one points at a broken sharding setup.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("Shard total must be at least 1")]
    InvalidShardTotal,

    #[error("Shard index {shard_index} out of range for {shard_total} shards")]
    ShardOutOfRange { shard_index: u32, shard_total: u32 },

    #[error("Shard {shard_index} was produced for {found} shards, expected {expected}")]
    ShardTotalMismatch {
        shard_index: u32,
        found: u32,
        expected: u32,
    },

    #[error("Shard {shard_index} appears more than once with different content")]
    DuplicateShard { shard_index: u32 },

    #[error(
        "Conflicting results for {identity} in shards {first_shard} and {second_shard}; shard assignments overlap"
    )]
    ConflictingTestIdentity {
        identity: TestIdentity,
        first_shard: u32,
        second_shard: u32,
    },

    #[error("Failed to read snapshot {}: {source}", path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: SnapshotError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-fatal notice that some shards have not reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingShardWarning {
    pub missing: Vec<u32>,
    pub expected: u32,
}

impl fmt::Display for MissingShardWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list: Vec<String> = self.missing.iter().map(|i| i.to_string()).collect();
        write!(
            f,
            "Incomplete merge: {} of {} shards missing (indices: {})",
            self.missing.len(),
            self.expected,
            list.join(", ")
        )
    }
}

/// The unified result of a sharded run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Complete and everything passed |
/// | 1 | Failures, or shards missing |
/// | 2 | Complete, no failures, but some tests were flaky |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateReport {
    /// Deduplicated records sorted by declared order.
    pub test_records: Vec<TestRecord>,

    pub totals: Totals,

    /// Sum of all attempt durations.
    pub total_duration_ms: u64,

    /// Earliest shard start among received snapshots.
    pub started_at: Option<DateTime<Utc>>,

    /// Latest shard finish among received snapshots.
    pub finished_at: Option<DateTime<Utc>>,

    pub shards_expected: u32,

    pub shards_received: u32,

    pub missing_shards: Vec<u32>,

    pub complete: bool,
}

impl AggregateReport {
    /// The missing-shard warning for an incomplete report.
    pub fn missing_shard_warning(&self) -> Option<MissingShardWarning> {
        (!self.complete).then(|| MissingShardWarning {
            missing: self.missing_shards.clone(),
            expected: self.shards_expected,
        })
    }

    /// Canonical JSON encoding. Equal reports encode to equal bytes.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// SHA-256 of the canonical encoding, as lowercase hex.
    pub fn digest(&self) -> serde_json::Result<String> {
        let bytes = self.to_json()?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    /// Returns `true` if the report is complete and nothing failed.
    pub fn success(&self) -> bool {
        self.complete && self.totals.failed == 0
    }

    pub fn exit_code(&self) -> i32 {
        if !self.success() {
            1
        } else if self.totals.flaky > 0 {
            2
        } else {
            0
        }
    }

    /// Records whose final status counts as a failure.
    pub fn failures(&self) -> impl Iterator<Item = &TestRecord> {
        self.test_records
            .iter()
            .filter(|r| r.final_status.is_failure())
    }
}

/// Merges shard snapshots into one report.
///
/// # Example
///
/// ```
/// use shardmerge::merge::merge;
///
/// let report = merge(&[], 2)?;
/// assert!(!report.complete);
/// assert_eq!(report.missing_shards, vec![0, 1]);
/// # Ok::<(), shardmerge::merge::MergeError>(())
/// ```
pub fn merge(snapshots: &[ShardSnapshot], shard_total: u32) -> MergeResult<AggregateReport> {
    if shard_total == 0 {
        return Err(MergeError::InvalidShardTotal);
    }

    // Pass 1: one snapshot per shard index.
    let mut shards: BTreeMap<u32, &ShardSnapshot> = BTreeMap::new();
    for snapshot in snapshots {
        if snapshot.shard_index >= shard_total {
            return Err(MergeError::ShardOutOfRange {
                shard_index: snapshot.shard_index,
                shard_total,
            });
        }
        if snapshot.shard_total != shard_total {
            return Err(MergeError::ShardTotalMismatch {
                shard_index: snapshot.shard_index,
                found: snapshot.shard_total,
                expected: shard_total,
            });
        }
        match shards.entry(snapshot.shard_index) {
            Entry::Vacant(slot) => {
                slot.insert(snapshot);
            }
            Entry::Occupied(existing) if *existing.get() == snapshot => {
                debug!("Ignoring identical copy of shard {}", snapshot.shard_index);
            }
            Entry::Occupied(_) => {
                return Err(MergeError::DuplicateShard {
                    shard_index: snapshot.shard_index,
                });
            }
        }
    }

    // Pass 2: identity-keyed records across shards.
    let mut records: BTreeMap<&TestIdentity, (u32, &TestRecord)> = BTreeMap::new();
    for (&shard_index, snapshot) in &shards {
        for record in &snapshot.test_records {
            match records.entry(&record.identity) {
                Entry::Vacant(slot) => {
                    slot.insert((shard_index, record));
                }
                Entry::Occupied(existing) => {
                    let (first_shard, first) = *existing.get();
                    if first != record {
                        return Err(MergeError::ConflictingTestIdentity {
                            identity: record.identity.clone(),
                            first_shard,
                            second_shard: shard_index,
                        });
                    }
                    debug!(
                        "Identical record for {} in shards {} and {}",
                        record.identity, first_shard, shard_index
                    );
                }
            }
        }
    }

    let mut test_records: Vec<TestRecord> = records.into_values().map(|(_, r)| r.clone()).collect();
    test_records.sort_by(|a, b| {
        a.declared_order
            .cmp(&b.declared_order)
            .then_with(|| a.identity.cmp(&b.identity))
    });

    let totals = Totals::tally(&test_records);
    let total_duration_ms = test_records
        .iter()
        .map(TestRecord::duration_ms)
        .fold(0, u64::saturating_add);
    let started_at = shards.values().map(|s| s.started_at).min();
    let finished_at = shards.values().map(|s| s.finished_at).max();

    let received: BTreeSet<u32> = shards.keys().copied().collect();
    let missing_shards: Vec<u32> = (0..shard_total).filter(|i| !received.contains(i)).collect();
    let shards_received = received.len() as u32;

    let report = AggregateReport {
        test_records,
        totals,
        total_duration_ms,
        started_at,
        finished_at,
        shards_expected: shard_total,
        shards_received,
        complete: missing_shards.is_empty(),
        missing_shards,
    };

    if let Some(warning) = report.missing_shard_warning() {
        warn!("{}", warning);
    }
    info!(
        "Merged {} of {} shards: {} tests",
        report.shards_received,
        report.shards_expected,
        report.test_records.len()
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttemptStatus::*;
    use crate::model::tests::record;
    use crate::shard::SNAPSHOT_FORMAT_VERSION;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;

    fn snapshot(shard_index: u32, shard_total: u32, records: Vec<TestRecord>) -> ShardSnapshot {
        ShardSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            shard_index,
            shard_total,
            started_at: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, shard_index).unwrap(),
            finished_at: Utc.with_ymd_and_hms(2026, 5, 1, 12, 10, shard_index).unwrap(),
            test_records: records,
        }
    }

    fn three_shards() -> Vec<ShardSnapshot> {
        vec![
            snapshot(0, 3, vec![record("a", 0, &[Passed]), record("d", 3, &[Failed, Passed])]),
            snapshot(1, 3, vec![record("b", 1, &[Failed, Failed]), record("e", 4, &[])]),
            snapshot(2, 3, vec![record("c", 2, &[TimedOut]), record("f", 5, &[Passed])]),
        ]
    }

    #[test]
    fn test_two_shard_scenario() {
        let shards = vec![
            snapshot(0, 2, vec![record("testA", 0, &[Passed])]),
            snapshot(1, 2, vec![record("testB", 1, &[Failed, Failed])]),
        ];
        let report = merge(&shards, 2).unwrap();

        assert_eq!(
            report.totals,
            Totals {
                passed: 1,
                failed: 1,
                flaky: 0,
                skipped: 0
            }
        );
        assert!(report.complete);
        assert_eq!(report.shards_received, 2);
        let titles: Vec<&str> = report.test_records.iter().map(|r| r.identity.title.as_str()).collect();
        assert_eq!(titles, vec!["testA", "testB"]);
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_sorted_by_declared_order_not_shard() {
        let report = merge(&three_shards(), 3).unwrap();
        let orders: Vec<u64> = report.test_records.iter().map(|r| r.declared_order).collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(report.totals.total(), report.test_records.len());
    }

    #[test]
    fn test_merge_is_order_independent() {
        let shards = three_shards();
        let expected = merge(&shards, 3).unwrap();
        let expected_digest = expected.digest().unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut shuffled = shards.clone();
            shuffled.shuffle(&mut rng);
            let report = merge(&shuffled, 3).unwrap();
            assert_eq!(report, expected);
            assert_eq!(report.digest().unwrap(), expected_digest);
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let shards = three_shards();
        let mut doubled = shards.clone();
        doubled.extend(shards.clone());
        assert_eq!(merge(&doubled, 3).unwrap(), merge(&shards, 3).unwrap());
    }

    #[test]
    fn test_incomplete_merge() {
        let shards = three_shards();
        let partial = vec![shards[0].clone(), shards[2].clone()];
        let report = merge(&partial, 3).unwrap();

        assert!(!report.complete);
        assert_eq!(report.shards_received, 2);
        assert_eq!(report.shards_expected, 3);
        assert_eq!(report.missing_shards, vec![1]);
        assert_eq!(report.exit_code(), 1);

        let warning = report.missing_shard_warning().unwrap();
        assert_eq!(warning.to_string(), "Incomplete merge: 1 of 3 shards missing (indices: 1)");
    }

    #[test]
    fn test_duplicate_shard_rejected() {
        let shards = vec![
            snapshot(0, 2, vec![record("a", 0, &[Passed])]),
            snapshot(0, 2, vec![record("b", 1, &[Passed])]),
        ];
        assert!(matches!(
            merge(&shards, 2),
            Err(MergeError::DuplicateShard { shard_index: 0 })
        ));
    }

    #[test]
    fn test_conflicting_identity_rejected() {
        let shards = vec![
            snapshot(0, 2, vec![record("a", 0, &[Passed])]),
            snapshot(1, 2, vec![record("a", 0, &[Failed])]),
        ];
        match merge(&shards, 2) {
            Err(MergeError::ConflictingTestIdentity {
                identity,
                first_shard,
                second_shard,
            }) => {
                assert_eq!(identity.title, "a");
                assert_eq!((first_shard, second_shard), (0, 1));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_identical_record_in_two_shards_kept_once() {
        let shards = vec![
            snapshot(0, 2, vec![record("a", 0, &[Passed])]),
            snapshot(1, 2, vec![record("a", 0, &[Passed]), record("b", 1, &[Passed])]),
        ];
        let report = merge(&shards, 2).unwrap();
        assert_eq!(report.test_records.len(), 2);
        assert_eq!(report.totals.passed, 2);
    }

    #[test]
    fn test_out_of_range_and_mismatch() {
        assert!(matches!(
            merge(&[snapshot(3, 3, vec![])], 3),
            Err(MergeError::ShardOutOfRange { shard_index: 3, .. })
        ));
        assert!(matches!(
            merge(&[snapshot(0, 4, vec![])], 3),
            Err(MergeError::ShardTotalMismatch { found: 4, expected: 3, .. })
        ));
        assert!(matches!(merge(&[], 0), Err(MergeError::InvalidShardTotal)));
    }

    #[test]
    fn test_declared_order_tie_broken_by_identity() {
        let shards = vec![
            snapshot(0, 2, vec![record("zeta", 1, &[Passed])]),
            snapshot(1, 2, vec![record("alpha", 1, &[Passed])]),
        ];
        let forward = merge(&shards, 2).unwrap();
        let reversed: Vec<_> = shards.into_iter().rev().collect();
        assert_eq!(forward, merge(&reversed, 2).unwrap());
        assert_eq!(forward.test_records[0].identity.title, "alpha");
    }

    #[test]
    fn test_timestamps_and_duration() {
        let report = merge(&three_shards(), 3).unwrap();
        assert_eq!(report.started_at, Some(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()));
        assert_eq!(report.finished_at, Some(Utc.with_ymd_and_hms(2026, 5, 1, 12, 10, 2).unwrap()));
        // record() gives attempt i a duration of 10 * (i + 1).
        assert_eq!(report.total_duration_ms, 10 + 30 + 30 + 0 + 10 + 10);
    }

    #[test]
    fn test_huge_durations_saturate() {
        let mut slow = record("slow", 0, &[Failed, Passed]);
        for attempt in &mut slow.attempts {
            attempt.duration_ms = u64::MAX;
        }
        let mut slower = record("slower", 1, &[Passed]);
        slower.attempts[0].duration_ms = u64::MAX;

        // Round-trip through the artifact codec, which accepts these values.
        let bytes = crate::shard::serialize(&snapshot(0, 1, vec![slow, slower])).unwrap();
        let back = crate::shard::deserialize(&bytes).unwrap();
        assert_eq!(back.test_records[0].duration_ms(), u64::MAX);

        let report = merge(&[back], 1).unwrap();
        assert_eq!(report.total_duration_ms, u64::MAX);
        assert_eq!(report.totals.flaky, 1);
    }

    #[test]
    fn test_exit_code_flaky_only() {
        let shards = vec![snapshot(0, 1, vec![record("a", 0, &[Failed, Passed])])];
        let report = merge(&shards, 1).unwrap();
        assert!(report.success());
        assert_eq!(report.exit_code(), 2);
    }
}
