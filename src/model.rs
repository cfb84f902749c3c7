//! Core data types shared by the tracker, the shard aggregator, and the
//! merge engine.
//!
//! Everything here is plain data: identities, attempts, sealed test records
//! and the totals derived from them. Records are immutable once sealed;
//! nothing in this module mutates a [`TestRecord`] after construction.
//!
//! # Status Derivation
//!
//! | Attempts | Final status |
//! |----------|--------------|
//! | none | [`FinalStatus::Skipped`] |
//! | `[passed]` | [`FinalStatus::Passed`] |
//! | `[.., failed, passed]` | [`FinalStatus::Flaky`] |
//! | `[.., timedOut]` | [`FinalStatus::TimedOut`] |
//! | anything else | [`FinalStatus::Failed`] |

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable key identifying one logical test across shards and runs.
///
/// Field order matters: the derived `Ord` is used as the tie-break when two
/// records share a declared order, so it must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestIdentity {
    /// Project (configuration) the test ran under.
    pub project_name: String,

    /// Source file declaring the test.
    pub file_path: String,

    /// Enclosing `describe` blocks, outermost first.
    #[serde(default)]
    pub suite_path: Vec<String>,

    /// Test title.
    pub title: String,
}

impl TestIdentity {
    /// Creates an identity with no enclosing suites.
    pub fn new(
        project_name: impl Into<String>,
        file_path: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            file_path: file_path.into(),
            suite_path: Vec::new(),
            title: title.into(),
        }
    }

    /// Appends an enclosing suite.
    pub fn with_suite(mut self, suite: impl Into<String>) -> Self {
        self.suite_path.push(suite.into());
        self
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.project_name.is_empty() {
            write!(f, "[{}] › ", self.project_name)?;
        }
        write!(f, "{}", self.file_path)?;
        for suite in &self.suite_path {
            write!(f, " › {}", suite)?;
        }
        write!(f, " › {}", self.title)
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptStatus {
    Passed,
    Failed,
    TimedOut,
    /// The attempt never finished: the worker crashed or the run was stopped.
    Interrupted,
}

impl AttemptStatus {
    pub fn is_passed(self) -> bool {
        self == AttemptStatus::Passed
    }

    /// Parses the camelCase wire name (`"timedOut"` etc).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "passed" => Some(AttemptStatus::Passed),
            "failed" => Some(AttemptStatus::Failed),
            "timedOut" => Some(AttemptStatus::TimedOut),
            "interrupted" => Some(AttemptStatus::Interrupted),
            _ => None,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptStatus::Passed => "passed",
            AttemptStatus::Failed => "failed",
            AttemptStatus::TimedOut => "timedOut",
            AttemptStatus::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// A file produced by an attempt (screenshot, trace, log).
///
/// Only the descriptor travels through the pipeline, never the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// One execution of a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Zero-based position in the test's attempt history.
    pub attempt_index: u32,

    pub status: AttemptStatus,

    pub duration_ms: u64,

    /// First line (or so) of the failure, if the attempt did not pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// Final, sealed status of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FinalStatus {
    Passed,
    Flaky,
    Failed,
    /// Failed, with the last attempt timing out. Counted as failed in totals.
    TimedOut,
    Skipped,
}

impl FinalStatus {
    /// Derives the final status from a complete attempt history.
    pub fn derive(attempts: &[AttemptRecord]) -> Self {
        let Some(last) = attempts.last() else {
            return FinalStatus::Skipped;
        };

        match last.status {
            AttemptStatus::Passed if attempts.len() == 1 => FinalStatus::Passed,
            AttemptStatus::Passed => FinalStatus::Flaky,
            AttemptStatus::TimedOut => FinalStatus::TimedOut,
            AttemptStatus::Failed | AttemptStatus::Interrupted => FinalStatus::Failed,
        }
    }

    /// Whether this status counts against the run.
    pub fn is_failure(self) -> bool {
        matches!(self, FinalStatus::Failed | FinalStatus::TimedOut)
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FinalStatus::Passed => "passed",
            FinalStatus::Flaky => "flaky",
            FinalStatus::Failed => "failed",
            FinalStatus::TimedOut => "timedOut",
            FinalStatus::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// A sealed test with its full attempt history.
///
/// Construct through [`TestRecord::seal`] (or [`TestRecord::skipped`]) so the
/// final status always agrees with the attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub identity: TestIdentity,
    pub attempts: Vec<AttemptRecord>,
    pub final_status: FinalStatus,
    /// Position in the full, pre-sharding test enumeration.
    pub declared_order: u64,
}

impl TestRecord {
    /// Seals an attempt history into an immutable record.
    pub fn seal(identity: TestIdentity, declared_order: u64, attempts: Vec<AttemptRecord>) -> Self {
        let final_status = FinalStatus::derive(&attempts);
        Self {
            identity,
            attempts,
            final_status,
            declared_order,
        }
    }

    /// A test that never ran.
    pub fn skipped(identity: TestIdentity, declared_order: u64) -> Self {
        Self::seal(identity, declared_order, Vec::new())
    }

    /// Sum of all attempt durations.
    pub fn duration_ms(&self) -> u64 {
        self.attempts
            .iter()
            .map(|a| a.duration_ms)
            .fold(0, u64::saturating_add)
    }

    /// Checks the structural invariants of a sealed record.
    ///
    /// Used when reading records produced elsewhere (snapshot artifacts).
    pub fn validate(&self) -> Result<(), String> {
        for (i, attempt) in self.attempts.iter().enumerate() {
            if attempt.attempt_index as usize != i {
                return Err(format!(
                    "{}: attempt at position {} has index {}",
                    self.identity, i, attempt.attempt_index
                ));
            }
            if attempt.status.is_passed() && i + 1 != self.attempts.len() {
                return Err(format!(
                    "{}: passed attempt {} is followed by further attempts",
                    self.identity, i
                ));
            }
        }

        let expected = FinalStatus::derive(&self.attempts);
        if self.final_status != expected {
            return Err(format!(
                "{}: final status {} does not match attempts (expected {})",
                self.identity, self.final_status, expected
            ));
        }

        Ok(())
    }
}

/// Per-status counts over a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub passed: usize,
    /// Includes timed-out tests.
    pub failed: usize,
    pub flaky: usize,
    pub skipped: usize,
}

impl Totals {
    pub fn tally<'a>(records: impl IntoIterator<Item = &'a TestRecord>) -> Self {
        let mut totals = Totals::default();
        for record in records {
            match record.final_status {
                FinalStatus::Passed => totals.passed += 1,
                FinalStatus::Flaky => totals.flaky += 1,
                FinalStatus::Failed | FinalStatus::TimedOut => totals.failed += 1,
                FinalStatus::Skipped => totals.skipped += 1,
            }
        }
        totals
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.flaky + self.skipped
    }
}
