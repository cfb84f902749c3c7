//! Snapshot artifact encoding and storage.
//!
//! A snapshot artifact is a self-describing JSON document:
//!
//! ```json
//! {
//!   "kind": "shardmerge-snapshot",
//!   "format_version": 1,
//!   "shard_index": 0,
//!   "shard_total": 4,
//!   "started_at": "2026-01-01T10:00:00Z",
//!   "finished_at": "2026-01-01T10:04:12Z",
//!   "test_records": [ ... ]
//! }
//! ```
//!
//! `kind` and `format_version` are read before anything else. Artifacts
//! written by a newer version are refused instead of being half-parsed.
//!
//! Artifacts are written with rename-on-write: the bytes go to a temporary
//! file in the target directory, are synced, and only then linked into
//! place under `shard-NNNNN.snapshot.json`. A crash mid-write leaves at
//! most a stray temp file, never a truncated snapshot.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ShardSnapshot;
use crate::model::TestRecord;

/// Format version written by this build.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Oldest format version this build can read.
pub const MIN_SUPPORTED_FORMAT_VERSION: u32 = 1;

/// Value of the `kind` field.
pub const SNAPSHOT_KIND: &str = "shardmerge-snapshot";

/// File name suffix used for snapshot artifacts.
pub const SNAPSHOT_SUFFIX: &str = ".snapshot.json";

/// Result type for snapshot encoding and storage.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The artifact was written by an unknown (usually newer) format version.
    #[error(
        "Unsupported snapshot format version {found} (supported: {min}..={max})",
        min = MIN_SUPPORTED_FORMAT_VERSION,
        max = SNAPSHOT_FORMAT_VERSION
    )]
    UnsupportedVersion { found: u32 },

    /// The document is not a snapshot artifact.
    #[error("Not a snapshot artifact (kind: {0:?})")]
    UnknownKind(Option<String>),

    /// The bytes are not valid snapshot JSON.
    #[error("Malformed snapshot: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Well-formed, but violates a snapshot invariant.
    #[error("Invalid snapshot: {0}")]
    Invalid(String),

    /// A different snapshot for the same shard is already stored.
    #[error("Snapshot already exists with different content: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Just enough of the document to decide whether to parse the rest.
#[derive(Deserialize)]
struct Header {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    format_version: Option<u32>,
}

#[derive(Serialize)]
struct ArtifactRef<'a> {
    kind: &'static str,
    format_version: u32,
    shard_index: u32,
    shard_total: u32,
    started_at: &'a DateTime<Utc>,
    finished_at: &'a DateTime<Utc>,
    test_records: &'a [TestRecord],
}

#[derive(Deserialize)]
struct Artifact {
    format_version: u32,
    shard_index: u32,
    shard_total: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    test_records: Vec<TestRecord>,
}

/// Encodes a snapshot as artifact bytes.
pub fn serialize(snapshot: &ShardSnapshot) -> SnapshotResult<Vec<u8>> {
    let artifact = ArtifactRef {
        kind: SNAPSHOT_KIND,
        format_version: snapshot.format_version,
        shard_index: snapshot.shard_index,
        shard_total: snapshot.shard_total,
        started_at: &snapshot.started_at,
        finished_at: &snapshot.finished_at,
        test_records: &snapshot.test_records,
    };
    let mut bytes = serde_json::to_vec_pretty(&artifact)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decodes and validates artifact bytes.
pub fn deserialize(bytes: &[u8]) -> SnapshotResult<ShardSnapshot> {
    let header: Header = serde_json::from_slice(bytes)?;
    if header.kind.as_deref() != Some(SNAPSHOT_KIND) {
        return Err(SnapshotError::UnknownKind(header.kind));
    }
    let found = header
        .format_version
        .ok_or_else(|| SnapshotError::Invalid("missing format_version".to_string()))?;
    if !(MIN_SUPPORTED_FORMAT_VERSION..=SNAPSHOT_FORMAT_VERSION).contains(&found) {
        return Err(SnapshotError::UnsupportedVersion { found });
    }

    let artifact: Artifact = serde_json::from_slice(bytes)?;
    let snapshot = ShardSnapshot {
        format_version: artifact.format_version,
        shard_index: artifact.shard_index,
        shard_total: artifact.shard_total,
        started_at: artifact.started_at,
        finished_at: artifact.finished_at,
        test_records: artifact.test_records,
    };
    validate(&snapshot)?;
    Ok(snapshot)
}

fn validate(snapshot: &ShardSnapshot) -> SnapshotResult<()> {
    if snapshot.shard_total == 0 || snapshot.shard_index >= snapshot.shard_total {
        return Err(SnapshotError::Invalid(format!(
            "shard index {} out of range for {} shards",
            snapshot.shard_index, snapshot.shard_total
        )));
    }

    let mut seen = HashSet::new();
    for record in &snapshot.test_records {
        record.validate().map_err(SnapshotError::Invalid)?;
        if !seen.insert(&record.identity) {
            return Err(SnapshotError::Invalid(format!(
                "duplicate record for {}",
                record.identity
            )));
        }
    }
    Ok(())
}

/// File name for a shard's artifact.
pub fn snapshot_file_name(shard_index: u32) -> String {
    format!("shard-{:05}{}", shard_index, SNAPSHOT_SUFFIX)
}

/// Atomically writes a snapshot into `dir` and returns its path.
///
/// Rewriting an identical artifact is a no-op. A different artifact for the
/// same shard is refused with [`SnapshotError::AlreadyExists`].
pub fn write_snapshot(dir: &Path, snapshot: &ShardSnapshot) -> SnapshotResult<PathBuf> {
    fs::create_dir_all(dir)?;
    let bytes = serialize(snapshot)?;
    let path = dir.join(snapshot_file_name(snapshot.shard_index));

    // Dropping the temp file on any error path removes it.
    let mut tmp = tempfile::Builder::new()
        .prefix(".shard-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;

    match tmp.persist_noclobber(&path) {
        Ok(_) => {
            debug!("Wrote snapshot: {}", path.display());
            Ok(path)
        }
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
            if fs::read(&path)? == bytes {
                debug!("Identical snapshot already present: {}", path.display());
                Ok(path)
            } else {
                Err(SnapshotError::AlreadyExists(path))
            }
        }
        Err(e) => Err(SnapshotError::Io(e.error)),
    }
}

/// Reads and validates one snapshot artifact.
pub fn read_snapshot(path: &Path) -> SnapshotResult<ShardSnapshot> {
    let bytes = fs::read(path)?;
    deserialize(&bytes)
}
