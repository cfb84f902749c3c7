//! Snapshot collection from the shared snapshot directory.
//!
//! The directory is append-only: workers add `shard-NNNNN.snapshot.json`
//! files via atomic rename, and collection only ever reads. Temp files from
//! in-flight or crashed writers start with `.` and never carry the snapshot
//! suffix, so they are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{MergeError, MergeResult};
use crate::shard::snapshot::SNAPSHOT_SUFFIX;
use crate::shard::{ShardSnapshot, read_snapshot};

/// Lists snapshot artifact paths in `dir`, sorted by file name.
pub fn snapshot_paths(dir: &Path) -> MergeResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(SNAPSHOT_SUFFIX) {
            debug!("Skipping non-snapshot entry: {}", name);
            continue;
        }
        if !entry.file_type()?.is_file() {
            continue;
        }
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Reads every snapshot artifact in `dir`.
///
/// Fails on the first unreadable, malformed, or unsupported artifact; a
/// snapshot the tooling cannot understand must not be silently ignored.
pub fn collect_snapshots(dir: &Path) -> MergeResult<Vec<ShardSnapshot>> {
    let paths = snapshot_paths(dir)?;
    let mut snapshots = Vec::with_capacity(paths.len());
    for path in paths {
        let snapshot = read_snapshot(&path).map_err(|source| MergeError::Snapshot {
            path: path.clone(),
            source,
        })?;
        debug!(
            "Loaded shard {} ({} records) from {}",
            snapshot.shard_index,
            snapshot.test_records.len(),
            path.display()
        );
        snapshots.push(snapshot);
    }
    info!("Collected {} snapshots from {}", snapshots.len(), dir.display());
    Ok(snapshots)
}
