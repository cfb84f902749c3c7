//! Worker event stream: the boundary between a test executor and its shard.
//!
//! The executor that actually runs tests reports lifecycle events as JSON
//! lines, one object per line, tagged by `event`:
//!
//! ```text
//! {"event":"begin","identity":{...},"declared_order":3}
//! {"event":"start","identity":{...}}
//! {"event":"attempt","identity":{...},"status":"failed","duration_ms":812,"error":"expected 2, got 3"}
//! {"event":"attempt","identity":{...},"status":"passed","duration_ms":640}
//! {"event":"skip","identity":{...},"declared_order":4}
//! {"event":"timeout","identity":{...},"duration_ms":30000}
//! ```
//!
//! [`drive`] applies the events to a [`ShardAggregator`] in order. Lifecycle
//! mistakes from the executor (an attempt for an already sealed test, a
//! duplicate `begin`) are logged and skipped; they never abort the shard.
//! A malformed line does stop the stream, and like an executor crash it
//! leaves open tests to be sealed as interrupted when the shard is flushed.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use crate::model::{Attachment, AttemptStatus, TestIdentity};
use crate::shard::{ShardAggregator, ShardError};

/// One lifecycle event reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum WorkerEvent {
    Begin {
        identity: TestIdentity,
        declared_order: u64,
    },
    Start {
        identity: TestIdentity,
    },
    Attempt {
        identity: TestIdentity,
        status: AttemptStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    Skip {
        identity: TestIdentity,
        declared_order: u64,
    },
    Timeout {
        identity: TestIdentity,
        duration_ms: u64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("IO error reading events: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed event on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Shard(#[from] ShardError),
}

/// Counters from one [`drive`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriveStats {
    pub applied: usize,
    pub rejected: usize,
}

/// Applies one event to the shard.
pub fn apply(shard: &mut ShardAggregator, event: WorkerEvent) -> Result<(), ShardError> {
    match event {
        WorkerEvent::Begin {
            identity,
            declared_order,
        } => shard.begin_test(identity, declared_order),
        WorkerEvent::Start { identity } => shard.start_test(&identity).map(|_| ()),
        WorkerEvent::Attempt {
            identity,
            status,
            duration_ms,
            error,
            attachments,
        } => shard
            .record_attempt_with(&identity, status, duration_ms, error, attachments)
            .map(|_| ()),
        WorkerEvent::Skip {
            identity,
            declared_order,
        } => shard.skip_test(identity, declared_order),
        WorkerEvent::Timeout {
            identity,
            duration_ms,
        } => shard.time_out(&identity, duration_ms).map(|_| ()),
    }
}

/// Reads JSON-lines events from `reader` until EOF and applies them.
///
/// Blank lines are ignored. Returns early on I/O errors, malformed lines,
/// or if the shard was already flushed.
pub async fn drive<R>(reader: R, shard: &mut ShardAggregator) -> Result<DriveStats, WorkerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = LinesStream::new(reader.lines());
    let mut stats = DriveStats::default();
    let mut line_no = 0;

    while let Some(line) = lines.next().await {
        line_no += 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let event: WorkerEvent = serde_json::from_str(&line).map_err(|source| WorkerError::Parse {
            line: line_no,
            source,
        })?;

        match apply(shard, event) {
            Ok(()) => stats.applied += 1,
            Err(e @ ShardError::AlreadyFlushed { .. }) => return Err(e.into()),
            Err(e) => {
                warn!("Ignoring event on line {}: {}", line_no, e);
                stats.rejected += 1;
            }
        }
    }

    debug!(
        "Event stream ended: {} applied, {} rejected",
        stats.applied, stats.rejected
    );
    Ok(stats)
}
