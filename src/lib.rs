//! shardmerge: sharded test-run aggregation with deterministic merging.
//!
//! Test suites split across many workers produce results in many places.
//! This crate turns each worker's stream of lifecycle events into a
//! per-shard snapshot, and merges any set of snapshots into one report
//! that does not depend on which shard finished first.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Tracker**: Per-test attempt state machine and retry policy
//! - **Shard**: Per-worker aggregation and snapshot artifacts
//! - **Worker**: JSON-lines event stream from the test executor
//! - **Merge**: Snapshot collection and the deterministic merge
//! - **Export**: Failure-isolated delivery to webhooks, files, commands
//!
//! ```text
//!  executor ─► worker::drive ─► ShardAggregator ─► write_snapshot
//!                                                      │ (one file per shard)
//!                                                      ▼
//!                     collect_snapshots ─► merge ─► AggregateReport ─► export
//! ```
//!
//! # Example
//!
//! ```no_run
//! use shardmerge::merge::{collect_snapshots, merge};
//!
//! let snapshots = collect_snapshots(std::path::Path::new("test-results/shards"))?;
//! let report = merge(&snapshots, 4)?;
//! if !report.complete {
//!     eprintln!("missing shards: {:?}", report.missing_shards);
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod config;
pub mod export;
pub mod merge;
pub mod model;
pub mod report;
pub mod shard;
pub mod tracker;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use export::{DispatchOutcome, ExportSink, SinkError};
pub use merge::{AggregateReport, MergeError, collect_snapshots, merge};
pub use model::{AttemptRecord, AttemptStatus, FinalStatus, TestIdentity, TestRecord, Totals};
pub use shard::{ShardAggregator, ShardError, ShardSnapshot, SnapshotError};
pub use tracker::{AttemptTracker, RetryPolicy};
