//! Configuration schema definitions for shardmerge.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section is optional and has defaults, so
//! an empty file is a valid configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig              - Retry settings for workers
//! ├── ShardConfig            - Shard count and snapshot directory
//! └── ExportConfig[]         - Tagged enum selecting each export sink
//!     ├── Webhook            - HTTP POST
//!     ├── File               - JSON file
//!     └── Command            - Pipe into a program
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::AttemptStatus;
use crate::tracker::RetryPolicy;

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [run]
/// max_attempts = 3
/// retry_on = ["failed", "timedOut"]
///
/// [shard]
/// total = 4
/// snapshot_dir = "test-results/shards"
///
/// [[export]]
/// type = "webhook"
/// url = "https://ci.example.com/hooks/test-report"
///
/// [[export]]
/// type = "file"
/// path = "test-results/report.json"
/// ```
///
/// # Example
///
/// ```
/// use shardmerge::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [shard]
///     total = 2
/// "#).unwrap();
/// assert_eq!(config.shard.total, 2);
/// assert_eq!(config.run.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Worker-side retry settings.
    #[serde(default)]
    pub run: RunConfig,

    /// Sharding layout and snapshot storage.
    #[serde(default)]
    pub shard: ShardConfig,

    /// Export sinks, dispatched after every merge.
    #[serde(default)]
    pub export: Vec<ExportConfig>,
}

/// Retry settings applied by each worker's attempt tracker.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_attempts` | 3 |
/// | `retry_on` | `["failed", "timedOut"]` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Maximum attempts per test, including the first. Minimum 1.
    ///
    /// Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Attempt statuses that qualify for a retry.
    ///
    /// `interrupted` is accepted but rarely useful: an interrupted attempt
    /// usually means the worker itself is going away.
    ///
    /// Default: `["failed", "timedOut"]`
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<AttemptStatus>,
}

impl RunConfig {
    /// The retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retry_statuses(self.max_attempts, &self.retry_on)
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_on: default_retry_on(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_on() -> Vec<AttemptStatus> {
    vec![AttemptStatus::Failed, AttemptStatus::TimedOut]
}

/// Sharding layout.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `total` | 1 |
/// | `snapshot_dir` | `"test-results/shards"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardConfig {
    /// Number of shards the suite is split into.
    ///
    /// Default: 1
    #[serde(default = "default_shard_total")]
    pub total: u32,

    /// Directory shared by all workers for snapshot artifacts.
    ///
    /// A leading `~` is expanded.
    ///
    /// Default: `"test-results/shards"`
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
}

impl ShardConfig {
    /// Snapshot directory with `~` expanded.
    pub fn resolved_snapshot_dir(&self) -> PathBuf {
        let raw = self.snapshot_dir.to_string_lossy();
        PathBuf::from(shellexpand::tilde(&raw).into_owned())
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            total: default_shard_total(),
            snapshot_dir: default_snapshot_dir(),
        }
    }
}

fn default_shard_total() -> u32 {
    1
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("test-results/shards")
}

/// Export sink configuration.
///
/// This is a tagged enum selecting the sink based on the `type` field.
///
/// | Type | Description |
/// |------|-------------|
/// | `webhook` | POST the JSON report to a URL |
/// | `file` | Write the JSON report to a file |
/// | `command` | Pipe the JSON report into a program's stdin |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExportConfig {
    Webhook(WebhookSinkConfig),
    File(FileSinkConfig),
    Command(CommandSinkConfig),
}

/// Webhook sink settings.
///
/// ```toml
/// [[export]]
/// type = "webhook"
/// url = "https://hooks.example.com/reports"
/// retries = 3
/// headers = { Authorization = "Bearer ${REPORT_TOKEN}" }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookSinkConfig {
    pub url: String,

    /// Extra request headers. Values may reference environment variables.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Request timeout in seconds.
    ///
    /// Default: 10
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first failed delivery (transient errors only).
    ///
    /// Default: 2
    #[serde(default = "default_webhook_retries")]
    pub retries: usize,

    /// Delay between retries in milliseconds.
    ///
    /// Default: 500
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

fn default_webhook_retries() -> usize {
    2
}

fn default_backoff_ms() -> u64 {
    500
}

/// File sink settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileSinkConfig {
    /// Output path. A leading `~` is expanded.
    pub path: PathBuf,
}

/// Command sink settings.
///
/// ```toml
/// [[export]]
/// type = "command"
/// command = "./scripts/post-results.sh --channel ci"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandSinkConfig {
    /// Command line, split with shell quoting rules.
    pub command: String,

    /// Retries after a failed run.
    ///
    /// Default: 0
    #[serde(default)]
    pub retries: usize,

    /// Delay between retries in milliseconds.
    ///
    /// Default: 500
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}
