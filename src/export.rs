//! Best-effort export of merged reports to external sinks.
//!
//! Exporting happens after the report has been computed and never feeds
//! back into it. [`dispatch`] catches every failure (serialization, I/O,
//! HTTP, child process) and turns it into a [`DispatchOutcome::Failed`]
//! value; callers log it and move on. The run's exit status is decided by
//! the report alone.
//!
//! # Sinks
//!
//! | Sink | Delivery | Retries |
//! |------|----------|---------|
//! | [`webhook::WebhookSink`] | HTTP POST of the JSON report | configurable, transient errors only |
//! | [`file::FileSink`] | Atomic write of the JSON report | none |
//! | [`command::CommandSink`] | JSON report piped to a command's stdin | configurable |
//!
//! Retries are a property of the sink, applied by wrapping it in a
//! [`RetryingSink`] with a fixed bound.

pub mod command;
pub mod file;
pub mod webhook;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::ExportConfig;
use crate::merge::AggregateReport;

pub use command::CommandSink;
pub use file::FileSink;
pub use webhook::WebhookSink;

/// Errors reported by export sinks. Never fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sink responded with HTTP status {status}")]
    Status { status: u16 },

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Invalid sink configuration: {0}")]
    Config(String),
}

impl SinkError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SinkError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            SinkError::Status { status } => *status >= 500 || *status == 429,
            SinkError::Io(_) => true,
            SinkError::Command(_) => true,
            SinkError::Serialize(_) | SinkError::Config(_) => false,
        }
    }
}

/// A destination for serialized reports.
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Delivers one serialized report.
    async fn send(&self, payload: &[u8]) -> Result<(), SinkError>;
}

/// Outcome of one dispatch. Failures are warnings, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { sink: String },
    Failed { sink: String, error: String },
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { .. })
    }
}

/// Wraps a sink with bounded retries and a fixed backoff.
pub struct RetryingSink<S> {
    inner: S,
    max_retries: usize,
    backoff: Duration,
}

impl<S: ExportSink> RetryingSink<S> {
    pub fn new(inner: S, max_retries: usize, backoff: Duration) -> Self {
        Self {
            inner,
            max_retries,
            backoff,
        }
    }
}

#[async_trait]
impl<S: ExportSink> ExportSink for RetryingSink<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, payload: &[u8]) -> Result<(), SinkError> {
        let mut retries = 0;
        loop {
            match self.inner.send(payload).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    debug!(
                        "Sink {} failed ({}), retry {}/{}",
                        self.inner.name(),
                        e,
                        retries,
                        self.max_retries
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sends the report to one sink, isolating any failure.
pub async fn dispatch(report: &AggregateReport, sink: &dyn ExportSink) -> DispatchOutcome {
    let sink_name = sink.name().to_string();

    let result = match report.to_json() {
        Ok(payload) => sink.send(&payload).await,
        Err(e) => Err(SinkError::Serialize(e)),
    };

    match result {
        Ok(()) => {
            info!("Report exported to {}", sink_name);
            DispatchOutcome::Delivered { sink: sink_name }
        }
        Err(e) => {
            warn!("Failed to export report to {}: {}", sink_name, e);
            DispatchOutcome::Failed {
                sink: sink_name,
                error: e.to_string(),
            }
        }
    }
}

/// Sends the report to every sink concurrently. Outcomes follow sink order.
pub async fn dispatch_all(
    report: &AggregateReport,
    sinks: &[Box<dyn ExportSink>],
) -> Vec<DispatchOutcome> {
    join_all(sinks.iter().map(|sink| dispatch(report, sink.as_ref()))).await
}

/// Builds the configured sinks, each wrapped in its retry policy.
pub fn build_sinks(configs: &[ExportConfig]) -> Result<Vec<Box<dyn ExportSink>>, SinkError> {
    let mut sinks: Vec<Box<dyn ExportSink>> = Vec::with_capacity(configs.len());
    for config in configs {
        let sink: Box<dyn ExportSink> = match config {
            ExportConfig::Webhook(cfg) => Box::new(RetryingSink::new(
                WebhookSink::from_config(cfg)?,
                cfg.retries,
                Duration::from_millis(cfg.backoff_ms),
            )),
            ExportConfig::File(cfg) => Box::new(FileSink::from_config(cfg)),
            ExportConfig::Command(cfg) => Box::new(RetryingSink::new(
                CommandSink::from_config(cfg)?,
                cfg.retries,
                Duration::from_millis(cfg.backoff_ms),
            )),
        };
        sinks.push(sink);
    }
    Ok(sinks)
}
