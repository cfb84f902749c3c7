//! Webhook sink: POSTs the JSON report to an HTTP endpoint.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{ExportSink, SinkError};
use crate::config::WebhookSinkConfig;

/// Header carrying the SHA-256 of the payload.
pub const DIGEST_HEADER: &str = "X-Report-Digest";

/// Delivers reports to an HTTP endpoint.
///
/// Any non-2xx response is an error; 5xx and 429 responses, connection
/// failures and timeouts are retryable when wrapped in a
/// [`RetryingSink`](super::RetryingSink).
pub struct WebhookSink {
    client: Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            headers: BTreeMap::new(),
        })
    }

    /// Builds the sink from configuration.
    ///
    /// Header values may reference environment variables (`$TOKEN` or
    /// `${TOKEN}`), so secrets stay out of the config file.
    pub fn from_config(config: &WebhookSinkConfig) -> Result<Self, SinkError> {
        let mut sink = Self::new(config.url.clone(), Duration::from_secs(config.timeout_secs))?;
        for (name, value) in &config.headers {
            let expanded = shellexpand::env(value)
                .map_err(|e| SinkError::Config(format!("header {}: {}", name, e)))?;
            sink = sink.with_header(name.clone(), expanded.into_owned());
        }
        Ok(sink)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl ExportSink for WebhookSink {
    fn name(&self) -> &str {
        &self.url
    }

    async fn send(&self, payload: &[u8]) -> Result<(), SinkError> {
        let digest = format!("{:x}", Sha256::digest(payload));

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(DIGEST_HEADER, digest);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(payload.to_vec()).send().await?;
        let status = response.status();
        debug!("Webhook {} responded {}", self.url, status);

        if !status.is_success() {
            return Err(SinkError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}
