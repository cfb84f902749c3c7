//! File sink: writes the JSON report to disk.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{ExportSink, SinkError};
use crate::config::FileSinkConfig;

/// Writes reports to a file, replacing it atomically.
///
/// Parent directories are created as needed; readers never observe a
/// half-written report.
pub struct FileSink {
    path: PathBuf,
    name: String,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = format!("file:{}", path.display());
        Self { path, name }
    }

    /// Builds the sink from configuration, expanding a leading `~`.
    pub fn from_config(config: &FileSinkConfig) -> Self {
        let raw = config.path.to_string_lossy();
        Self::new(shellexpand::tilde(&raw).into_owned())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ExportSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &[u8]) -> Result<(), SinkError> {
        let path = self.path.clone();
        let payload = payload.to_vec();
        tokio::task::spawn_blocking(move || write_atomic(&path, &payload))
            .await
            .map_err(|e| SinkError::Io(std::io::Error::other(e)))??;

        debug!("Report written to {}", self.path.display());
        Ok(())
    }
}

/// Temp file in the target directory, synced, then renamed over `path`.
fn write_atomic(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".report-")
        .suffix(".tmp")
        .tempfile_in(&parent)?;
    tmp.write_all(payload)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_writes_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out/report.json");
        let sink = FileSink::new(&path);

        sink.send(b"{\"v\":1}").await.unwrap();
        sink.send(b"{\"v\":2}").await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"{\"v\":2}");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_unwritable_target_is_io_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();

        let sink = FileSink::new(blocker.join("report.json"));
        assert!(matches!(sink.send(b"{}").await, Err(SinkError::Io(_))));
    }

    #[test]
    fn test_tilde_expansion() {
        let config = FileSinkConfig {
            path: PathBuf::from("~/reports/run.json"),
        };
        let sink = FileSink::from_config(&config);
        assert!(!sink.path().starts_with("~"));
        assert!(sink.path().ends_with("reports/run.json"));
        assert!(sink.name().starts_with("file:"));
    }
}
