//! Command sink: pipes the JSON report into an external program.
//!
//! Useful for channels this crate does not speak natively (chat bots,
//! mailers, database loaders). The command line is split with shell-words
//! rules and executed directly, without a shell.

use std::io::ErrorKind;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ExportSink, SinkError};
use crate::config::CommandSinkConfig;

pub struct CommandSink {
    program: String,
    args: Vec<String>,
    name: String,
}

impl CommandSink {
    /// Parses a command line such as `notify --channel "ci results"`.
    pub fn new(command: &str) -> Result<Self, SinkError> {
        let mut words = shell_words::split(command)
            .map_err(|e| SinkError::Config(format!("invalid command {:?}: {}", command, e)))?;
        if words.is_empty() {
            return Err(SinkError::Config("empty command".to_string()));
        }
        let program = words.remove(0);
        Ok(Self {
            name: format!("command:{}", program),
            program,
            args: words,
        })
    }

    pub fn from_config(config: &CommandSinkConfig) -> Result<Self, SinkError> {
        Self::new(&config.command)
    }
}

#[async_trait]
impl ExportSink for CommandSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &[u8]) -> Result<(), SinkError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SinkError::Command(format!("failed to spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may close stdin early.
            match stdin.write_all(payload).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => return Err(SinkError::Io(e)),
            }
        }

        let output = child.wait_with_output().await?;
        debug!("{} exited with {}", self.name, output.status);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SinkError::Command(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
