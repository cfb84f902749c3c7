//! Configuration loading and schema definitions for shardmerge.
//!
//! Configuration is read from TOML. Every section has defaults, and the
//! command line can override the values that matter per invocation (shard
//! total, snapshot directory).

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result, bail};

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema or fails validation
///
/// # Example
///
/// ```no_run
/// use shardmerge::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("shardmerge.toml"))?;
/// println!("Shards: {}", config.shard.total);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate(&config).with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
///
/// # Example
///
/// ```
/// use shardmerge::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [run]
///     max_attempts = 2
///
///     [[export]]
///     type = "file"
///     path = "out/report.json"
/// "#)?;
///
/// assert_eq!(config.run.max_attempts, 2);
/// assert_eq!(config.export.len(), 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.run.max_attempts == 0 {
        bail!("run.max_attempts must be at least 1");
    }
    if config.shard.total == 0 {
        bail!("shard.total must be at least 1");
    }
    for export in &config.export {
        match export {
            ExportConfig::Webhook(cfg) if cfg.url.trim().is_empty() => {
                bail!("webhook export requires a url");
            }
            ExportConfig::Command(cfg) if cfg.command.trim().is_empty() => {
                bail!("command export requires a command");
            }
            _ => {}
        }
    }
    Ok(())
}
