//! shardmerge CLI - record shard snapshots and merge them into one report.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use shardmerge::config::{self, Config, ExportConfig};
use shardmerge::export::{self, DispatchOutcome};
use shardmerge::merge::{collect_snapshots, merge};
use shardmerge::report::print_summary;
use shardmerge::shard::{ShardAggregator, read_snapshot, write_snapshot};
use shardmerge::worker;

const DEFAULT_CONFIG: &str = "shardmerge.toml";

#[derive(Parser)]
#[command(name = "shardmerge")]
#[command(about = "Sharded test-run aggregation and deterministic report merging", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to shardmerge.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read worker events and write this shard's snapshot
    Record {
        /// Index of this shard (0-based)
        #[arg(long)]
        shard_index: u32,

        /// Override the number of shards
        #[arg(long)]
        shard_total: Option<u32>,

        /// Override the snapshot directory
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// Read events from this file instead of stdin
        #[arg(long)]
        events: Option<PathBuf>,
    },

    /// Merge all snapshots into one report
    Merge {
        /// Override the number of shards
        #[arg(long)]
        shard_total: Option<u32>,

        /// Override the snapshot directory
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// Write the merged report as JSON to this path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not fail the exit status only because shards are missing
        #[arg(long)]
        allow_incomplete: bool,

        /// Skip the configured export sinks
        #[arg(long)]
        no_export: bool,
    },

    /// Print the contents of one snapshot artifact
    Inspect {
        /// Snapshot file
        path: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Number of shards
        #[arg(short, long, default_value_t = 1)]
        shards: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Record {
            shard_index,
            shard_total,
            snapshot_dir,
            events,
        } => {
            let config = resolve_config(cli.config.as_deref())?;
            record(config, shard_index, shard_total, snapshot_dir, events).await
        }
        Commands::Merge {
            shard_total,
            snapshot_dir,
            output,
            allow_incomplete,
            no_export,
        } => {
            let config = resolve_config(cli.config.as_deref())?;
            merge_snapshots(config, shard_total, snapshot_dir, output, allow_incomplete, no_export)
                .await
        }
        Commands::Inspect { path, format } => inspect(&path, &format),
        Commands::Validate => validate_config(cli.config.as_deref()),
        Commands::Init { shards } => init_config(shards),
    }
}

/// Loads the explicit config, or `shardmerge.toml` if present, or defaults.
fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => Ok(Config::default()),
    }
}

async fn record(
    config: Config,
    shard_index: u32,
    shard_total: Option<u32>,
    snapshot_dir: Option<PathBuf>,
    events: Option<PathBuf>,
) -> Result<()> {
    let shard_total = shard_total.unwrap_or(config.shard.total);
    let snapshot_dir = snapshot_dir.unwrap_or_else(|| config.shard.resolved_snapshot_dir());

    let mut shard = ShardAggregator::new(shard_index, shard_total, config.run.retry_policy())?;
    info!(
        "Recording shard {}/{} (max attempts: {})",
        shard_index,
        shard_total,
        config.run.max_attempts
    );

    let drive_result = match &events {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open events file: {}", path.display()))?;
            drive_events(BufReader::new(file), &mut shard).await
        }
        None => drive_events(BufReader::new(tokio::io::stdin()), &mut shard).await,
    };

    // Flush even if the stream broke: open tests become interrupted records.
    let snapshot = shard.flush()?;
    let path = write_snapshot(&snapshot_dir, &snapshot)
        .with_context(|| format!("Failed to write snapshot to {}", snapshot_dir.display()))?;
    println!("{}", path.display());

    if let Err(e) = drive_result {
        error!("Event stream failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn drive_events<R>(reader: R, shard: &mut ShardAggregator) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let stats = worker::drive(reader, shard).await?;
    if stats.rejected > 0 {
        warn!("{} events were rejected", stats.rejected);
    }
    Ok(())
}

async fn merge_snapshots(
    config: Config,
    shard_total: Option<u32>,
    snapshot_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    allow_incomplete: bool,
    no_export: bool,
) -> Result<()> {
    let shard_total = shard_total.unwrap_or(config.shard.total);
    let snapshot_dir = snapshot_dir.unwrap_or_else(|| config.shard.resolved_snapshot_dir());

    let snapshots = collect_snapshots(&snapshot_dir)?;
    let report = merge(&snapshots, shard_total)?;

    if let Some(path) = &output {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, report.to_json()?)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        info!("Report written to: {}", path.display());
    }

    print_summary(&report);
    info!("Report digest: {}", report.digest()?);

    if !no_export && !config.export.is_empty() {
        match export::build_sinks(&config.export) {
            Ok(sinks) => {
                let outcomes = export::dispatch_all(&report, &sinks).await;
                let failed = outcomes
                    .iter()
                    .filter(|o| matches!(o, DispatchOutcome::Failed { .. }))
                    .count();
                if failed > 0 {
                    warn!("{} of {} exports failed", failed, outcomes.len());
                }
            }
            Err(e) => warn!("Export skipped: {}", e),
        }
    }

    let code = if allow_incomplete && !report.complete {
        if report.totals.failed > 0 {
            1
        } else if report.totals.flaky > 0 {
            2
        } else {
            0
        }
    } else {
        report.exit_code()
    };
    std::process::exit(code);
}

fn inspect(path: &Path, format: &str) -> Result<()> {
    let snapshot = read_snapshot(path)
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&snapshot)?;
            println!("{}", json);
        }
        _ => {
            let totals = snapshot.totals();
            println!(
                "Shard {} of {} (format v{})",
                snapshot.shard_index, snapshot.shard_total, snapshot.format_version
            );
            println!("  Started:  {}", snapshot.started_at.to_rfc3339());
            println!("  Finished: {}", snapshot.finished_at.to_rfc3339());
            println!(
                "  {} tests: {} passed, {} failed, {} flaky, {} skipped",
                snapshot.test_records.len(),
                totals.passed,
                totals.failed,
                totals.flaky,
                totals.skipped
            );
            for record in &snapshot.test_records {
                println!(
                    "  #{:<5} {:<9} {}",
                    record.declared_order,
                    record.final_status.to_string(),
                    record.identity
                );
            }
        }
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(Path::new(DEFAULT_CONFIG));
    match config::load_config(path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Max attempts: {}", config.run.max_attempts);
            let retry_on: Vec<String> = config.run.retry_on.iter().map(|s| s.to_string()).collect();
            println!("  Retry on: {}", retry_on.join(", "));
            println!("  Shards: {}", config.shard.total);
            println!("  Snapshot dir: {}", config.shard.snapshot_dir.display());

            for export in &config.export {
                let description = match export {
                    ExportConfig::Webhook(cfg) => format!("webhook {}", cfg.url),
                    ExportConfig::File(cfg) => format!("file {}", cfg.path.display()),
                    ExportConfig::Command(cfg) => format!("command {}", cfg.command),
                };
                println!("  Export: {}", description);
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(shards: u32) -> Result<()> {
    let config = format!(
        r#"# shardmerge configuration file

[run]
max_attempts = 3
retry_on = ["failed", "timedOut"]

[shard]
total = {}
snapshot_dir = "test-results/shards"

# [[export]]
# type = "webhook"
# url = "https://ci.example.com/hooks/test-report"
# headers = {{ Authorization = "Bearer ${{REPORT_TOKEN}}" }}

# [[export]]
# type = "file"
# path = "test-results/report.json"
"#,
        shards.max(1)
    );

    let path = PathBuf::from(DEFAULT_CONFIG);
    if path.exists() {
        eprintln!("{} already exists. Remove it first or edit manually.", DEFAULT_CONFIG);
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created {}", DEFAULT_CONFIG);
    println!();
    println!("Edit the configuration as needed, then run each shard with:");
    println!("  <executor> | shardmerge record --shard-index N");
    println!("and merge with:");
    println!("  shardmerge merge");

    Ok(())
}
