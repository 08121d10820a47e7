/*!
Snapkeep CLI - Command-line interface for snapshot archives and retention.

This CLI streams snapshot directories as archives, lists the snapshots below a
root, and prunes them once or periodically.
*/

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use snapkeep_core::config::{format_duration, parse_duration, ENV_SNAPSHOT_DIR};
use snapkeep_core::{
    init_observability, prune, ArchiveFormat, Autopruner, SnapkeepConfig, SnapshotManager,
};
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "snapkeep")]
#[command(about = "Stream and prune snapshot directories")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Directory holding the snapshots
    #[arg(short = 'd', long, global = true, env = ENV_SNAPSHOT_DIR)]
    snapshot_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the supported archive formats
    Formats,
    /// List the snapshots below the snapshot directory
    List,
    /// Write one snapshot as an archive
    Archive {
        /// Snapshot name, e.g. 20221115T232711Z-7ef1661077569104
        name: String,
        /// Archive format (tar, tgz, tzst)
        #[arg(short, long, default_value = "tgz")]
        format: String,
        /// Output file; `-` writes to stdout. Defaults to the suggested filename.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete snapshots older than the retention window
    Prune {
        /// Keep snapshots younger than this, e.g. 1h or 7d
        #[arg(short, long, value_parser = parse_duration_arg)]
        keep_within: Option<chrono::Duration>,
    },
    /// Prune periodically until interrupted
    Autoprune {
        /// Time between prune passes
        #[arg(short, long, value_parser = parse_duration_arg)]
        interval: Option<chrono::Duration>,
        /// Keep snapshots younger than this
        #[arg(short, long, value_parser = parse_duration_arg)]
        keep_within: Option<chrono::Duration>,
    },
}

#[derive(Tabled)]
struct FormatRow {
    #[tabled(rename = "Format")]
    name: &'static str,
    #[tabled(rename = "Content Type")]
    content_type: &'static str,
    #[tabled(rename = "Extension")]
    extension: &'static str,
    #[tabled(rename = "Compressed")]
    compressed: bool,
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Created")]
    created: String,
}

#[derive(Tabled)]
struct PruneRow {
    #[tabled(rename = "Snapshot")]
    name: String,
    #[tabled(rename = "Result")]
    outcome: &'static str,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let Cli {
        verbose,
        json_logs,
        snapshot_dir,
        command,
    } = Cli::parse();

    init_observability(json_logs, verbose)?;

    match command {
        Commands::Formats => show_formats(),
        Commands::List => {
            let (manager, _) = load_manager(snapshot_dir)?;
            list_snapshots(&manager)?
        }
        Commands::Archive {
            name,
            format,
            output,
        } => {
            let (manager, _) = load_manager(snapshot_dir)?;
            archive_snapshot(&manager, &name, &format, output).await?
        }
        Commands::Prune { keep_within } => {
            let (manager, config) = load_manager(snapshot_dir)?;
            let keep_within = keep_within.unwrap_or(config.autoprune.keep_within);
            prune_once(&manager, keep_within).await?
        }
        Commands::Autoprune {
            interval,
            keep_within,
        } => {
            let (manager, config) = load_manager(snapshot_dir)?;
            let interval = interval.unwrap_or(config.autoprune.interval);
            let keep_within = keep_within.unwrap_or(config.autoprune.keep_within);
            run_autoprune(&manager, interval, keep_within).await?
        }
    }

    Ok(())
}

fn parse_duration_arg(s: &str) -> Result<chrono::Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn load_manager(snapshot_dir: Option<PathBuf>) -> Result<(SnapshotManager, SnapkeepConfig), anyhow::Error> {
    let mut config = SnapkeepConfig::from_env()?;
    if let Some(dir) = snapshot_dir {
        config.snapshot_dir = dir;
    }
    if config.snapshot_dir.as_os_str().is_empty() {
        bail!("no snapshot directory given; use --snapshot-dir or {ENV_SNAPSHOT_DIR}");
    }

    let manager = SnapshotManager::from_config(&config)?;
    Ok((manager, config))
}

/// Cancellation token that fires on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, canceling");
            token.cancel();
        }
    });
    cancel
}

fn show_formats() {
    let rows: Vec<_> = ArchiveFormat::ALL
        .iter()
        .map(|f| FormatRow {
            name: f.name(),
            content_type: f.content_type(),
            extension: f.file_extension(),
            compressed: f.is_compressed(),
        })
        .collect();
    println!("{}", Table::new(rows));
}

fn list_snapshots(manager: &SnapshotManager) -> Result<(), anyhow::Error> {
    let (snapshots, invalid) = manager
        .list_snapshots()
        .with_context(|| format!("listing {}", manager.snapshot_dir().display()))?;

    if snapshots.is_empty() {
        println!("No snapshots found");
    } else {
        let rows: Vec<_> = snapshots
            .into_iter()
            .map(|s| SnapshotRow {
                created: s.timestamp.map(format_timestamp).unwrap_or_default(),
                name: s.name,
            })
            .collect();
        println!("{}", Table::new(rows));
    }

    for name in invalid {
        println!("Not a snapshot: {name}");
    }

    Ok(())
}

async fn archive_snapshot(
    manager: &SnapshotManager,
    name: &str,
    format: &str,
    output: Option<PathBuf>,
) -> Result<(), anyhow::Error> {
    let stream = manager.start_download(name, format)?;
    let output = output.unwrap_or_else(|| PathBuf::from(stream.filename()));
    let to_stdout = output.as_os_str() == "-";

    info!(download_id = %stream.id(), snapshot = %name, path = %output.display(), "Writing archive");

    let cancel = cancel_on_ctrl_c();
    let writer = {
        let stream = stream.clone();
        let output = output.clone();
        tokio::task::spawn_blocking(move || -> Result<(), anyhow::Error> {
            if to_stdout {
                let stdout = io::stdout();
                let mut out = BufWriter::new(stdout.lock());
                let result = stream.write_archive(&mut out, &cancel);
                out.flush()?;
                result?;
            } else {
                let file = File::create(&output)
                    .with_context(|| format!("creating {}", output.display()))?;
                let mut out = BufWriter::new(file);
                let result = stream.write_archive(&mut out, &cancel);
                out.flush()?;
                result?;
            }
            Ok(())
        })
    };
    let result = writer.await.map_err(|e| anyhow!("archive task failed: {e}"))?;

    let status = manager.download_status(stream.id())?;
    manager.registry().remove(stream.id());

    let json = serde_json::to_string_pretty(&status)?;
    if to_stdout {
        eprintln!("{json}");
    } else {
        println!("{json}");
        if result.is_ok() {
            if let Ok(meta) = std::fs::metadata(&output) {
                println!("Wrote {} to {}", format_size(meta.len()), output.display());
            }
        }
    }

    if let Err(e) = result {
        error!(download_id = %stream.id(), error = %e, "Archive failed");
        return Err(e);
    }

    Ok(())
}

async fn prune_once(
    manager: &SnapshotManager,
    keep_within: chrono::Duration,
) -> Result<(), anyhow::Error> {
    let options = manager.prune_options(keep_within);
    let cancel = cancel_on_ctrl_c();

    info!(path = %manager.snapshot_dir().display(), keep_within = %format_duration(keep_within), "Pruning snapshots");

    let report = tokio::task::spawn_blocking(move || prune(&options, &cancel))
        .await
        .map_err(|e| anyhow!("prune task failed: {e}"))??;

    let rows: Vec<_> = report
        .deleted
        .into_iter()
        .map(|name| PruneRow {
            name,
            outcome: "deleted",
        })
        .chain(report.vetoed.into_iter().map(|name| PruneRow {
            name,
            outcome: "in use",
        }))
        .chain(report.skipped.into_iter().map(|name| PruneRow {
            name,
            outcome: "not a snapshot",
        }))
        .collect();

    if rows.is_empty() {
        println!("Nothing to prune");
    } else {
        println!("{}", Table::new(rows));
    }

    Ok(())
}

async fn run_autoprune(
    manager: &SnapshotManager,
    interval: chrono::Duration,
    keep_within: chrono::Duration,
) -> Result<(), anyhow::Error> {
    let interval = interval
        .to_std()
        .map_err(|_| anyhow!("interval must not be negative"))?;
    let pruner = Autopruner::new(interval, manager.prune_options(keep_within))?;

    pruner.run(cancel_on_ctrl_c()).await;
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
