//! partsync - tracks multi-part archive downloads and extracts finished groups.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use partsync::prelude::*;
use partsync::scanner;
use partsync::status;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "partsync")]
#[command(version)]
#[command(about = "Track multi-part archive downloads and extract complete groups one at a time")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Tracking file holding settings and url tracking
    #[arg(short, long, global = true, env = "PARTSYNC_CONFIG", default_value = "tracking.json")]
    config: PathBuf,

    /// Download directory (overrides the stored setting)
    #[arg(short, long, global = true)]
    downloads: Option<PathBuf>,

    /// Unpacking tool (overrides the stored setting)
    #[arg(long, global = true, env = "PARTSYNC_TOOL")]
    tool: Option<PathBuf>,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace tracking data with the urls in a file (one per line)
    Import {
        urls_file: PathBuf,

        /// JSON object mapping url to filename
        #[arg(short, long)]
        mapping: Option<PathBuf>,
    },

    /// Mark urls as downloaded
    Mark {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Show completion of every tracked group
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List groups that are not ready to extract yet
    Report,

    /// Show filenames and missing parts of one group
    Info { key: String },

    /// Extract every ready group, one at a time
    Extract {
        /// Delete archive parts after a successful extraction
        #[arg(long)]
        delete: bool,

        /// Check the extracted size against the archive size
        #[arg(long)]
        verify: bool,
    },

    /// Scan the download directory once and extract what is ready
    Scan {
        /// Also extract groups that were never imported
        #[arg(long)]
        all: bool,
    },

    /// Rescan the download directory periodically
    Watch {
        /// Also extract groups that were never imported
        #[arg(long)]
        all: bool,
    },

    /// List the contents of an archive
    List { archive: PathBuf },

    /// Drop old groups that are fully downloaded and extracted
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(if cli.verbose { "partsync=debug".parse()? } else { "partsync=info".parse()? }),
        )
        .with_target(false)
        .init();

    let store = TrackingStore::new(&cli.config);
    let mut settings = store.settings().await;
    if let Some(dir) = cli.downloads.clone() {
        settings.download_directory = dir;
    }
    if let Some(tool) = cli.tool.clone() {
        settings.unpack_tool = Some(tool);
    }

    match cli.command {
        Commands::Import { urls_file, mapping } => {
            let text = tokio::fs::read_to_string(&urls_file)
                .await
                .with_context(|| format!("reading {}", urls_file.display()))?;
            let urls: Vec<String> = text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect();
            let mapping = match mapping {
                Some(path) => Some(read_mapping(&path).await?),
                None => None,
            };
            let summary = store.import_urls(&urls, mapping.as_ref()).await?;
            println!("Imported {} urls into {} groups", summary.imported, summary.groups);
            if !summary.swept.is_empty() {
                println!("Cleaned up {} old groups", summary.swept.len());
            }
        }

        Commands::Mark { urls } => {
            let added = store.mark_downloaded(urls.iter().map(String::as_str)).await?;
            println!("Marked {added} of {} urls as downloaded", urls.len());
        }

        Commands::Status { json } => {
            let statuses = store.group_statuses().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else if statuses.is_empty() {
                println!("No groups tracked");
            } else {
                for status in statuses.values() {
                    let readiness = status::readiness_of(status);
                    println!(
                        "{:<40} {:>3}/{:<3} {:>6.1}%  {}{}",
                        status.record.base_name,
                        status.downloaded_count,
                        status.expected_parts(),
                        status.completion_percentage,
                        readiness.reason,
                        if status.record.is_optional { " (optional)" } else { "" },
                    );
                }
            }
        }

        Commands::Report => {
            let report = status::readiness_report(&store.snapshot().await);
            println!("Downloaded {} of {} imported urls", report.total_downloaded, report.total_imported);
            if report.all_ready() {
                println!("All groups are ready to extract");
            }
            for group in &report.incomplete {
                println!(
                    "{}: {}/{} downloaded, {}{}",
                    group.name,
                    group.downloaded,
                    group.expected,
                    group.reason,
                    if group.is_optional { " (optional)" } else { "" },
                );
            }
        }

        Commands::Info { key } => {
            let doc = store.snapshot().await;
            let key = if doc.archive_groups.contains_key(&key) { key } else { GroupRecord::key_for(&key) };
            let Some(info) = status::extraction_info(&doc, &key) else {
                bail!("unknown group: {key}");
            };
            println!("{}", serde_json::to_string_pretty(&info)?);
            let missing = status::missing_part_labels(&doc, &key);
            if !missing.is_empty() {
                println!("Missing: {}", missing.join(", "));
            }
        }

        Commands::Extract { delete, verify } => {
            settings.delete_after_extract |= delete;
            settings.verify_extraction_size |= verify;
            let queue = build_queue(&store, settings)?;
            let queued = queue.enqueue_extractable_groups().await;
            if queued == 0 {
                println!("Nothing ready to extract");
                return Ok(());
            }
            let summary = run_until_interrupted(&queue).await;
            print_summary(&summary);
        }

        Commands::Scan { all } => {
            settings.json_only &= !all;
            let queue = build_queue(&store, settings)?;
            let queued = scanner::scan_and_enqueue(&store, &queue).await?;
            if queued == 0 {
                println!("Nothing ready to extract");
                return Ok(());
            }
            let summary = run_until_interrupted(&queue).await;
            print_summary(&summary);
        }

        Commands::Watch { all } => {
            settings.json_only &= !all;
            let queue = build_queue(&store, settings)?;
            let cancel = CancellationToken::new();
            let watcher = tokio::spawn(scanner::watch(store.clone(), queue.clone(), cancel.clone()));
            tokio::signal::ctrl_c().await?;
            info!("interrupted, stopping");
            cancel.cancel();
            queue.stop_and_terminate().await;
            watcher.await?;
        }

        Commands::List { archive } => {
            let program = settings.resolve_unpack_tool().context("no unpacking tool configured or found")?;
            let listing = CommandTool::new(program).list_contents(&archive).await?;
            for entry in &listing.entries {
                println!("{:>14}  {}", entry.size, entry.name);
            }
            println!("{} files, {} bytes", listing.file_count, listing.total_size);
        }

        Commands::Sweep => {
            let removed = store.sweep_retention().await?;
            println!("Removed {} groups", removed.len());
        }
    }

    Ok(())
}

async fn read_mapping(path: &Path) -> Result<HashMap<String, String>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn build_queue(store: &TrackingStore, settings: Settings) -> Result<Arc<ExtractionQueue>> {
    let program = settings.resolve_unpack_tool().context("no unpacking tool configured or found")?;
    info!(tool = %program.display(), "using unpacking tool");
    let tool: Arc<dyn UnpackTool> = Arc::new(CommandTool::new(program));
    let queue = Arc::new(ExtractionQueue::new(store.clone(), tool, settings));

    let events = queue.subscribe();
    tokio::spawn(forward_events(events, |line| println!("{line}")));
    Ok(queue)
}

/// Prints queue events until the queue is dropped. Missed events are
/// skipped over rather than ending the loop.
async fn forward_events(mut events: broadcast::Receiver<QueueEvent>, mut print: impl FnMut(String)) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "event printer fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if let Some(line) = event_line(event) {
            print(line);
        }
    }
}

fn event_line(event: QueueEvent) -> Option<String> {
    match event {
        QueueEvent::Started { name, remaining, .. } => Some(format!("Extracting {name} ({remaining} queued)")),
        QueueEvent::Finished { name, outcome, .. } => Some(match outcome {
            GroupOutcome::Extracted { .. } => format!("Extracted {name}"),
            GroupOutcome::Failed { reason } => format!("Failed {name}: {reason}"),
        }),
        QueueEvent::Skipped { name, reason, .. } => Some(format!("Skipped {name}: {reason}")),
        _ => None,
    }
}

async fn run_until_interrupted(queue: &Arc<ExtractionQueue>) -> QueueSummary {
    let driver = queue.clone();
    let mut run = tokio::spawn(async move { driver.run().await });
    tokio::select! {
        finished = &mut run => return finished.unwrap_or_default(),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping extraction");
            queue.stop_and_terminate().await;
        }
    }
    run.await.unwrap_or_default()
}

fn print_summary(summary: &QueueSummary) {
    println!(
        "Extracted {} groups, {} failed{}",
        summary.extracted.len(),
        summary.failed.len(),
        if summary.stopped { " (stopped)" } else { "" },
    );
    for (key, reason) in &summary.failed {
        println!("  {key}: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(name: &str) -> QueueEvent {
        QueueEvent::Started { key: format!("{name}_group"), name: name.to_string(), remaining: 0 }
    }

    #[tokio::test]
    async fn printer_survives_falling_behind() {
        let (sender, receiver) = broadcast::channel(2);
        for name in ["a", "b", "c", "d"] {
            sender.send(started(name)).unwrap();
        }
        sender.send(QueueEvent::Progress { percent: 50 }).unwrap();
        drop(sender);

        let mut lines = Vec::new();
        forward_events(receiver, |line| lines.push(line)).await;
        assert_eq!(lines, vec!["Extracting d (0 queued)"]);
    }
}
