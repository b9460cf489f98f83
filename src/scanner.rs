// src/scanner.rs

//! Finds archive groups directly on disk, independent of the tracking store,
//! then cross-checks them against it to decide what to extract and in which
//! order.

use crate::config::Settings;
use crate::models::{GroupRecord, GroupStatus};
use crate::patterns::{is_optional_archive, is_scan_candidate, normalize_dashes, part_number, scan_base_name};
use crate::queue::{ExtractionJob, ExtractionQueue, JobOrigin};
use crate::state_manager::{StoreError, TrackingStore};
use crate::status::{evaluate, readiness_of};
use crate::verify::{self, ExtractionStatus};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("folder not found: {0}")]
    MissingFolder(PathBuf),
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

/// Files on disk sharing one base name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannedGroup {
    pub base_name: String,
    pub files: Vec<ScannedFile>,
}

impl ScannedGroup {
    pub fn archive_size(&self) -> u64 {
        self.files.iter().map(|file| file.size).sum()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|file| file.path.clone()).collect()
    }

    /// Numbered `.rar` volumes run exactly `1..=n` and classic `.rNN` split
    /// volumes run exactly `0..n`. Groups without numbered parts count as complete.
    pub fn is_sequence_complete(&self) -> bool {
        let (mut volumes, mut splits): (Vec<u32>, Vec<u32>) = (Vec::new(), Vec::new());
        for file in &self.files {
            let Some(part) = part_number(&file.name) else {
                continue;
            };
            if is_rar(&file.name) {
                volumes.push(part);
            } else {
                splits.push(part);
            }
        }
        volumes.sort_unstable();
        splits.sort_unstable();
        volumes.iter().enumerate().all(|(i, part)| *part as usize == i + 1)
            && splits.iter().enumerate().all(|(i, part)| *part as usize == i)
    }

    /// The volume to hand to the tool: the lowest numbered `.rar` volume,
    /// else the first `.rar` by name, else the first file by name.
    pub fn first_file(&self) -> Option<&ScannedFile> {
        let lowest = self
            .files
            .iter()
            .filter(|f| is_rar(&f.name))
            .filter_map(|f| part_number(&f.name).map(|n| (n, f)))
            .min_by_key(|(n, _)| *n);
        if let Some((_, first)) = lowest {
            return Some(first);
        }
        let mut sorted: Vec<&ScannedFile> = self.files.iter().collect();
        sorted.sort_by_key(|f| f.name.to_lowercase());
        sorted
            .iter()
            .find(|f| is_rar(&f.name))
            .or_else(|| sorted.first())
            .copied()
    }

    fn has_file_named(&self, filename: &str) -> bool {
        let wanted = normalize_dashes(filename).to_lowercase();
        self.files
            .iter()
            .any(|f| normalize_dashes(&f.name).to_lowercase() == wanted)
    }
}

fn is_rar(name: &str) -> bool {
    name.to_lowercase().ends_with(".rar")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderScan {
    pub dir: PathBuf,
    pub groups: BTreeMap<String, ScannedGroup>,
}

/// Lists `dir` (not recursively) and clusters archive-looking files by base name.
pub fn scan_folder(dir: &Path) -> Result<FolderScan, ScanError> {
    if !dir.is_dir() {
        return Err(ScanError::MissingFolder(dir.to_path_buf()));
    }
    let mut scan = FolderScan { dir: dir.to_path_buf(), groups: BTreeMap::new() };

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_scan_candidate(&name) {
            continue;
        }
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(file = %name, error = %e, "cannot stat, skipping");
                continue;
            }
        };
        let base_name = scan_base_name(&name);
        debug!(file = %name, group = %base_name, "scanned");
        scan.groups
            .entry(base_name.clone())
            .or_insert_with(|| ScannedGroup { base_name, files: Vec::new() })
            .files
            .push(ScannedFile { path: entry.path().to_path_buf(), name, size });
    }

    for group in scan.groups.values_mut() {
        group.files.sort_by(|a, b| a.name.cmp(&b.name));
    }
    info!(dir = %dir.display(), groups = scan.groups.len(), "folder scanned");
    Ok(scan)
}

/// Runs [`scan_folder`] on a blocking worker thread.
pub async fn scan_folder_in_background(dir: PathBuf) -> Result<FolderScan, ScanError> {
    tokio::task::spawn_blocking(move || scan_folder(&dir)).await?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Tracked,
    Untracked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub priority: Priority,
    pub status: ExtractionStatus,
    pub job: ExtractionJob,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrossCheckReport {
    /// Tracked groups first, then untracked ones.
    pub candidates: Vec<Candidate>,
    /// URLs newly marked downloaded because their files were found on disk.
    pub reconciled: usize,
    /// Untracked groups left out because of JSON-only mode.
    pub skipped_untracked: usize,
    pub skipped: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrossCheck {
    /// An extraction is running; nothing was read or changed.
    SkippedWhileExtracting,
    Checked(CrossCheckReport),
}

/// Tracking groups keyed by normalized base name.
fn tracked_by_name(statuses: BTreeMap<String, GroupStatus>) -> HashMap<String, GroupStatus> {
    statuses
        .into_values()
        .map(|status| (normalize_dashes(&status.record.base_name), status))
        .collect()
}

/// Marks URLs downloaded when their files are on disk but the store has
/// fewer downloads recorded than files found. Returns how many were marked.
pub async fn reconcile(store: &TrackingStore, scan: &FolderScan) -> Result<usize, StoreError> {
    let tracked = tracked_by_name(evaluate(&store.snapshot().await));
    let mut to_mark: Vec<String> = Vec::new();

    for group in scan.groups.values() {
        let Some(status) = tracked.get(&normalize_dashes(&group.base_name)) else {
            continue;
        };
        if group.files.len() <= status.downloaded_count {
            continue;
        }
        for (part, filename) in &status.record.filenames {
            if status.downloaded_parts.contains(part) || !group.has_file_named(filename) {
                continue;
            }
            if let Some(url) = status.record.urls.get(part) {
                to_mark.push(url.clone());
            }
        }
    }

    if to_mark.is_empty() {
        return Ok(0);
    }
    let marked = store.mark_downloaded(to_mark.iter().map(String::as_str)).await?;
    info!(marked, "back-filled downloads found on disk");
    Ok(marked)
}

fn scanned_job(settings: &Settings, group: &ScannedGroup, tracked: Option<&GroupStatus>) -> Option<ExtractionJob> {
    let first = group.first_file()?;
    let tracked_key = tracked.map(|status| status.key.clone());
    Some(ExtractionJob {
        key: tracked_key.clone().unwrap_or_else(|| GroupRecord::key_for(&group.base_name)),
        name: group.base_name.clone(),
        archive: first.path.clone(),
        parts: group.paths(),
        destination: settings.destination_for(&group.base_name),
        password: settings.password.clone(),
        verify_size: true,
        is_optional: tracked
            .map(|status| status.record.is_optional)
            .unwrap_or_else(|| is_optional_archive(&group.base_name)),
        origin: JobOrigin::Scanned { tracked_key },
    })
}

/// Cross-checks a scan against the tracking store and the queue's session
/// state. Does nothing while an extraction is running.
pub async fn cross_check(
    store: &TrackingStore,
    queue: &ExtractionQueue,
    scan: &FolderScan,
) -> Result<CrossCheck, ScanError> {
    if queue.is_extracting().await {
        debug!("extraction active, cross-check skipped");
        return Ok(CrossCheck::SkippedWhileExtracting);
    }
    let settings = queue.settings();
    let processed = queue.processed_keys().await;

    let reconciled = reconcile(store, scan).await?;
    let tracked = tracked_by_name(evaluate(&store.snapshot().await));
    let mut report = CrossCheckReport { reconciled, ..CrossCheckReport::default() };

    for group in scan.groups.values() {
        let status = tracked.get(&normalize_dashes(&group.base_name));
        let key = status
            .map(|s| s.key.clone())
            .unwrap_or_else(|| GroupRecord::key_for(&group.base_name));
        if processed.contains(&key) {
            continue;
        }

        let priority = match status {
            Some(status) => {
                let readiness = readiness_of(status);
                if !readiness.ready {
                    report.skipped.push((key, readiness.reason));
                    continue;
                }
                Priority::Tracked
            }
            None if settings.json_only => {
                report.skipped_untracked += 1;
                continue;
            }
            None => {
                if !group.is_sequence_complete() {
                    report.skipped.push((key, "Part sequence has gaps".to_string()));
                    continue;
                }
                Priority::Untracked
            }
        };

        let extraction = verify::extraction_status(
            &settings.destination_for(&group.base_name),
            group.archive_size(),
            &settings.size_tolerance,
        );
        if extraction == ExtractionStatus::AlreadyExtracted {
            debug!(group = %group.base_name, "already extracted");
            continue;
        }
        if extraction == ExtractionStatus::NeedsReExtraction {
            info!(group = %group.base_name, "size mismatch on disk, re-extracting");
        }
        let Some(job) = scanned_job(settings, group, status) else {
            report.skipped.push((key, "No suitable file found".to_string()));
            continue;
        };
        report.candidates.push(Candidate { priority, status: extraction, job });
    }

    if report.skipped_untracked > 0 {
        info!(count = report.skipped_untracked, "json-only mode, untracked groups skipped");
    }
    report.candidates.sort_by(|a, b| (a.priority, &a.job.key).cmp(&(b.priority, &b.job.key)));
    Ok(CrossCheck::Checked(report))
}

/// Scans, cross-checks and queues in one pass. Returns how many jobs were queued.
pub async fn scan_and_enqueue(store: &TrackingStore, queue: &ExtractionQueue) -> Result<usize, ScanError> {
    let scan = scan_folder_in_background(queue.settings().download_directory.clone()).await?;
    let report = match cross_check(store, queue, &scan).await? {
        CrossCheck::SkippedWhileExtracting => return Ok(0),
        CrossCheck::Checked(report) => report,
    };
    let mut queued = 0;
    for candidate in report.candidates {
        if queue.enqueue(candidate.job).await {
            queued += 1;
        }
    }
    Ok(queued)
}

/// Rescans on the configured interval and extracts whatever became ready,
/// until `cancel` fires.
pub async fn watch(store: TrackingStore, queue: Arc<ExtractionQueue>, cancel: CancellationToken) {
    let interval = queue.settings().scan_interval();
    loop {
        match scan_and_enqueue(&store, &queue).await {
            Ok(0) => debug!("nothing new to extract"),
            Ok(queued) => {
                info!(queued, "auto-extracting");
                let summary = queue.run().await;
                if summary.stopped {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "auto-scan failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    info!("auto-scan stopped");
}
