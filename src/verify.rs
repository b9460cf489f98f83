// src/verify.rs

use crate::config::SizeTolerance;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Total bytes of regular files below `dir`, recursively.
pub fn folder_size(dir: &Path) -> (u64, usize) {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .fold((0, 0), |(bytes, files), meta| (bytes + meta.len(), files + 1))
}

/// Summed size of archive parts; unreadable parts count as zero.
pub fn archive_size(parts: &[PathBuf]) -> u64 {
    parts
        .iter()
        .filter_map(|path| std::fs::metadata(path).ok())
        .map(|meta| meta.len())
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    Passed { extracted: u64 },
    MissingFolder,
    EmptyFolder,
    Mismatch { extracted: u64, archive: u64, allowance: u64 },
}

impl SizeCheck {
    pub fn passed(&self) -> bool {
        matches!(self, SizeCheck::Passed { .. })
    }
}

/// Compares the extracted folder against the archive size after a tool run.
pub fn check_extracted_size(destination: &Path, archive: u64, tolerance: &SizeTolerance) -> SizeCheck {
    if !destination.is_dir() {
        return SizeCheck::MissingFolder;
    }
    let (extracted, files) = folder_size(destination);
    debug!(folder = %destination.display(), extracted, files, archive, "size check");
    if extracted == 0 {
        return SizeCheck::EmptyFolder;
    }
    if tolerance.accepts(archive, extracted) {
        SizeCheck::Passed { extracted }
    } else {
        SizeCheck::Mismatch { extracted, archive, allowance: tolerance.allowance(archive) }
    }
}

/// Whether a group's destination already holds its extracted contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStatus {
    NotExtracted,
    AlreadyExtracted,
    NeedsReExtraction,
}

pub fn extraction_status(destination: &Path, archive: u64, tolerance: &SizeTolerance) -> ExtractionStatus {
    match check_extracted_size(destination, archive, tolerance) {
        SizeCheck::Passed { .. } => ExtractionStatus::AlreadyExtracted,
        SizeCheck::Mismatch { .. } => ExtractionStatus::NeedsReExtraction,
        SizeCheck::MissingFolder | SizeCheck::EmptyFolder => ExtractionStatus::NotExtracted,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub deleted: usize,
    pub failed: Vec<PathBuf>,
}

impl DeletionReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deletes every archive part. Parts already gone count as deleted; a
/// failure on one part does not stop the rest.
pub fn delete_archives(parts: &[PathBuf]) -> DeletionReport {
    let mut report = DeletionReport::default();
    for part in parts {
        match std::fs::remove_file(part) {
            Ok(()) => {
                debug!(file = %part.display(), "deleted archive part");
                report.deleted += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.deleted += 1,
            Err(e) => {
                warn!(file = %part.display(), error = %e, "failed to delete archive part");
                report.failed.push(part.clone());
            }
        }
    }
    info!(deleted = report.deleted, failed = report.failed.len(), "archive cleanup finished");
    report
}
