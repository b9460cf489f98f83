// src/retention.rs

use crate::models::TrackingDocument;
use crate::patterns::clean_folder_name;
use crate::status::evaluate;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

/// Removes groups that are fully downloaded, already extracted into a
/// non-empty folder under `download_dir`, and older than `max_age`.
/// Returns the removed keys.
pub fn sweep(
    doc: &mut TrackingDocument,
    download_dir: &Path,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Vec<String> {
    let extracted = extracted_groups(doc, download_dir);
    sweep_extracted(doc, &extracted, max_age, now)
}

/// Keys of complete groups whose destination folder has contents. Touches
/// the filesystem; keep it off the async threads and outside the store lock.
pub fn extracted_groups(doc: &TrackingDocument, download_dir: &Path) -> BTreeSet<String> {
    evaluate(doc)
        .into_iter()
        .filter(|(_, status)| status.completion_percentage >= 100.0)
        .filter(|(_, status)| is_non_empty_dir(&download_dir.join(clean_folder_name(&status.record.base_name))))
        .map(|(key, _)| key)
        .collect()
}

/// The age part of the sweep. Only keys in `extracted` are candidates, and
/// completion is checked again against `doc` as it is now.
pub fn sweep_extracted(
    doc: &mut TrackingDocument,
    extracted: &BTreeSet<String>,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Vec<String> {
    let cutoff = now - max_age;
    let mut removed = Vec::new();

    for (key, status) in evaluate(doc) {
        if status.completion_percentage < 100.0 || !extracted.contains(&key) {
            continue;
        }
        // Groups without a stamp count as new.
        let added = status.record.date_added.unwrap_or(now);
        if added < cutoff {
            info!(group = %status.record.base_name, added = %added.format("%Y-%m-%d"), "dropping old extracted group");
            removed.push(key);
        }
    }

    for key in &removed {
        doc.archive_groups.remove(key);
    }
    removed
}

fn is_non_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::rebuild_from_import;
    use tempfile::TempDir;

    fn finished_doc(added: DateTime<Utc>) -> TrackingDocument {
        let mut doc = TrackingDocument::default();
        let urls = vec!["http://x/Cyberpunk.part001.rar".to_string()];
        rebuild_from_import(&mut doc, &urls, None, added);
        doc.downloaded_urls.insert(urls[0].clone());
        doc
    }

    #[test]
    fn removes_old_extracted_groups() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("Cyberpunk")).unwrap();
        std::fs::write(dir.path().join("Cyberpunk/game.bin"), b"x").unwrap();

        let now = Utc::now();
        let mut doc = finished_doc(now - Duration::days(5));
        let removed = sweep(&mut doc, dir.path(), Duration::days(3), now);

        assert_eq!(removed, vec!["Cyberpunk_group".to_string()]);
        assert!(doc.archive_groups.is_empty());
    }

    #[test]
    fn keeps_recent_or_unextracted_groups() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();

        let mut old_not_extracted = finished_doc(now - Duration::days(10));
        assert!(sweep(&mut old_not_extracted, dir.path(), Duration::days(3), now).is_empty());

        std::fs::create_dir(dir.path().join("Cyberpunk")).unwrap();
        let mut empty_folder = finished_doc(now - Duration::days(10));
        assert!(sweep(&mut empty_folder, dir.path(), Duration::days(3), now).is_empty());

        std::fs::write(dir.path().join("Cyberpunk/game.bin"), b"x").unwrap();
        let mut recent = finished_doc(now - Duration::days(1));
        assert!(sweep(&mut recent, dir.path(), Duration::days(3), now).is_empty());
    }

    #[test]
    fn folder_check_is_separate_from_age_check() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("Cyberpunk")).unwrap();
        std::fs::write(dir.path().join("Cyberpunk/game.bin"), b"x").unwrap();

        let now = Utc::now();
        let mut doc = finished_doc(now - Duration::days(5));
        let extracted = extracted_groups(&doc, dir.path());
        assert!(extracted.contains("Cyberpunk_group"));

        // a group that lost its download marks since the folder check stays
        let mut changed = doc.clone();
        changed.downloaded_urls.clear();
        assert!(sweep_extracted(&mut changed, &extracted, Duration::days(3), now).is_empty());

        assert_eq!(sweep_extracted(&mut doc, &extracted, Duration::days(3), now), vec!["Cyberpunk_group"]);
    }

    #[test]
    fn keeps_incomplete_groups() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("Cyberpunk")).unwrap();
        std::fs::write(dir.path().join("Cyberpunk/game.bin"), b"x").unwrap();

        let now = Utc::now();
        let mut doc = finished_doc(now - Duration::days(5));
        doc.downloaded_urls.clear();
        assert!(sweep(&mut doc, dir.path(), Duration::days(3), now).is_empty());
    }
}
