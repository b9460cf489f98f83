// src/status.rs

//! Derived, never-cached views over a [`TrackingDocument`].
//!
//! Everything here is a pure projection: callers pass the snapshot they just
//! read, and download marks are re-intersected on every call.

use crate::models::{
    ExtractionInfo, GroupRecord, GroupStatus, IncompleteGroup, Readiness, ReadinessReport,
    TrackingDocument,
};
use crate::patterns::part_label;
use std::collections::BTreeMap;

/// Percentage of expected parts that are downloaded, in `0.0..=100.0`.
pub fn completion_percentage(downloaded: usize, imported: usize, total_parts: Option<u32>) -> f64 {
    let expected = match total_parts {
        Some(total) if total > 0 => total as usize,
        _ => imported,
    };
    if expected == 0 {
        return 0.0;
    }
    (downloaded as f64 / expected as f64 * 100.0).min(100.0)
}

/// Status of one stored group against the document's download marks.
pub fn group_status(doc: &TrackingDocument, key: &str, record: &GroupRecord) -> GroupStatus {
    let downloaded_parts: Vec<u32> = record
        .urls
        .iter()
        .filter(|(_, url)| doc.is_downloaded(url))
        .map(|(part, _)| *part)
        .collect();
    let imported_count = record.imported_parts.len();
    let downloaded_count = downloaded_parts.len();

    GroupStatus {
        key: key.to_string(),
        record: record.clone(),
        completion_percentage: completion_percentage(downloaded_count, imported_count, record.total_parts),
        downloaded_parts,
        imported_count,
        downloaded_count,
    }
}

/// Status of every stored group.
pub fn evaluate(doc: &TrackingDocument) -> BTreeMap<String, GroupStatus> {
    doc.archive_groups
        .iter()
        .map(|(key, record)| (key.clone(), group_status(doc, key, record)))
        .collect()
}

/// Whether `key` has every expected part downloaded, with the reason if not.
///
/// With an unknown total this can only compare against what was imported;
/// parts that were never imported are invisible here.
pub fn can_extract(doc: &TrackingDocument, key: &str) -> Readiness {
    let Some(record) = doc.archive_groups.get(key) else {
        return Readiness::blocked("Group not found");
    };
    readiness_of(&group_status(doc, key, record))
}

pub fn readiness_of(status: &GroupStatus) -> Readiness {
    if status.downloaded_count == 0 {
        return Readiness::blocked("No parts downloaded");
    }
    match status.record.total_parts {
        Some(total) if status.downloaded_count < total as usize => {
            let missing = total as usize - status.downloaded_count;
            Readiness::blocked(format!("Missing {missing} part(s) out of {total}"))
        }
        None if status.downloaded_count < status.imported_count => {
            let missing = status.imported_count - status.downloaded_count;
            Readiness::blocked(format!("Missing {missing} imported part(s)"))
        }
        _ => Readiness::ready(),
    }
}

/// `"first to last"` filename span of a group.
pub fn filename_range(doc: &TrackingDocument, key: &str) -> String {
    let Some(record) = doc.archive_groups.get(key) else {
        return "Unknown group".to_string();
    };
    let mut names = record.filenames.values().map(|name| display_name(name));
    let Some(first) = names.next() else {
        return "No filenames found".to_string();
    };
    match names.last() {
        Some(last) => format!("{first} to {last}"),
        None => first.to_string(),
    }
}

fn display_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Detail view for one group, `None` if the key is unknown.
pub fn extraction_info(doc: &TrackingDocument, key: &str) -> Option<ExtractionInfo> {
    let record = doc.archive_groups.get(key)?;
    let status = group_status(doc, key, record);
    let all_filenames: Vec<String> = record.filenames.values().cloned().collect();

    Some(ExtractionInfo {
        group_name: record.base_name.clone(),
        filename_range: filename_range(doc, key),
        total_parts: record
            .total_parts
            .map(|t| t as usize)
            .unwrap_or(all_filenames.len()),
        all_filenames,
        downloaded_parts: status.downloaded_parts,
        is_optional: record.is_optional,
        completion_percentage: status.completion_percentage,
    })
}

/// Labels (`part003`) of parts in the expected range that are not downloaded.
///
/// The range end is the known total, else the remote listing count, else the
/// highest imported part.
pub fn missing_part_labels(doc: &TrackingDocument, key: &str) -> Vec<String> {
    let Some(record) = doc.archive_groups.get(key) else {
        return Vec::new();
    };
    let status = group_status(doc, key, record);
    let highest_imported = record.imported_parts.iter().next_back().copied().unwrap_or(0);
    let expected = record
        .total_parts
        .or_else(|| record.available_links.map(|n| n as u32))
        .unwrap_or(highest_imported)
        .max(highest_imported);

    (1..=expected)
        .filter(|part| !status.downloaded_parts.contains(part))
        .map(|part| part_label(part, record.part_width))
        .collect()
}

/// Totals across all groups plus the groups that have started downloading
/// but are not ready yet.
pub fn readiness_report(doc: &TrackingDocument) -> ReadinessReport {
    let mut report = ReadinessReport::default();
    for status in evaluate(doc).into_values() {
        report.total_imported += status.imported_count;
        report.total_downloaded += status.downloaded_count;

        let readiness = readiness_of(&status);
        if !readiness.ready && status.downloaded_count > 0 {
            report.incomplete.push(IncompleteGroup {
                name: status.record.base_name.clone(),
                imported: status.imported_count,
                downloaded: status.downloaded_count,
                expected: status.expected_parts(),
                reason: readiness.reason,
                is_optional: status.record.is_optional,
            });
        }
    }
    report
}
