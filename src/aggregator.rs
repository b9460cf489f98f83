// src/aggregator.rs

use crate::models::{filename_from_url, GroupRecord, TrackingDocument};
use crate::patterns::{is_archive_filename, is_optional_archive, parse_part_name};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Groups `urls` into multi-part archive records keyed by `"{base_name}_group"`.
///
/// URLs whose filename is not an archive, or matches no part convention,
/// contribute nothing here; they stay tracked individually by the caller.
pub fn aggregate(
    urls: &[String],
    url_to_filename: &BTreeMap<String, String>,
) -> BTreeMap<String, GroupRecord> {
    let mut groups: BTreeMap<String, GroupRecord> = BTreeMap::new();

    for url in urls {
        let filename = url_to_filename
            .get(url)
            .cloned()
            .unwrap_or_else(|| filename_from_url(url));

        if !is_archive_filename(&filename) {
            continue;
        }
        let Some(found) = parse_part_name(&filename) else {
            debug!(%filename, "no part convention matched, not grouped");
            continue;
        };

        let key = GroupRecord::key_for(&found.base_name);
        let record = groups.entry(key).or_insert_with(|| {
            let mut record =
                GroupRecord::new(found.base_name.clone(), found.total, is_optional_archive(&filename));
            record.part_width = found.width;
            record
        });

        if record.total_parts.is_none() {
            record.total_parts = found.total;
        }
        record.imported_parts.insert(found.part);
        record.urls.insert(found.part, url.clone());
        record.filenames.insert(found.part, filename);
    }

    groups
}

/// Replaces the whole document with a new import batch.
///
/// Filenames come from `url_to_filename` when it has an entry, otherwise from
/// the URL itself.
/// Every group created by this batch is stamped with `now`.
pub fn rebuild_from_import(
    doc: &mut TrackingDocument,
    urls: &[String],
    url_to_filename: Option<&HashMap<String, String>>,
    now: DateTime<Utc>,
) {
    doc.clear();

    for url in urls {
        if !doc.push_imported(url) {
            continue;
        }
        let filename = url_to_filename
            .and_then(|mapping| mapping.get(url).cloned())
            .unwrap_or_else(|| filename_from_url(url));
        doc.url_to_filename.insert(url.clone(), filename);
    }

    doc.archive_groups = aggregate(&doc.imported_urls, &doc.url_to_filename);
    for record in doc.archive_groups.values_mut() {
        record.date_added = Some(now);
    }
}

/// Counts remote listing links per group key. Each entry is
/// `(display_text, href)`; the display text is preferred when it names an
/// archive, else the href's last segment is used.
pub fn group_remote_listing(links: &[(String, String)]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for (text, href) in links {
        let text = text.trim();
        let filename = if is_archive_filename(text) {
            text.to_string()
        } else {
            filename_from_url(href)
        };
        if let Some(found) = parse_part_name(&filename) {
            *counts.entry(GroupRecord::key_for(&found.base_name)).or_insert(0) += 1;
        }
    }
    counts
}

/// Records the remote listing on the document. Informational only: readiness
/// never depends on it.
pub fn apply_remote_listing(doc: &mut TrackingDocument, links: &[(String, String)]) {
    let counts = group_remote_listing(links);
    doc.total_available_links = Some(links.len());
    for (key, record) in doc.archive_groups.iter_mut() {
        record.available_links = counts.get(key).copied();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn groups_parts_under_one_key() {
        let list = urls(&["http://x/game.part01.rar", "http://x/game.part02.rar"]);
        let groups = aggregate(&list, &BTreeMap::new());

        assert_eq!(groups.len(), 1);
        let group = &groups["game_group"];
        assert_eq!(group.base_name, "game");
        assert_eq!(group.imported_parts.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(group.total_parts, None);
        assert_eq!(group.part_width, 2);
        assert_eq!(group.urls[&2], "http://x/game.part02.rar");
    }

    #[test]
    fn parts_are_sorted_regardless_of_input_order() {
        let list = urls(&["http://x/g.part3.rar", "http://x/g.part1.rar", "http://x/g.part2.rar"]);
        let groups = aggregate(&list, &BTreeMap::new());
        assert_eq!(
            groups["g_group"].imported_parts.iter().copied().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn mapping_overrides_url_segment() {
        let list = urls(&["http://host/f/abc123"]);
        let mut mapping = BTreeMap::new();
        mapping.insert(list[0].clone(), "Movie.part1of2.rar".to_string());

        let groups = aggregate(&list, &mapping);
        assert_eq!(groups["Movie_group"].total_parts, Some(2));
    }

    #[test]
    fn known_total_is_not_lost() {
        let mut mapping = BTreeMap::new();
        let list = urls(&["http://h/1", "http://h/2"]);
        mapping.insert(list[0].clone(), "m.part1of3.rar".to_string());
        mapping.insert(list[1].clone(), "m.part2.rar".to_string());

        let groups = aggregate(&list, &mapping);
        assert_eq!(groups["m_group"].total_parts, Some(3));
    }

    #[test]
    fn ungrouped_files_are_skipped() {
        let list = urls(&["http://x/setup.exe", "http://x/single.rar", "http://x/notes.txt"]);
        assert!(aggregate(&list, &BTreeMap::new()).is_empty());
    }

    #[test]
    fn aggregate_is_idempotent() {
        let list = urls(&[
            "http://x/a.part1.rar",
            "http://x/a.part2.rar",
            "http://x/b-dlc.001.rar",
            "http://x/readme.txt",
        ]);
        let first = aggregate(&list, &BTreeMap::new());
        let second = aggregate(&list, &BTreeMap::new());
        assert_eq!(first, second);
        assert!(second["b-dlc_group"].is_optional);
    }

    #[test]
    fn import_replaces_previous_batch() {
        let mut doc = TrackingDocument::default();
        let now = Utc::now();
        rebuild_from_import(&mut doc, &urls(&["http://x/old.part1.rar"]), None, now);
        doc.downloaded_urls.insert("http://x/old.part1.rar".into());

        rebuild_from_import(&mut doc, &urls(&["http://x/new.part1.rar", "http://x/new.part1.rar"]), None, now);

        assert_eq!(doc.imported_urls, urls(&["http://x/new.part1.rar"]));
        assert!(doc.downloaded_urls.is_empty());
        assert!(!doc.url_to_filename.contains_key("http://x/old.part1.rar"));
        assert_eq!(doc.archive_groups.keys().collect::<Vec<_>>(), vec!["new_group"]);
        assert_eq!(doc.archive_groups["new_group"].date_added, Some(now));
    }

    #[test]
    fn remote_listing_counts_per_group() {
        let mut doc = TrackingDocument::default();
        rebuild_from_import(&mut doc, &urls(&["http://x/g.part1.rar"]), None, Utc::now());

        let links = vec![
            ("g.part1.rar".to_string(), "http://x/g.part1.rar".to_string()),
            ("Download".to_string(), "http://x/g.part2.rar".to_string()),
            ("g.part3.rar".to_string(), "http://x/abc".to_string()),
            ("Homepage".to_string(), "http://x/".to_string()),
        ];
        apply_remote_listing(&mut doc, &links);

        assert_eq!(doc.total_available_links, Some(4));
        assert_eq!(doc.archive_groups["g_group"].available_links, Some(3));
    }
}
