// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};

/// The persisted tracking data: what was imported, what has finished
/// downloading, and the multi-part archive groups derived from the imports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingDocument {
    #[serde(default)]
    pub imported_urls: Vec<String>,
    #[serde(default)]
    pub downloaded_urls: BTreeSet<String>,
    #[serde(default)]
    pub url_to_filename: BTreeMap<String, String>,
    #[serde(default)]
    pub archive_groups: BTreeMap<String, GroupRecord>,
    /// Number of links seen during the most recent remote listing fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_available_links: Option<usize>,
}

impl TrackingDocument {
    /// Appends `url` unless it is already imported. Returns whether it was added.
    pub fn push_imported(&mut self, url: &str) -> bool {
        if self.imported_urls.iter().any(|u| u == url) {
            return false;
        }
        self.imported_urls.push(url.to_string());
        true
    }

    pub fn is_imported(&self, url: &str) -> bool {
        self.imported_urls.iter().any(|u| u == url)
    }

    pub fn is_downloaded(&self, url: &str) -> bool {
        self.downloaded_urls.contains(url)
    }

    /// Filename for `url`: the recorded mapping, or the URL's last path
    /// segment with any `#fragment` removed.
    pub fn filename_for(&self, url: &str) -> String {
        self.url_to_filename
            .get(url)
            .cloned()
            .unwrap_or_else(|| filename_from_url(url))
    }

    /// Drops every imported URL, download mark, mapping and group.
    pub fn clear(&mut self) {
        self.imported_urls.clear();
        self.downloaded_urls.clear();
        self.url_to_filename.clear();
        self.archive_groups.clear();
    }
}

/// Last path segment of a URL with the fragment stripped.
pub fn filename_from_url(url: &str) -> String {
    let last = url.rsplit('/').next().unwrap_or(url);
    last.split('#').next().unwrap_or(last).to_string()
}

/// One multi-part archive, keyed in the document by `"{base_name}_group"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub base_name: String,
    /// `None` when the naming convention does not carry a total.
    /// Persisted as `0` for unknown.
    #[serde(with = "unknown_as_zero", default)]
    pub total_parts: Option<u32>,
    #[serde(default)]
    pub imported_parts: BTreeSet<u32>,
    #[serde(default)]
    pub urls: BTreeMap<u32, String>,
    #[serde(default)]
    pub filenames: BTreeMap<u32, String>,
    #[serde(default)]
    pub is_optional: bool,
    /// Unparseable stamps load as `None`, which retention treats as "now".
    #[serde(default, deserialize_with = "lenient_timestamp::deserialize", skip_serializing_if = "Option::is_none")]
    pub date_added: Option<DateTime<Utc>>,
    /// Digit width of the part number as written in the first filename seen.
    #[serde(default = "default_part_width")]
    pub part_width: usize,
    /// Links belonging to this group in the latest remote listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_links: Option<usize>,
}

fn default_part_width() -> usize {
    1
}

impl GroupRecord {
    pub fn new(base_name: impl Into<String>, total_parts: Option<u32>, is_optional: bool) -> Self {
        Self {
            base_name: base_name.into(),
            total_parts,
            imported_parts: BTreeSet::new(),
            urls: BTreeMap::new(),
            filenames: BTreeMap::new(),
            is_optional,
            date_added: None,
            part_width: default_part_width(),
            available_links: None,
        }
    }

    /// Deterministic key for a base name.
    pub fn key_for(base_name: &str) -> String {
        format!("{base_name}_group")
    }

    pub fn key(&self) -> String {
        Self::key_for(&self.base_name)
    }

    /// Lowest-numbered part and its filename.
    pub fn first_part(&self) -> Option<(u32, &str)> {
        self.filenames
            .iter()
            .next()
            .map(|(part, name)| (*part, name.as_str()))
    }
}

mod unknown_as_zero {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(value.unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
        let raw = Option::<u32>::deserialize(deserializer)?;
        Ok(raw.filter(|n| *n > 0))
    }
}

/// Accepts RFC 3339 stamps and offset-less ISO stamps (read as UTC). Anything
/// else becomes `None` instead of failing the whole document.
mod lenient_timestamp {
    use super::*;
    use chrono::NaiveDateTime;

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(stamp) = DateTime::parse_from_rfc3339(raw) {
            return Some(stamp.with_timezone(&Utc));
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
            .map(|naive| naive.and_utc())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
        Ok(match raw {
            Some(serde_json::Value::String(text)) => parse(&text),
            _ => None,
        })
    }
}

/// A Group Record together with the fields derived from the current download marks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    pub key: String,
    #[serde(flatten)]
    pub record: GroupRecord,
    pub downloaded_parts: Vec<u32>,
    pub imported_count: usize,
    pub downloaded_count: usize,
    pub completion_percentage: f64,
}

impl GroupStatus {
    pub fn is_complete(&self) -> bool {
        self.completion_percentage >= 100.0 && self.downloaded_count > 0
    }

    /// Expected number of parts: the known total, else the imported count.
    pub fn expected_parts(&self) -> usize {
        match self.record.total_parts {
            Some(total) => total as usize,
            None => self.imported_count,
        }
    }
}

/// Human-readable answer to "can this group be extracted now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub reason: String,
}

impl Readiness {
    pub fn ready() -> Self {
        Self { ready: true, reason: "Ready to extract".to_string() }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self { ready: false, reason: reason.into() }
    }
}

/// Summary printed or shown before a possibly partial extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadinessReport {
    pub total_imported: usize,
    pub total_downloaded: usize,
    pub incomplete: Vec<IncompleteGroup>,
}

impl ReadinessReport {
    pub fn all_ready(&self) -> bool {
        self.incomplete.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncompleteGroup {
    pub name: String,
    pub imported: usize,
    pub downloaded: usize,
    pub expected: usize,
    pub reason: String,
    pub is_optional: bool,
}

/// Detail view of one group for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionInfo {
    pub group_name: String,
    pub filename_range: String,
    pub all_filenames: Vec<String>,
    pub total_parts: usize,
    pub downloaded_parts: Vec<u32>,
    pub is_optional: bool,
    pub completion_percentage: f64,
}
