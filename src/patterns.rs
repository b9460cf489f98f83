// src/patterns.rs

//! Multi-part archive naming conventions.
//!
//! Recognized forms, first match wins (case-insensitive):
//!
//! 1. `name.part<N>.rar`
//! 2. `name.part<N>of<M>.rar`
//! 3. `name.<NNN>.rar`
//! 4. `name.r<NN>`
//!
//! Part numbers compare as integers; the digit width is kept separately so
//! missing parts can be rendered the way the uploader numbered them.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// Result of matching one filename against the part conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartMatch {
    pub base_name: String,
    pub part: u32,
    /// Only the `partNofM` form carries a total.
    pub total: Option<u32>,
    /// Digits in the part number as written (`part007` is 3).
    pub width: usize,
}

const ARCHIVE_EXTENSIONS: [&str; 5] = [".rar", ".zip", ".7z", ".tar", ".gz"];

const OPTIONAL_INDICATORS: [&str; 6] = ["optional", "dlc", "language", "lang", "selective", "bonus"];

static PART_RAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(.+?)\.part(\d+)\.rar$").unwrap());
static PART_OF_RAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(.+?)\.part(\d+)of(\d+)\.rar$").unwrap());
static NUMERIC_RAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(.+?)\.(\d+)\.rar$").unwrap());
static CLASSIC_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(.+?)\.r(\d+)$").unwrap());

static BARE_PART_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.part(\d+)$").unwrap());

static FOLDER_ILLEGAL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"[<>:"/\\|?*]"#).unwrap());
static FOLDER_PART_ANYWHERE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.part\d+").unwrap());
static TRAILING_PART: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)[._]part\d+$").unwrap());
static TRAILING_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.r\d+$").unwrap());
static TRAILING_RAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.rar$").unwrap());
static SPLIT_EXTENSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.r\d+$").unwrap());

const UNICODE_DASHES: [char; 7] = [
    '\u{2010}', '\u{2011}', '\u{2012}', '\u{2013}', '\u{2014}', '\u{2015}', '\u{2212}',
];

/// True if the filename ends in a recognized archive extension.
pub fn is_archive_filename(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    ARCHIVE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// True for DLC, language packs and other selectively installed content.
pub fn is_optional_archive(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    OPTIONAL_INDICATORS.iter().any(|needle| lower.contains(needle))
}

/// Matches `filename` against the four part conventions.
pub fn parse_part_name(filename: &str) -> Option<PartMatch> {
    if let Some(caps) = PART_RAR.captures(filename) {
        return build_match(&caps[1], &caps[2], None);
    }
    if let Some(caps) = PART_OF_RAR.captures(filename) {
        let total: u32 = caps[3].parse().ok()?;
        return build_match(&caps[1], &caps[2], Some(total).filter(|t| *t > 0));
    }
    if let Some(caps) = NUMERIC_RAR.captures(filename) {
        return build_match(&caps[1], &caps[2], None);
    }
    if let Some(caps) = CLASSIC_SPLIT.captures(filename) {
        return build_match(&caps[1], &caps[2], None);
    }
    None
}

fn build_match(base: &str, digits: &str, total: Option<u32>) -> Option<PartMatch> {
    Some(PartMatch {
        base_name: base.to_string(),
        part: digits.parse().ok()?,
        total,
        width: digits.len(),
    })
}

/// Part number of a file found on disk. Also accepts a bare `.part<N>` suffix.
pub fn part_number(filename: &str) -> Option<u32> {
    if let Some(found) = parse_part_name(filename) {
        return Some(found.part);
    }
    BARE_PART_SUFFIX
        .captures(filename)
        .and_then(|caps| caps[1].parse().ok())
}

/// Destination folder name for a base name: part numbering, split and `.rar`
/// suffixes, and characters that are illegal in folder names are removed.
pub fn clean_folder_name(name: &str) -> String {
    let name = FOLDER_ILLEGAL.replace_all(name, "");
    let name = FOLDER_PART_ANYWHERE.replace_all(&name, "");
    let name = TRAILING_PART.replace(&name, "");
    let name = TRAILING_SPLIT.replace(&name, "");
    let name = TRAILING_RAR.replace(&name, "");
    name.trim().to_string()
}

/// Base name used to cluster files found on disk. Names following one of the
/// part conventions use that base name; anything else drops its last
/// extension and then any part or split suffix.
pub fn scan_base_name(filename: &str) -> String {
    if let Some(found) = parse_part_name(filename) {
        return found.base_name;
    }
    let stem = Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| filename.to_string());
    let name = TRAILING_PART.replace(&stem, "");
    let name = TRAILING_SPLIT.replace(&name, "");
    let name = TRAILING_RAR.replace(&name, "");
    name.trim().to_string()
}

/// True for files the folder scanner should consider.
pub fn is_scan_candidate(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    lower.ends_with(".rar")
        || lower.ends_with(".zip")
        || lower.ends_with(".7z")
        || SPLIT_EXTENSION.is_match(&lower)
        || lower.contains("part")
}

/// Replaces unicode dash variants with an ASCII double dash so names written
/// by different tools compare equal.
pub fn normalize_dashes(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if UNICODE_DASHES.contains(&ch) {
            out.push_str("--");
        } else {
            out.push(ch);
        }
    }
    out
}

/// Renders a part label with the zero padding used in the filenames (`part007`).
pub fn part_label(part: u32, width: usize) -> String {
    format!("part{:0width$}", part, width = width.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_rar_ignores_padding_width() {
        for name in ["game.part7.rar", "game.part07.rar", "game.part007.rar", "GAME.PART0007.RAR"] {
            let found = parse_part_name(name).unwrap();
            assert_eq!(found.part, 7, "{name}");
            assert_eq!(found.total, None);
        }
        assert_eq!(parse_part_name("game.part007.rar").unwrap().width, 3);
    }

    #[test]
    fn part_of_form_carries_total() {
        let found = parse_part_name("Movie.part2of5.rar").unwrap();
        assert_eq!(found.base_name, "Movie");
        assert_eq!((found.part, found.total), (2, Some(5)));
    }

    #[test]
    fn numeric_and_classic_split_forms() {
        let numeric = parse_part_name("some.file.003.rar").unwrap();
        assert_eq!((numeric.base_name.as_str(), numeric.part), ("some.file", 3));

        let classic = parse_part_name("old.r12").unwrap();
        assert_eq!((classic.base_name.as_str(), classic.part, classic.total), ("old", 12, None));
    }

    #[test]
    fn dotted_base_names_are_kept_whole() {
        let found = parse_part_name("Some.Game.v1.2.part01.rar").unwrap();
        assert_eq!(found.base_name, "Some.Game.v1.2");
    }

    #[test]
    fn plain_archives_do_not_match() {
        assert_eq!(parse_part_name("setup.rar"), None);
        assert_eq!(parse_part_name("readme.txt"), None);
        assert_eq!(parse_part_name("bundle.zip"), None);
    }

    #[test]
    fn archive_extension_filter() {
        assert!(is_archive_filename("a.RAR"));
        assert!(is_archive_filename("a.tar.gz"));
        assert!(is_archive_filename("a.7z"));
        assert!(!is_archive_filename("a.r01"));
        assert!(!is_archive_filename("a.exe"));
    }

    #[test]
    fn optional_indicators() {
        assert!(is_optional_archive("fg-optional-bonus-content.part1.rar"));
        assert!(is_optional_archive("Game_DLC.part01.rar"));
        assert!(is_optional_archive("selective-english.rar"));
        assert!(!is_optional_archive("game.part01.rar"));
    }

    #[test]
    fn clean_folder_name_strips_numbering() {
        assert_eq!(clean_folder_name("Cyberpunk.part001"), "Cyberpunk");
        assert_eq!(clean_folder_name("old.r05"), "old");
        assert_eq!(clean_folder_name("single.rar"), "single");
        assert_eq!(clean_folder_name("What: Now?"), "What Now");
    }

    #[test]
    fn scan_base_name_clusters_parts() {
        assert_eq!(scan_base_name("game.part01.rar"), "game");
        assert_eq!(scan_base_name("game_part2.rar"), "game");
        assert_eq!(scan_base_name("game.r01"), "game");
        assert_eq!(scan_base_name("game.rar"), "game");
        assert_eq!(scan_base_name("tools.zip"), "tools");
        assert_eq!(scan_base_name("movie.part1of2.rar"), "movie");
        assert_eq!(scan_base_name("video.001.rar"), "video");
        assert_eq!(scan_base_name("video.002.rar"), "video");
    }

    #[test]
    fn scan_candidates() {
        assert!(is_scan_candidate("game.r03"));
        assert!(is_scan_candidate("x.7z"));
        assert!(is_scan_candidate("movie.part5"));
        assert!(!is_scan_candidate("notes.txt"));
    }

    #[test]
    fn part_number_falls_back_to_bare_suffix() {
        assert_eq!(part_number("a.part03.rar"), Some(3));
        assert_eq!(part_number("a.part4"), Some(4));
        assert_eq!(part_number("a.rar"), None);
    }

    #[test]
    fn dashes_normalize_to_double_hyphen() {
        assert_eq!(normalize_dashes("Game \u{2013} Deluxe"), "Game -- Deluxe");
        assert_eq!(normalize_dashes("Game -- Deluxe"), "Game -- Deluxe");
    }

    #[test]
    fn part_label_pads() {
        assert_eq!(part_label(7, 3), "part007");
        assert_eq!(part_label(12, 1), "part12");
    }
}
