// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// User settings, stored under the `settings` key of the tracking file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where parts are downloaded to and where groups are extracted.
    pub download_directory: PathBuf,
    /// External unpacking tool. Detected on first use when unset.
    pub unpack_tool: Option<PathBuf>,
    pub password: Option<String>,
    /// Age after which finished, extracted groups are dropped from tracking.
    pub retention_days: u32,
    pub delete_after_extract: bool,
    /// Scanner only queues groups known to the tracking store.
    pub json_only: bool,
    /// Compare the extracted folder size with the archive size after the tool exits.
    pub verify_extraction_size: bool,
    pub size_tolerance: SizeTolerance,
    pub poll_interval_ms: u64,
    /// Pause between one group finishing and the next being picked up.
    pub advance_delay_ms: u64,
    pub scan_interval_secs: u64,
    pub stop_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_directory: PathBuf::from("downloads"),
            unpack_tool: None,
            password: None,
            retention_days: 3,
            delete_after_extract: false,
            json_only: true,
            verify_extraction_size: false,
            size_tolerance: SizeTolerance::default(),
            poll_interval_ms: 1000,
            advance_delay_ms: 1000,
            scan_interval_secs: 30,
            stop_timeout_ms: 5000,
        }
    }
}

impl Settings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn advance_delay(&self) -> Duration {
        Duration::from_millis(self.advance_delay_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Folder a group is extracted into.
    pub fn destination_for(&self, base_name: &str) -> PathBuf {
        self.download_directory
            .join(crate::patterns::clean_folder_name(base_name))
    }

    /// Configured tool, or the first one found on this machine.
    pub fn resolve_unpack_tool(&self) -> Option<PathBuf> {
        self.unpack_tool.clone().or_else(detect_unpack_tool)
    }
}

/// How far the extracted size may drift from the summed archive size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SizeTolerance {
    Flat { bytes: u64 },
    /// `max(min_bytes, ratio * archive_size)`
    Proportional { min_bytes: u64, ratio: f64 },
}

impl Default for SizeTolerance {
    fn default() -> Self {
        SizeTolerance::Proportional { min_bytes: 100 * MIB, ratio: 0.10 }
    }
}

impl SizeTolerance {
    /// The stricter flat band.
    pub fn strict() -> Self {
        SizeTolerance::Flat { bytes: 20 * MIB }
    }

    pub fn allowance(&self, archive_size: u64) -> u64 {
        match *self {
            SizeTolerance::Flat { bytes } => bytes,
            SizeTolerance::Proportional { min_bytes, ratio } => {
                min_bytes.max((archive_size as f64 * ratio) as u64)
            }
        }
    }

    pub fn accepts(&self, archive_size: u64, extracted_size: u64) -> bool {
        archive_size.abs_diff(extracted_size) <= self.allowance(archive_size)
    }
}

const TOOL_NAMES: [&str; 4] = ["rar", "unrar", "WinRAR", "UnRAR"];

const WINDOWS_TOOL_PATHS: [&str; 3] = [
    r"C:\Program Files\WinRAR\WinRAR.exe",
    r"C:\Program Files (x86)\WinRAR\WinRAR.exe",
    r"C:\WinRAR\WinRAR.exe",
];

/// Looks for an unpacking tool on `PATH`, then in the usual install folders.
pub fn detect_unpack_tool() -> Option<PathBuf> {
    TOOL_NAMES
        .iter()
        .find_map(|name| which::which(name).ok())
        .or_else(|| {
            WINDOWS_TOOL_PATHS
                .iter()
                .map(Path::new)
                .find(|path| path.exists())
                .map(Path::to_path_buf)
        })
}
