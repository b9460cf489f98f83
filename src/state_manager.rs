// src/state_manager.rs

use crate::aggregator::{apply_remote_listing, rebuild_from_import};
use crate::config::Settings;
use crate::models::{GroupStatus, Readiness, TrackingDocument};
use crate::retention;
use crate::status;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything persisted in the tracking file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreFile {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub url_tracking: TrackingDocument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub groups: usize,
    pub swept: Vec<String>,
}

/// Owns the tracking file. Every mutation reads the whole file, applies the
/// change and writes the whole file back; mutations are serialized through
/// one lock so concurrent callers cannot lose each other's updates.
#[derive(Debug, Clone)]
pub struct TrackingStore {
    path: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl TrackingStore {
    /// The file does not need to exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the file. Missing, unreadable or corrupt files yield an empty document.
    pub async fn load(&self) -> StoreFile {
        let bytes = match tokio::fs::read(self.path.as_ref()).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return StoreFile::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "tracking file unreadable, starting empty");
                return StoreFile::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "tracking file corrupt, starting empty");
                StoreFile::default()
            }
        }
    }

    /// Writes the whole file through a temporary sibling and a rename.
    async fn save(&self, file: &StoreFile) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(file)?;
        let path = self.path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| io_error(parent, e))?;
        }
        let temp = path.with_extension("json.tmp");
        tokio::fs::write(&temp, &data).await.map_err(|e| io_error(&temp, e))?;
        tokio::fs::rename(&temp, path).await.map_err(|e| io_error(path, e))?;
        debug!(path = %path.display(), bytes = data.len(), "tracking file saved");
        Ok(())
    }

    /// Read-modify-write of the whole file under the store lock.
    pub async fn update<T>(&self, apply: impl FnOnce(&mut StoreFile) -> T) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load().await;
        let result = apply(&mut file);
        self.save(&file).await?;
        Ok(result)
    }

    pub async fn snapshot(&self) -> TrackingDocument {
        self.load().await.url_tracking
    }

    pub async fn settings(&self) -> Settings {
        self.load().await.settings
    }

    pub async fn save_settings(&self, settings: Settings) -> Result<(), StoreError> {
        self.update(|file| file.settings = settings).await
    }

    /// Replaces all tracking data with a new batch of URLs, regroups them and
    /// then runs the retention sweep.
    pub async fn import_urls(
        &self,
        urls: &[String],
        url_to_filename: Option<&HashMap<String, String>>,
    ) -> Result<ImportSummary, StoreError> {
        let now = Utc::now();
        let (imported, groups) = self
            .update(|file| {
                rebuild_from_import(&mut file.url_tracking, urls, url_to_filename, now);
                (file.url_tracking.imported_urls.len(), file.url_tracking.archive_groups.len())
            })
            .await?;
        info!(imported, groups, "imported url batch");

        let swept = self.sweep_retention().await?;
        Ok(ImportSummary { imported, groups, swept })
    }

    /// Drops old, fully extracted groups using the stored settings. Folders
    /// are checked on a blocking thread before the store lock is taken.
    pub async fn sweep_retention(&self) -> Result<Vec<String>, StoreError> {
        let StoreFile { settings, url_tracking } = self.load().await;
        let download_dir = settings.download_directory.clone();
        let extracted =
            match tokio::task::spawn_blocking(move || retention::extracted_groups(&url_tracking, &download_dir)).await {
                Ok(extracted) => extracted,
                Err(e) => {
                    warn!(error = %e, "folder check failed, skipping cleanup");
                    return Ok(Vec::new());
                }
            };
        if extracted.is_empty() {
            debug!("no extracted groups to consider for cleanup");
            return Ok(Vec::new());
        }

        let max_age = settings.retention();
        let removed = self
            .update(|file| retention::sweep_extracted(&mut file.url_tracking, &extracted, max_age, Utc::now()))
            .await?;
        if removed.is_empty() {
            debug!("no old groups to clean up");
        } else {
            info!(count = removed.len(), "cleaned up old archive groups");
        }
        Ok(removed)
    }

    /// Marks one imported URL as downloaded. Unknown URLs are ignored.
    pub async fn add_downloaded_url(&self, url: &str) -> Result<bool, StoreError> {
        Ok(self.mark_downloaded(std::iter::once(url)).await? == 1)
    }

    /// Marks several imported URLs as downloaded, returning how many were new.
    pub async fn mark_downloaded<'a>(
        &self,
        urls: impl IntoIterator<Item = &'a str>,
    ) -> Result<usize, StoreError> {
        let urls: Vec<&str> = urls.into_iter().collect();
        self.update(|file| {
            let doc = &mut file.url_tracking;
            let mut added = 0;
            for url in urls {
                if !doc.is_imported(url) {
                    warn!(%url, "download reported for a url that was never imported");
                    continue;
                }
                if doc.downloaded_urls.insert(url.to_string()) {
                    added += 1;
                }
            }
            added
        })
        .await
    }

    pub async fn record_remote_listing(&self, links: &[(String, String)]) -> Result<(), StoreError> {
        self.update(|file| apply_remote_listing(&mut file.url_tracking, links))
            .await
    }

    pub async fn remove_group(&self, key: &str) -> Result<bool, StoreError> {
        self.update(|file| file.url_tracking.archive_groups.remove(key).is_some())
            .await
    }

    pub async fn group_statuses(&self) -> BTreeMap<String, GroupStatus> {
        status::evaluate(&self.snapshot().await)
    }

    pub async fn can_extract(&self, key: &str) -> Readiness {
        status::can_extract(&self.snapshot().await, key)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io { path: path.to_path_buf(), source }
}
