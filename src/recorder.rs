// src/recorder.rs

use crate::state_manager::TrackingStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events a downloader reports about individual URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Started { url: String },
    Completed { url: String },
    Stopped { url: String, reason: Option<String> },
}

/// Observer interface a download host calls into. Implementations must not block.
pub trait DownloadObserver: Send + Sync {
    fn on_download_started(&self, url: &str);
    fn on_download_completed(&self, url: &str);
    fn on_download_stopped(&self, url: &str, reason: Option<&str>);
}

/// Forwards download events to a single task that owns all store writes
/// caused by downloads.
#[derive(Debug, Clone)]
pub struct DownloadRecorder {
    sender: mpsc::UnboundedSender<DownloadEvent>,
}

impl DownloadRecorder {
    /// Spawns the writer task. It ends once every recorder clone is dropped.
    pub fn spawn(store: TrackingStore) -> (Self, JoinHandle<usize>) {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut recorded = 0;
            while let Some(event) = receiver.recv().await {
                match event {
                    DownloadEvent::Started { url } => debug!(%url, "download started"),
                    DownloadEvent::Stopped { url, reason } => {
                        info!(%url, reason = reason.as_deref().unwrap_or("none"), "download stopped")
                    }
                    DownloadEvent::Completed { url } => match store.add_downloaded_url(&url).await {
                        Ok(true) => recorded += 1,
                        Ok(false) => debug!(%url, "completion already recorded or not tracked"),
                        Err(e) => warn!(%url, error = %e, "failed to record download"),
                    },
                }
            }
            recorded
        });
        (Self { sender }, handle)
    }

    pub fn send(&self, event: DownloadEvent) {
        if self.sender.send(event).is_err() {
            warn!("download recorder task is gone, event dropped");
        }
    }
}

impl DownloadObserver for DownloadRecorder {
    fn on_download_started(&self, url: &str) {
        self.send(DownloadEvent::Started { url: url.to_string() });
    }

    fn on_download_completed(&self, url: &str) {
        self.send(DownloadEvent::Completed { url: url.to_string() });
    }

    fn on_download_stopped(&self, url: &str, reason: Option<&str>) {
        self.send(DownloadEvent::Stopped {
            url: url.to_string(),
            reason: reason.map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn completions_are_written_in_order() {
        let dir = TempDir::new().unwrap();
        let store = TrackingStore::new(dir.path().join("config.json"));
        let urls = vec!["http://x/g.part1.rar".to_string(), "http://x/g.part2.rar".to_string()];
        store.import_urls(&urls, None).await.unwrap();

        let (recorder, handle) = DownloadRecorder::spawn(store.clone());
        recorder.on_download_started(&urls[0]);
        recorder.on_download_completed(&urls[0]);
        recorder.on_download_stopped(&urls[1], Some("network"));
        recorder.on_download_completed(&urls[1]);
        recorder.on_download_completed("http://x/unknown.rar");
        drop(recorder);

        assert_eq!(handle.await.unwrap(), 2);
        let statuses = store.group_statuses().await;
        assert_eq!(statuses["g_group"].completion_percentage, 100.0);
    }
}
