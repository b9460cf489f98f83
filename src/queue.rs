// src/queue.rs

use crate::config::Settings;
use crate::models::GroupStatus;
use crate::state_manager::TrackingStore;
use crate::status::{evaluate, readiness_of};
use crate::tool::{UnpackProcess, UnpackRequest, UnpackTool};
use crate::verify::{self, DeletionReport, SizeCheck};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One tool run plus one retry.
pub const MAX_ATTEMPTS: u32 = 2;

/// Where a job came from; decides what happens to tracking after cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum JobOrigin {
    Tracked,
    Scanned { tracked_key: Option<String> },
}

/// Everything a worker needs to extract one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionJob {
    pub key: String,
    pub name: String,
    /// The lowest-numbered part; the tool finds the other volumes itself.
    pub archive: PathBuf,
    pub parts: Vec<PathBuf>,
    pub destination: PathBuf,
    pub password: Option<String>,
    pub verify_size: bool,
    pub is_optional: bool,
    pub origin: JobOrigin,
}

impl ExtractionJob {
    /// Job for a tracked group, with parts expected in the download directory.
    pub fn for_tracked_group(settings: &Settings, status: &GroupStatus) -> Option<Self> {
        let (_, first) = status.record.first_part()?;
        let dir = &settings.download_directory;
        Some(Self {
            key: status.key.clone(),
            name: status.record.base_name.clone(),
            archive: dir.join(first),
            parts: status.record.filenames.values().map(|name| dir.join(name)).collect(),
            destination: settings.destination_for(&status.record.base_name),
            password: settings.password.clone(),
            verify_size: settings.verify_extraction_size,
            is_optional: status.record.is_optional,
            origin: JobOrigin::Tracked,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GroupOutcome {
    Extracted {
        attempts: u32,
        deleted: Option<DeletionSummary>,
    },
    Failed {
        reason: String,
    },
}

impl GroupOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, GroupOutcome::Extracted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionSummary {
    pub deleted: usize,
    pub failed: usize,
}

impl From<&DeletionReport> for DeletionSummary {
    fn from(report: &DeletionReport) -> Self {
        Self { deleted: report.deleted, failed: report.failed.len() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueuePhase {
    Idle,
    Extracting,
    Done,
    Stopped,
}

/// Progress and log lines for whoever displays the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QueueEvent {
    Queued { key: String, name: String },
    Skipped { key: String, name: String, reason: String },
    Started { key: String, name: String, remaining: usize },
    Attempt { key: String, attempt: u32 },
    Finished { key: String, name: String, outcome: GroupOutcome },
    Progress { percent: u8 },
    Done { extracted: usize, failed: usize },
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub extracted: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub stopped: bool,
}

struct Completion {
    job: ExtractionJob,
    outcome: GroupOutcome,
}

enum WorkerMessage {
    Finished(Completion),
    Stopped,
}

type ProcessSlot = Arc<std::sync::Mutex<Option<Box<dyn UnpackProcess>>>>;

struct ActiveJob {
    key: String,
    cancel: CancellationToken,
    process: ProcessSlot,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ExtractionJob>,
    is_extracting: bool,
    active: Option<ActiveJob>,
    extracted: BTreeSet<String>,
    failed: BTreeSet<String>,
    stopped: bool,
    run_total: usize,
    run_outcomes: Vec<(String, GroupOutcome)>,
}

impl QueueState {
    fn knows(&self, key: &str) -> bool {
        self.pending.iter().any(|job| job.key == key)
            || self.active.as_ref().is_some_and(|active| active.key == key)
    }

    fn progress_percent(&self) -> u8 {
        if self.run_total == 0 {
            return 0;
        }
        ((self.run_outcomes.len() * 100) / self.run_total).min(100) as u8
    }

    fn summary(&self) -> QueueSummary {
        let mut summary = QueueSummary { stopped: self.stopped, ..QueueSummary::default() };
        for (key, outcome) in &self.run_outcomes {
            match outcome {
                GroupOutcome::Extracted { .. } => summary.extracted.push(key.clone()),
                GroupOutcome::Failed { reason } => summary.failed.push((key.clone(), reason.clone())),
            }
        }
        summary
    }
}

/// Extracts queued groups strictly one at a time.
///
/// All queue state lives behind one lock and is only changed by the
/// controller's own methods; workers report back through a channel and
/// never touch the queue directly.
pub struct ExtractionQueue {
    store: TrackingStore,
    tool: Arc<dyn UnpackTool>,
    settings: Settings,
    state: Mutex<QueueState>,
    messages_tx: mpsc::UnboundedSender<WorkerMessage>,
    messages_rx: Mutex<mpsc::UnboundedReceiver<WorkerMessage>>,
    events: broadcast::Sender<QueueEvent>,
}

impl ExtractionQueue {
    pub fn new(store: TrackingStore, tool: Arc<dyn UnpackTool>, settings: Settings) -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            tool,
            settings,
            state: Mutex::new(QueueState::default()),
            messages_tx,
            messages_rx: Mutex::new(messages_rx),
            events,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn phase(&self) -> QueuePhase {
        let state = self.state.lock().await;
        if state.stopped {
            QueuePhase::Stopped
        } else if state.is_extracting {
            QueuePhase::Extracting
        } else if state.pending.is_empty() && !state.run_outcomes.is_empty() {
            QueuePhase::Done
        } else {
            QueuePhase::Idle
        }
    }

    pub async fn is_extracting(&self) -> bool {
        self.state.lock().await.is_extracting
    }

    pub async fn pending_keys(&self) -> Vec<String> {
        self.state.lock().await.pending.iter().map(|job| job.key.clone()).collect()
    }

    pub async fn extracted(&self) -> BTreeSet<String> {
        self.state.lock().await.extracted.clone()
    }

    pub async fn failed(&self) -> BTreeSet<String> {
        self.state.lock().await.failed.clone()
    }

    pub async fn progress_percent(&self) -> u8 {
        self.state.lock().await.progress_percent()
    }

    /// Keys that should not be queued again this session.
    pub async fn processed_keys(&self) -> BTreeSet<String> {
        let state = self.state.lock().await;
        state.extracted.union(&state.failed).cloned().collect()
    }

    /// Makes a failed group eligible again. Failures are never retried otherwise.
    pub async fn forget_failure(&self, key: &str) -> bool {
        self.state.lock().await.failed.remove(key)
    }

    /// Rebuilds the pending queue from the tracking store: non-optional
    /// groups first, then by key. Groups already extracted or failed this
    /// session are skipped; groups that are not ready are reported and left
    /// for the next pass.
    pub async fn enqueue_extractable_groups(&self) -> usize {
        let doc = self.store.snapshot().await;
        let mut groups: Vec<GroupStatus> = evaluate(&doc).into_values().collect();
        groups.sort_by(|a, b| (a.record.is_optional, &a.key).cmp(&(b.record.is_optional, &b.key)));

        let mut state = self.state.lock().await;
        state.pending.clear();
        state.run_total = 0;
        state.run_outcomes.clear();

        for status in groups {
            let name = status.record.base_name.clone();
            if state.extracted.contains(&status.key) || state.failed.contains(&status.key) {
                debug!(group = %name, "already processed, skipping");
                continue;
            }
            if state.knows(&status.key) {
                continue;
            }
            let readiness = readiness_of(&status);
            if !readiness.ready {
                info!(group = %name, reason = %readiness.reason, "not ready");
                self.emit(QueueEvent::Skipped { key: status.key.clone(), name, reason: readiness.reason });
                continue;
            }
            let Some(job) = ExtractionJob::for_tracked_group(&self.settings, &status) else {
                let reason = "No filenames found for group".to_string();
                self.emit(QueueEvent::Skipped { key: status.key.clone(), name, reason });
                continue;
            };
            info!(group = %name, "queued for extraction");
            self.emit(QueueEvent::Queued { key: job.key.clone(), name });
            state.pending.push_back(job);
            state.run_total += 1;
        }

        info!(queued = state.pending.len(), "queue populated");
        state.pending.len()
    }

    /// Appends a job unless it is already pending, running or processed.
    pub async fn enqueue(&self, job: ExtractionJob) -> bool {
        let mut state = self.state.lock().await;
        if state.knows(&job.key) || state.extracted.contains(&job.key) || state.failed.contains(&job.key) {
            return false;
        }
        self.emit(QueueEvent::Queued { key: job.key.clone(), name: job.name.clone() });
        state.pending.push_back(job);
        state.run_total += 1;
        true
    }

    /// Starts the next job if nothing is running.
    pub async fn process_queue(&self) -> QueuePhase {
        let mut state = self.state.lock().await;
        if state.stopped {
            return QueuePhase::Stopped;
        }
        if state.is_extracting {
            debug!("already extracting, waiting");
            return QueuePhase::Extracting;
        }
        let Some(job) = state.pending.pop_front() else {
            let extracted = state.run_outcomes.iter().filter(|(_, o)| o.is_success()).count();
            let failed = state.run_outcomes.len() - extracted;
            info!(extracted, failed, "extraction queue completed");
            self.emit(QueueEvent::Done { extracted, failed });
            return QueuePhase::Done;
        };

        let cancel = CancellationToken::new();
        let process: ProcessSlot = Arc::new(std::sync::Mutex::new(None));
        state.is_extracting = true;
        state.active = Some(ActiveJob {
            key: job.key.clone(),
            cancel: cancel.clone(),
            process: process.clone(),
        });

        let remaining = state.pending.len();
        info!(group = %job.name, remaining, "starting extraction");
        self.emit(QueueEvent::Started { key: job.key.clone(), name: job.name.clone(), remaining });

        let worker = Worker {
            tool: self.tool.clone(),
            settings: self.settings.clone(),
            process,
            cancel,
            events: self.events.clone(),
        };
        let messages = self.messages_tx.clone();
        tokio::spawn(async move {
            if let Some(outcome) = worker.run(&job).await {
                let _ = messages.send(WorkerMessage::Finished(Completion { job, outcome }));
            }
        });

        QueuePhase::Extracting
    }

    async fn finish_group(&self, completion: Completion) {
        let Completion { job, outcome } = completion;

        let percent = {
            let mut state = self.state.lock().await;
            if !state.active.as_ref().is_some_and(|active| active.key == job.key) {
                // Stopped while this worker was finishing.
                return;
            }
            state.active = None;
            state.is_extracting = false;
            match &outcome {
                GroupOutcome::Extracted { .. } => state.extracted.insert(job.key.clone()),
                GroupOutcome::Failed { .. } => state.failed.insert(job.key.clone()),
            };
            state.run_outcomes.push((job.key.clone(), outcome.clone()));
            state.progress_percent()
        };

        match &outcome {
            GroupOutcome::Extracted { attempts, .. } => info!(group = %job.name, attempts, "extracted"),
            GroupOutcome::Failed { reason } => error!(group = %job.name, %reason, "extraction failed"),
        }

        if let (JobOrigin::Scanned { tracked_key: Some(key) }, GroupOutcome::Extracted { deleted: Some(d), .. }) =
            (&job.origin, &outcome)
        {
            if d.failed == 0 {
                match self.store.remove_group(key).await {
                    Ok(_) => debug!(%key, "tracking dropped after archive cleanup"),
                    Err(e) => warn!(%key, error = %e, "could not drop tracking after cleanup"),
                }
            }
        }

        self.emit(QueueEvent::Finished { key: job.key, name: job.name, outcome });
        self.emit(QueueEvent::Progress { percent });
    }

    /// Drives the queue until it is empty or stopped. Each worker completion
    /// is followed by exactly one `process_queue` call.
    pub async fn run(&self) -> QueueSummary {
        let mut messages = self.messages_rx.lock().await;
        loop {
            match self.process_queue().await {
                QueuePhase::Done | QueuePhase::Stopped | QueuePhase::Idle => break,
                QueuePhase::Extracting => {}
            }
            match messages.recv().await {
                Some(WorkerMessage::Finished(completion)) => {
                    self.finish_group(completion).await;
                    tokio::time::sleep(self.settings.advance_delay()).await;
                }
                Some(WorkerMessage::Stopped) | None => break,
            }
        }
        self.state.lock().await.summary()
    }

    /// Stops scheduling. The running tool process, if any, is left alone.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.halt(&mut state);
    }

    fn halt(&self, state: &mut QueueState) -> Option<ProcessSlot> {
        state.stopped = true;
        state.is_extracting = false;
        let active = state.active.take();
        if let Some(active) = &active {
            active.cancel.cancel();
        }
        let _ = self.messages_tx.send(WorkerMessage::Stopped);
        info!("extraction stopped");
        self.emit(QueueEvent::Stopped);
        active.map(|active| active.process)
    }

    /// Stops scheduling and asks the running tool to exit: terminate first,
    /// kill if it is still alive after the stop timeout.
    pub async fn stop_and_terminate(&self) {
        let slot = {
            let mut state = self.state.lock().await;
            self.halt(&mut state)
        };
        let Some(slot) = slot else { return };
        let Some(mut process) = slot.lock().ok().and_then(|mut guard| guard.take()) else {
            return;
        };

        if let Err(e) = process.terminate() {
            warn!(error = %e, "terminate request failed");
        }
        let deadline = tokio::time::Instant::now() + self.settings.stop_timeout();
        while tokio::time::Instant::now() < deadline {
            if matches!(process.try_wait(), Ok(Some(_))) {
                return;
            }
            tokio::time::sleep(self.settings.poll_interval().min(self.settings.stop_timeout())).await;
        }
        warn!("tool did not exit in time, killing");
        if let Err(e) = process.kill() {
            warn!(error = %e, "kill failed");
        }
    }

    /// Allows scheduling again after a stop.
    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        state.stopped = false;
        // Drain a stop marker left behind when no driver was running.
        if let Ok(mut messages) = self.messages_rx.try_lock() {
            while let Ok(message) = messages.try_recv() {
                if let WorkerMessage::Finished(completion) = message {
                    debug!(group = %completion.job.name, "dropping completion from before stop");
                }
            }
        }
    }
}

enum AttemptError {
    Cancelled,
    Failed(String),
}

struct Worker {
    tool: Arc<dyn UnpackTool>,
    settings: Settings,
    process: ProcessSlot,
    cancel: CancellationToken,
    events: broadcast::Sender<QueueEvent>,
}

impl Worker {
    /// `None` when cancelled; the queue has already moved on in that case.
    async fn run(&self, job: &ExtractionJob) -> Option<GroupOutcome> {
        let archive_size = {
            let parts = job.parts.clone();
            tokio::task::spawn_blocking(move || verify::archive_size(&parts))
                .await
                .unwrap_or(0)
        };

        let mut last_reason = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let _ = self.events.send(QueueEvent::Attempt { key: job.key.clone(), attempt });
            match self.attempt(job, archive_size).await {
                Ok(()) => {
                    let deleted = if self.settings.delete_after_extract {
                        Some(self.delete_parts(job).await)
                    } else {
                        None
                    };
                    return Some(GroupOutcome::Extracted { attempts: attempt, deleted });
                }
                Err(AttemptError::Cancelled) => return None,
                Err(AttemptError::Failed(reason)) => {
                    warn!(group = %job.name, attempt, %reason, "extraction attempt failed");
                    last_reason = reason;
                }
            }
        }
        Some(GroupOutcome::Failed { reason: last_reason })
    }

    async fn attempt(&self, job: &ExtractionJob, archive_size: u64) -> Result<(), AttemptError> {
        if !job.archive.exists() {
            let name = job.archive.file_name().unwrap_or(job.archive.as_os_str());
            return Err(AttemptError::Failed(format!("File not found: {}", name.to_string_lossy())));
        }
        tokio::fs::create_dir_all(&job.destination)
            .await
            .map_err(|e| AttemptError::Failed(format!("cannot create {}: {e}", job.destination.display())))?;

        let request = UnpackRequest {
            archive: job.archive.clone(),
            destination: job.destination.clone(),
            password: job.password.clone(),
        };
        let process = self
            .tool
            .spawn(&request)
            .map_err(|e| AttemptError::Failed(e.to_string()))?;
        debug!(group = %job.name, pid = ?process.id(), "tool started");
        self.store_process(process)?;

        let code = self.wait_for_exit().await?;
        if code != 0 {
            return Err(AttemptError::Failed(format!("tool exited with code {code}")));
        }

        if job.verify_size {
            let destination = job.destination.clone();
            let tolerance = self.settings.size_tolerance;
            let check = tokio::task::spawn_blocking(move || {
                verify::check_extracted_size(&destination, archive_size, &tolerance)
            })
            .await
            .map_err(|e| AttemptError::Failed(e.to_string()))?;
            if !check.passed() {
                return Err(AttemptError::Failed(describe_size_check(check)));
            }
        }
        Ok(())
    }

    fn store_process(&self, process: Box<dyn UnpackProcess>) -> Result<(), AttemptError> {
        let mut slot = self
            .process
            .lock()
            .map_err(|_| AttemptError::Failed("process slot poisoned".to_string()))?;
        *slot = Some(process);
        Ok(())
    }

    /// Polls the tool on a fixed tick until it exits.
    async fn wait_for_exit(&self) -> Result<i32, AttemptError> {
        loop {
            let polled = {
                let mut slot = self
                    .process
                    .lock()
                    .map_err(|_| AttemptError::Failed("process slot poisoned".to_string()))?;
                match slot.as_mut() {
                    // Taken by an explicit stop.
                    None => return Err(AttemptError::Cancelled),
                    Some(process) => process.try_wait(),
                }
            };
            match polled {
                Ok(Some(code)) => {
                    if let Ok(mut slot) = self.process.lock() {
                        slot.take();
                    }
                    return Ok(code);
                }
                Ok(None) => {}
                Err(e) => return Err(AttemptError::Failed(e.to_string())),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AttemptError::Cancelled),
                _ = tokio::time::sleep(self.settings.poll_interval()) => {}
            }
        }
    }

    async fn delete_parts(&self, job: &ExtractionJob) -> DeletionSummary {
        let parts = job.parts.clone();
        match tokio::task::spawn_blocking(move || verify::delete_archives(&parts)).await {
            Ok(report) => DeletionSummary::from(&report),
            Err(e) => {
                warn!(group = %job.name, error = %e, "archive cleanup task failed");
                DeletionSummary { deleted: 0, failed: job.parts.len() }
            }
        }
    }
}

fn describe_size_check(check: SizeCheck) -> String {
    match check {
        SizeCheck::Passed { .. } => "size verified".to_string(),
        SizeCheck::MissingFolder => "extraction folder not found".to_string(),
        SizeCheck::EmptyFolder => "extracted folder is empty".to_string(),
        SizeCheck::Mismatch { extracted, archive, allowance } => format!(
            "size mismatch: extracted {extracted} bytes vs archive {archive} bytes (allowed {allowance})"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Exits with the scripted codes in order, after `polls` polls each;
    /// writes `payload` bytes into the destination on success.
    struct ScriptedTool {
        codes: std::sync::Mutex<VecDeque<i32>>,
        polls: usize,
        payload: usize,
        running: Arc<AtomicUsize>,
        max_running: Arc<AtomicUsize>,
        terminated: Arc<AtomicUsize>,
        spawned: std::sync::Mutex<Vec<PathBuf>>,
    }

    impl ScriptedTool {
        fn new(codes: &[i32]) -> Self {
            Self {
                codes: std::sync::Mutex::new(codes.iter().copied().collect()),
                polls: 2,
                payload: 16,
                running: Arc::new(AtomicUsize::new(0)),
                max_running: Arc::new(AtomicUsize::new(0)),
                terminated: Arc::new(AtomicUsize::new(0)),
                spawned: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    struct ScriptedProcess {
        code: i32,
        polls_left: usize,
        destination: PathBuf,
        payload: usize,
        running: Arc<AtomicUsize>,
        terminated: Arc<AtomicUsize>,
        done: bool,
    }

    impl UnpackTool for ScriptedTool {
        fn spawn(&self, request: &UnpackRequest) -> Result<Box<dyn UnpackProcess>, ToolError> {
            let code = self.codes.lock().unwrap().pop_front().unwrap_or(0);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.spawned.lock().unwrap().push(request.archive.clone());
            Ok(Box::new(ScriptedProcess {
                code,
                polls_left: self.polls,
                destination: request.destination.clone(),
                payload: self.payload,
                running: self.running.clone(),
                terminated: self.terminated.clone(),
                done: false,
            }))
        }
    }

    impl UnpackProcess for ScriptedProcess {
        fn id(&self) -> Option<u32> {
            Some(1)
        }

        fn try_wait(&mut self) -> Result<Option<i32>, ToolError> {
            if self.done {
                return Ok(Some(self.code));
            }
            if self.polls_left > 0 {
                self.polls_left -= 1;
                return Ok(None);
            }
            if self.code == 0 {
                std::fs::write(self.destination.join("content.bin"), vec![1u8; self.payload])?;
            }
            self.done = true;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(self.code))
        }

        fn terminate(&mut self) -> Result<(), ToolError> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn kill(&mut self) -> Result<(), ToolError> {
            Ok(())
        }
    }

    fn fast_settings(dir: &TempDir) -> Settings {
        Settings {
            download_directory: dir.path().to_path_buf(),
            poll_interval_ms: 1,
            advance_delay_ms: 0,
            ..Settings::default()
        }
    }

    async fn tracked_store(dir: &TempDir, groups: &[(&str, usize)]) -> TrackingStore {
        let store = TrackingStore::new(dir.path().join("config.json"));
        let mut urls = Vec::new();
        for (base, parts) in groups {
            for part in 1..=*parts {
                let name = format!("{base}.part{part}.rar");
                std::fs::write(dir.path().join(&name), vec![0u8; 16]).unwrap();
                urls.push(format!("http://x/{name}"));
            }
        }
        store.import_urls(&urls, None).await.unwrap();
        store.mark_downloaded(urls.iter().map(String::as_str)).await.unwrap();
        store
    }

    #[tokio::test]
    async fn optional_groups_queue_last() {
        let dir = TempDir::new().unwrap();
        let store = tracked_store(&dir, &[("b-dlc", 1), ("a-bonus", 1), ("main", 2), ("zeta", 1)]).await;
        let queue = ExtractionQueue::new(store, Arc::new(ScriptedTool::new(&[])), fast_settings(&dir));

        assert_eq!(queue.enqueue_extractable_groups().await, 4);
        assert_eq!(
            queue.pending_keys().await,
            vec!["main_group", "zeta_group", "a-bonus_group", "b-dlc_group"]
        );
    }

    #[tokio::test]
    async fn not_ready_groups_are_left_out() {
        let dir = TempDir::new().unwrap();
        let store = tracked_store(&dir, &[("ready", 1)]).await;
        let urls = vec!["http://x/ready.part1.rar".to_string(), "http://x/waiting.part1.rar".to_string()];
        store.import_urls(&urls, None).await.unwrap();
        store.add_downloaded_url(&urls[0]).await.unwrap();

        let queue = ExtractionQueue::new(store, Arc::new(ScriptedTool::new(&[])), fast_settings(&dir));
        let mut events = queue.subscribe();
        assert_eq!(queue.enqueue_extractable_groups().await, 1);

        let mut skipped = None;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Skipped { key, reason, .. } = event {
                skipped = Some((key, reason));
            }
        }
        assert_eq!(skipped, Some(("waiting_group".to_string(), "No parts downloaded".to_string())));
    }

    #[tokio::test]
    async fn runs_groups_one_at_a_time() {
        let dir = TempDir::new().unwrap();
        let store = tracked_store(&dir, &[("a", 2), ("b", 1), ("c", 3)]).await;
        let tool = Arc::new(ScriptedTool::new(&[0, 0, 0]));
        let max_running = tool.max_running.clone();
        let queue = ExtractionQueue::new(store, tool.clone(), fast_settings(&dir));

        queue.enqueue_extractable_groups().await;
        let summary = queue.run().await;

        assert_eq!(summary.extracted, vec!["a_group", "b_group", "c_group"]);
        assert!(summary.failed.is_empty());
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert!(!queue.is_extracting().await);
        assert_eq!(queue.phase().await, QueuePhase::Done);
        assert_eq!(queue.progress_percent().await, 100);

        let spawned = tool.spawned.lock().unwrap().clone();
        assert_eq!(spawned[0], dir.path().join("a.part1.rar"));
        assert!(dir.path().join("c").join("content.bin").exists());
    }

    #[tokio::test]
    async fn failure_does_not_stop_the_queue() {
        let dir = TempDir::new().unwrap();
        let store = tracked_store(&dir, &[("a", 1), ("b", 1)]).await;
        let tool = Arc::new(ScriptedTool::new(&[2, 2, 0]));
        let queue = ExtractionQueue::new(store, tool, fast_settings(&dir));

        queue.enqueue_extractable_groups().await;
        let summary = queue.run().await;

        assert_eq!(summary.extracted, vec!["b_group"]);
        assert_eq!(summary.failed, vec![("a_group".to_string(), "tool exited with code 2".to_string())]);
        assert!(queue.failed().await.contains("a_group"));

        // failed groups stay out until explicitly forgotten
        assert_eq!(queue.enqueue_extractable_groups().await, 0);
        assert!(queue.forget_failure("a_group").await);
        assert_eq!(queue.enqueue_extractable_groups().await, 1);
    }

    #[tokio::test]
    async fn missing_first_part_fails_the_group() {
        let dir = TempDir::new().unwrap();
        let store = tracked_store(&dir, &[("gone", 2)]).await;
        std::fs::remove_file(dir.path().join("gone.part1.rar")).unwrap();
        let queue = ExtractionQueue::new(store, Arc::new(ScriptedTool::new(&[])), fast_settings(&dir));

        queue.enqueue_extractable_groups().await;
        let summary = queue.run().await;
        assert_eq!(summary.failed, vec![("gone_group".to_string(), "File not found: gone.part1.rar".to_string())]);
    }

    #[tokio::test]
    async fn size_mismatch_retries_once_then_fails() {
        let dir = TempDir::new().unwrap();
        let store = tracked_store(&dir, &[("big", 1)]).await;
        let mut tool = ScriptedTool::new(&[0, 0]);
        tool.payload = 1;
        let settings = Settings {
            verify_extraction_size: true,
            size_tolerance: crate::config::SizeTolerance::Flat { bytes: 2 },
            ..fast_settings(&dir)
        };
        let tool = Arc::new(tool);
        let queue = ExtractionQueue::new(store, tool.clone(), settings);

        queue.enqueue_extractable_groups().await;
        let summary = queue.run().await;

        assert_eq!(tool.spawned.lock().unwrap().len(), 2);
        assert_eq!(summary.failed.len(), 1);
        assert!(summary.failed[0].1.starts_with("size mismatch"));
    }

    #[tokio::test]
    async fn delete_after_extract_removes_parts() {
        let dir = TempDir::new().unwrap();
        let store = tracked_store(&dir, &[("g", 3)]).await;
        let settings = Settings { delete_after_extract: true, ..fast_settings(&dir) };
        let queue = ExtractionQueue::new(store, Arc::new(ScriptedTool::new(&[0])), settings);
        let mut events = queue.subscribe();

        queue.enqueue_extractable_groups().await;
        queue.run().await;

        for part in 1..=3 {
            assert!(!dir.path().join(format!("g.part{part}.rar")).exists());
        }
        let mut deleted = None;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Finished { outcome: GroupOutcome::Extracted { deleted: d, .. }, .. } = event {
                deleted = d;
            }
        }
        assert_eq!(deleted, Some(DeletionSummary { deleted: 3, failed: 0 }));
    }

    #[tokio::test]
    async fn empty_queue_is_done() {
        let dir = TempDir::new().unwrap();
        let store = TrackingStore::new(dir.path().join("config.json"));
        let queue = ExtractionQueue::new(store, Arc::new(ScriptedTool::new(&[])), fast_settings(&dir));
        assert_eq!(queue.process_queue().await, QueuePhase::Done);
        assert_eq!(queue.run().await, QueueSummary::default());
    }

    #[tokio::test]
    async fn stop_halts_scheduling() {
        let dir = TempDir::new().unwrap();
        let store = tracked_store(&dir, &[("a", 1), ("b", 1)]).await;
        let mut tool = ScriptedTool::new(&[0, 0]);
        tool.polls = usize::MAX;
        let settings = Settings { stop_timeout_ms: 20, ..fast_settings(&dir) };
        let queue = Arc::new(ExtractionQueue::new(store, Arc::new(tool), settings));
        queue.enqueue_extractable_groups().await;

        let driver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run().await })
        };
        while !queue.is_extracting().await {
            tokio::task::yield_now().await;
        }
        queue.stop_and_terminate().await;

        let summary = driver.await.unwrap();
        assert!(summary.stopped);
        assert!(summary.extracted.is_empty());
        assert!(!queue.is_extracting().await);
        assert_eq!(queue.pending_keys().await, vec!["b_group"]);
        assert_eq!(queue.process_queue().await, QueuePhase::Stopped);
    }

    #[tokio::test]
    async fn plain_stop_leaves_the_tool_alone_and_resume_continues() {
        let dir = TempDir::new().unwrap();
        let store = tracked_store(&dir, &[("a", 1), ("b", 1)]).await;
        let tool = Arc::new(ScriptedTool::new(&[]));
        let terminated = tool.terminated.clone();
        let queue = ExtractionQueue::new(store, tool.clone(), fast_settings(&dir));
        assert_eq!(queue.enqueue_extractable_groups().await, 2);

        assert_eq!(queue.process_queue().await, QueuePhase::Extracting);
        queue.stop().await;
        assert_eq!(queue.phase().await, QueuePhase::Stopped);
        assert_eq!(queue.process_queue().await, QueuePhase::Stopped);
        assert_eq!(queue.pending_keys().await, vec!["b_group"]);

        queue.resume().await;
        let summary = queue.run().await;
        assert!(!summary.stopped);
        assert_eq!(summary.extracted, vec!["b_group"]);
        assert!(!queue.extracted().await.contains("a_group"));
        assert_eq!(terminated.load(Ordering::SeqCst), 0);
        assert_eq!(queue.phase().await, QueuePhase::Done);
    }
}
