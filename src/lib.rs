pub mod aggregator;
pub mod config;
pub mod models;
pub mod patterns;
pub mod queue;
pub mod recorder;
pub mod retention;
pub mod scanner;
pub mod state_manager;
pub mod status;
pub mod tool;
pub mod verify;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{Settings, SizeTolerance};
    pub use crate::models::{GroupRecord, GroupStatus, Readiness, ReadinessReport, TrackingDocument};
    pub use crate::queue::{ExtractionJob, ExtractionQueue, GroupOutcome, QueueEvent, QueuePhase, QueueSummary};
    pub use crate::recorder::{DownloadObserver, DownloadRecorder};
    pub use crate::scanner::{CrossCheck, FolderScan};
    pub use crate::state_manager::{StoreError, TrackingStore};
    pub use crate::tool::{CommandTool, ToolError, UnpackTool};
}
