pub mod orchestrator;
pub mod types;

pub use orchestrator::SyncOrchestrator;
pub use types::{
    DownloadOutcome, NoticeCallback, OpApplier, RejectedOp, RoundSummary, SnapshotProvider,
    SyncNotice, SyncOrchestratorOptions, SyncPhase, SyncRemote, UploadOutcome,
};
