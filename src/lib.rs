//! Operation-log synchronization core for multi-device apps without a
//! central source of truth for ordering.
//!
//! Each device accumulates ops in a local append-only log and exchanges
//! them through a single shared file (or an HTTP sync service) behind the
//! [`SyncRemote`] trait. Vector clocks give ops a causal order; conflicts
//! fall back to deterministic Last-Writer-Wins; uploads absorb concurrent
//! peer writes by piggybacking instead of retrying.
//!
//! The surrounding application plugs in at four seams: an [`OpApplier`]
//! that dispatches remote ops into its own store, an
//! [`EntityStateProvider`] and [`SnapshotProvider`] for rewrite payloads
//! and uploads, and a [`RemoteFile`] for the actual backend I/O.

pub mod clock;
pub mod config;
pub mod error;
pub mod op;
pub mod remote;
pub mod resolve;
pub mod store;
pub mod sync;

pub use clock::{ClockOrdering, VectorClock};
pub use config::SyncConfig;
pub use error::{Result, StoreError, SyncError};
pub use op::{
    generate_client_id, generate_op_id, CompactOp, EntityKind, OpDraft, OpType, Operation,
};
pub use remote::{
    BlobCodec, FileRemoteAdapter, JsonCodec, MemoryRemote, RemoteFile, SyncBlob,
    BLOB_FORMAT_VERSION,
};
pub use resolve::{
    decide, is_likely_pruning_artifact, partition_after_import, ConflictWinner,
    EntityStateProvider, ImportPartition, RewriteOutcome, SupersededOp, SupersededRewriter,
};
pub use store::{LogEntry, MemoryOpLogStore, OpLog, OpLogStore, OpSource, StateCache};
#[cfg(feature = "sqlite")]
pub use store::SqliteOpLogStore;
pub use sync::{
    DownloadOutcome, OpApplier, RejectedOp, RoundSummary, SnapshotProvider, SyncNotice,
    SyncOrchestrator, SyncOrchestratorOptions, SyncPhase, SyncRemote, UploadOutcome,
};
