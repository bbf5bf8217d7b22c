//! Sync orchestrator: drives the download → apply → upload round.
//!
//! One round is a linear sequence of awaitable steps; at most one round
//! runs at a time per orchestrator. Remote I/O is timeout-wrapped and
//! transient failures are retried a bounded number of times. A cancelled
//! round leaves `last_server_seq` untouched, so the next round
//! re-downloads the same ops; idempotent application is the applier's
//! contract.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::op::{CompactOp, Operation};
use crate::resolve::{
    decide, partition_after_import, ConflictWinner, EntityStateProvider, SupersededOp,
    SupersededRewriter,
};
use crate::store::{LogEntry, OpLog, OpSource};

use super::types::{
    DownloadOutcome, NoticeCallback, OpApplier, RoundSummary, SnapshotProvider, SyncNotice,
    SyncOrchestratorOptions, SyncPhase, SyncRemote, UploadOutcome,
};

const META_LAST_SERVER_SEQ: &str = "sync.last_server_seq";
const META_LAST_UPLOADED_SEQ: &str = "sync.last_uploaded_seq";

/// Single-threaded sync state machine for one account/remote pair.
pub struct SyncOrchestrator {
    log: OpLog,
    remote: Arc<dyn SyncRemote>,
    applier: Arc<dyn OpApplier>,
    entity_state: Arc<dyn EntityStateProvider>,
    snapshot: Arc<dyn SnapshotProvider>,
    config: SyncConfig,
    on_notice: Option<NoticeCallback>,
    phase: Mutex<SyncPhase>,
}

impl SyncOrchestrator {
    pub fn new(options: SyncOrchestratorOptions) -> Self {
        Self {
            log: options.log,
            remote: options.remote,
            applier: options.applier,
            entity_state: options.entity_state,
            snapshot: options.snapshot,
            config: options.config,
            on_notice: options.on_notice,
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    pub fn current_phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: SyncPhase) {
        debug!(?phase, "sync phase");
        *self.phase.lock() = phase;
    }

    fn notify(&self, notice: SyncNotice) {
        if let Some(on_notice) = &self.on_notice {
            on_notice(&notice);
        }
    }

    fn cursor(&self, key: &str) -> Result<u64> {
        Ok(self
            .log
            .store()
            .get_meta(key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    fn set_cursor(&self, key: &str, value: u64) -> Result<()> {
        self.log.store().set_meta(key, &value.to_string())?;
        Ok(())
    }

    /// `last_server_seq`: highest peer seq already applied from the remote.
    pub fn last_server_seq(&self) -> Result<u64> {
        self.cursor(META_LAST_SERVER_SEQ)
    }

    /// Timeout-wrap a remote call and retry transient failures.
    async fn io<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            let result = tokio::time::timeout(self.config.io_timeout, call())
                .await
                .map_err(|_| SyncError::Timeout(self.config.io_timeout))
                .and_then(|r| r);
            match result {
                Err(e) if e.is_transient() && attempts < self.config.io_retries => {
                    attempts += 1;
                    warn!(error = %e, attempts, "transient remote error; retrying");
                }
                other => return other,
            }
        }
    }

    /// Run one full sync round.
    pub async fn sync_round(&self) -> Result<RoundSummary> {
        let result = self.run_round().await;
        match &result {
            Ok(_) => self.set_phase(SyncPhase::Idle),
            Err(e) if e.is_transient() => self.set_phase(SyncPhase::Idle),
            Err(_) => self.set_phase(SyncPhase::Error),
        }
        result
    }

    async fn run_round(&self) -> Result<RoundSummary> {
        let mut summary = RoundSummary::default();
        let client_id = self.log.ensure_client_id()?;

        // Pull.
        self.set_phase(SyncPhase::Pulling);
        let since = self.last_server_seq()?;
        let downloaded = self
            .io(|| self.remote.download_ops(since, &client_id))
            .await?;
        summary.sync_version = Some(downloaded.sync_version);

        // Apply.
        self.set_phase(SyncPhase::Applying);
        self.apply_downloaded(&downloaded, &mut summary)?;

        // Push, with a bounded resolve loop.
        let mut resolve_rounds = 0;
        loop {
            self.set_phase(SyncPhase::Pushing);
            let Some(push) = self.prepare_push(&mut summary)? else {
                debug!("nothing to push");
                break;
            };

            let state = self.snapshot.current_state()?;
            let protected = self.log.store().get_protected_client_ids()?;
            let last_known = self.last_server_seq()?;
            let outcome = self
                .io(|| {
                    self.remote.upload_ops(
                        ops_clone(&push),
                        &client_id,
                        last_known,
                        state.clone(),
                        protected.clone(),
                    )
                })
                .await?;

            match outcome {
                UploadOutcome::Accepted {
                    new_ops,
                    sync_version,
                } => {
                    summary.pushed += push.len();
                    summary.sync_version = Some(sync_version);
                    let top_local = push.iter().map(|e| e.seq).max().unwrap_or(0);
                    self.set_cursor(META_LAST_UPLOADED_SEQ, top_local)?;

                    if new_ops.is_empty() {
                        let advanced = self.last_server_seq()?.max(top_local);
                        self.set_cursor(META_LAST_SERVER_SEQ, advanced)?;
                    } else {
                        // Apply piggybacked peer ops, then stop: ops
                        // produced during apply belong to the next round.
                        summary.piggybacked += new_ops.len();
                        self.apply_peer_ops(new_ops)?;
                    }
                    break;
                }
                UploadOutcome::Rejected { ops: rejected } => {
                    if resolve_rounds >= self.config.max_lww_rewrite_rounds {
                        warn!(
                            rounds = resolve_rounds,
                            "rewrite budget exhausted; sync stuck"
                        );
                        return Err(SyncError::RewriteBudgetExhausted {
                            rounds: resolve_rounds,
                        });
                    }
                    resolve_rounds += 1;
                    self.set_phase(SyncPhase::Resolving);
                    self.resolve_rejections(rejected, &downloaded, &mut summary)?;
                }
            }
        }

        Ok(summary)
    }

    /// Apply the pull result: either re-seed from the full snapshot when
    /// the recent-ops window was outrun, or replay individual peer ops.
    fn apply_downloaded(
        &self,
        downloaded: &DownloadOutcome,
        summary: &mut RoundSummary,
    ) -> Result<()> {
        if downloaded.truncated {
            info!("recent-ops window outrun; applying full remote state");
            self.applier.apply_full_state(&downloaded.state)?;
            self.log.write_section(|store| {
                let mut clock = store.get_current_vector_clock()?;
                clock.merge(&downloaded.vector_clock);
                store.set_vector_clock(&clock)?;
                Ok(())
            })?;
            self.set_cursor(META_LAST_SERVER_SEQ, downloaded.latest_seq)?;
            summary.applied_full_state = true;
            return Ok(());
        }

        if downloaded.ops.is_empty() {
            return Ok(());
        }
        summary.pulled = downloaded.ops.len();
        self.apply_peer_ops(downloaded.ops.clone())?;
        Ok(())
    }

    /// Apply peer ops to the materialized state, record them in the log,
    /// rewrite any pending local ops they supersede, and advance
    /// `last_server_seq`. Ordering: cursors only move after application
    /// succeeded, so cancellation replays instead of skipping.
    fn apply_peer_ops(&self, mut peer_ops: Vec<CompactOp>) -> Result<()> {
        peer_ops.sort_by_key(CompactOp::seq);
        let top_seq = peer_ops.iter().map(CompactOp::seq).max().unwrap_or(0);
        let ops: Vec<Operation> = peer_ops.into_iter().map(CompactOp::into_operation).collect();

        self.applier.apply_remote_ops(&ops)?;
        self.log.append_remote(&ops)?;

        let superseded = self.collect_superseded(&ops)?;
        if !superseded.is_empty() {
            let rewriter = SupersededRewriter::new(
                &self.log,
                self.entity_state.as_ref(),
                self.config.max_vector_clock_size,
            );
            let outcome = rewriter.rewrite_superseded(superseded, &[], None)?;
            self.notify(SyncNotice::ChangesRewritten {
                kept: outcome.rewritten,
                discarded: outcome.discarded,
            });
        }

        let advanced = self.last_server_seq()?.max(top_seq);
        self.set_cursor(META_LAST_SERVER_SEQ, advanced)?;
        Ok(())
    }

    /// Pending local ops that lose their conflict against an incoming
    /// remote op on the same entity.
    fn collect_superseded(&self, remote_ops: &[Operation]) -> Result<Vec<SupersededOp>> {
        let last_uploaded = self.cursor(META_LAST_UPLOADED_SEQ)?;
        let pending = self.log.pending_local_ops(last_uploaded)?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut superseded = Vec::new();
        for entry in pending {
            if entry.op.entity_id.is_none() {
                continue;
            }
            let conflict = remote_ops.iter().find(|r| {
                r.entity_kind == entry.op.entity_kind && r.entity_id == entry.op.entity_id
            });
            if let Some(remote) = conflict {
                if decide(&entry.op, remote) == ConflictWinner::Remote {
                    superseded.push(SupersededOp {
                        op_id: entry.op.id,
                        op: entry.op,
                        existing_clock: Some(remote.vector_clock.clone()),
                        remote: Some(remote.clone()),
                    });
                }
            }
        }
        Ok(superseded)
    }

    /// Collect pending local ops for upload, dropping pre-import ones.
    /// `None` when there is nothing to push.
    fn prepare_push(&self, summary: &mut RoundSummary) -> Result<Option<Vec<LogEntry>>> {
        let last_uploaded = self.cursor(META_LAST_UPLOADED_SEQ)?;
        let pending = self.log.pending_local_ops(last_uploaded)?;
        if pending.is_empty() {
            return Ok(None);
        }

        let import = self.log.latest_sync_import()?;
        let partition = partition_after_import(
            pending,
            import.as_ref(),
            self.config.max_vector_clock_size,
        );

        if !partition.invalidated.is_empty() {
            let ids: Vec<_> = partition.invalidated.iter().map(|e| e.op.id).collect();
            self.log.store().mark_rejected(&ids)?;
            summary.dropped_pre_import += ids.len();
            self.notify(SyncNotice::PreImportOpsDropped { count: ids.len() });
        }

        if partition.valid.is_empty() {
            return Ok(None);
        }
        Ok(Some(partition.valid))
    }

    /// Route server-rejected ops through the superseded-op rewriter.
    fn resolve_rejections(
        &self,
        rejected: Vec<super::types::RejectedOp>,
        downloaded: &DownloadOutcome,
        summary: &mut RoundSummary,
    ) -> Result<()> {
        let mut inputs = Vec::new();
        for rejection in rejected {
            let Some(entry) = self.log.store().find_op(&rejection.op_id)? else {
                warn!(op_id = %rejection.op_id, "server rejected an unknown op");
                continue;
            };
            let remote = self.find_conflicting_remote(&entry.op)?;
            inputs.push(SupersededOp {
                op_id: rejection.op_id,
                op: entry.op,
                existing_clock: rejection.existing_clock,
                remote,
            });
        }
        if inputs.is_empty() {
            return Ok(());
        }

        let rewriter = SupersededRewriter::new(
            &self.log,
            self.entity_state.as_ref(),
            self.config.max_vector_clock_size,
        );
        let outcome =
            rewriter.rewrite_superseded(inputs, &[], Some(&downloaded.vector_clock))?;
        summary.rewritten += outcome.rewritten;
        summary.discarded += outcome.discarded;
        self.notify(SyncNotice::ChangesRewritten {
            kept: outcome.rewritten,
            discarded: outcome.discarded,
        });
        Ok(())
    }

    /// The newest remote-sourced op on the same entity, used to carry
    /// delete/bulk intent into the rewrite.
    fn find_conflicting_remote(&self, local: &Operation) -> Result<Option<Operation>> {
        if local.entity_id.is_none() {
            return Ok(None);
        }
        let entries = self.log.store().scan(0, None, false)?;
        Ok(entries
            .into_iter()
            .rev()
            .filter(|e| e.source == OpSource::Remote)
            .find(|e| {
                e.op.entity_kind == local.entity_kind && e.op.entity_id == local.entity_id
            })
            .map(|e| e.op))
    }

    /// Start over under a fresh identity and force-upload the snapshot.
    /// Peers receive the import on their next round and drop their
    /// in-flight pre-import ops.
    pub async fn create_clean_slate(&self) -> Result<()> {
        let state = self.snapshot.current_state()?;
        let (new_client_id, import_op) =
            self.log.clean_slate(state.clone(), self.config.schema_version)?;
        self.set_cursor(META_LAST_SERVER_SEQ, 0)?;
        self.set_cursor(META_LAST_UPLOADED_SEQ, 1)?;

        let clock = self.log.store().get_current_vector_clock()?;
        let recent_ops = vec![import_op.compact(1)];
        let sync_version = self
            .io(|| {
                self.remote.upload_snapshot(
                    &new_client_id,
                    state.clone(),
                    clock.clone(),
                    recent_ops.clone(),
                )
            })
            .await?;
        info!(client_id = %new_client_id, sync_version, "clean slate uploaded");
        Ok(())
    }
}

fn ops_clone(entries: &[LogEntry]) -> Vec<CompactOp> {
    entries.iter().map(|e| e.op.compact(e.seq)).collect()
}
