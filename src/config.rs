//! Tunables for the sync core.

use std::time::Duration;

/// Upper bound on vector-clock size after pruning.
pub const DEFAULT_MAX_VECTOR_CLOCK_SIZE: usize = 20;

/// How many recent ops the remote blob retains for incremental catch-up.
/// Clients that fall further behind re-seed from the full state snapshot.
pub const DEFAULT_RECENT_OPS_WINDOW: usize = 200;

/// Maximum conflict-rewrite rounds within a single sync round.
pub const DEFAULT_MAX_LWW_REWRITE_ROUNDS: usize = 5;

/// Configuration for the sync core. All constants are surfaced here so
/// deployments can tighten or relax them without code changes.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Vector clocks are pruned down to this many entries on upload.
    pub max_vector_clock_size: usize,
    /// Size of the remote blob's recent-ops window.
    pub recent_ops_window: usize,
    /// Rewrite rounds allowed before a sync round gives up as stuck.
    pub max_lww_rewrite_rounds: usize,
    /// Timeout applied to every remote download/upload.
    pub io_timeout: Duration,
    /// Retries for transient remote errors within one round.
    pub io_retries: usize,
    /// Payload schema version this client reads and writes.
    pub schema_version: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_vector_clock_size: DEFAULT_MAX_VECTOR_CLOCK_SIZE,
            recent_ops_window: DEFAULT_RECENT_OPS_WINDOW,
            max_lww_rewrite_rounds: DEFAULT_MAX_LWW_REWRITE_ROUNDS,
            io_timeout: Duration::from_secs(30),
            io_retries: 2,
            schema_version: 1,
        }
    }
}
