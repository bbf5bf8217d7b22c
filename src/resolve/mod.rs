pub mod conflict;
pub mod import_filter;
pub mod rewrite;

pub use conflict::{decide, rewrite_action, ConflictWinner, EntityStateProvider, RewriteAction};
pub use import_filter::{
    is_likely_pruning_artifact, is_pre_import, partition_after_import, ImportPartition,
};
pub use rewrite::{RewriteOutcome, SupersededOp, SupersededRewriter};
