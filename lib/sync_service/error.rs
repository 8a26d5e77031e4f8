use crate::plan::PlanError;
use crate::stores::StoreError;
use crate::tag_filter::EmptyScopeError;
use thiserror::Error;

/// Aborts the current cycle; the loop reconnects and retries after a backoff.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    EmptyTagScope(#[from] EmptyScopeError),

    #[error("plan invariant violated: {0}")]
    Plan(#[from] PlanError),

    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
}
