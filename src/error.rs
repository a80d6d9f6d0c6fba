use thiserror::Error;

use crate::store::error::StoreError;

/// Errors surfaced by the synchronization layer.
///
/// Background cache refreshes never surface [`SyncError::RefreshFailed`];
/// they swallow store failures and serve the last-known snapshot. Only
/// explicit force-refreshes and session mutations propagate errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Referenced session or record is absent.
    #[error("not found: {0}")]
    NotFound(String),
    /// Session exists but exceeded the inactivity TTL.
    #[error("session `{0}` has expired")]
    SessionExpired(String),
    /// No free join code could be drawn within the attempt ceiling.
    #[error("could not reserve a unique join code after {attempts} attempts")]
    CodeGenerationExhausted {
        /// Number of draws made before giving up.
        attempts: u32,
    },
    /// Transient failure talking to the remote store.
    #[error("store operation failed")]
    Store(#[from] StoreError),
    /// An explicitly forced cache refresh failed and no fresh data exists.
    #[error("cache refresh failed: {message}")]
    RefreshFailed {
        /// Description of the underlying store failure.
        message: String,
    },
    /// Invalid input provided by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
