//! Errors surfaced by the coordination recipes

use concord_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyError {
    /// Caller-supplied cancellation fired at a suspension point
    #[error("operation canceled")]
    Canceled,

    /// `try_lock` found another session holding the mutex
    #[error("mutex is locked by another session")]
    Locked,

    #[error("session is closed")]
    SessionClosed,

    /// Store errors pass through unchanged
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConcurrencyError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, ConcurrencyError::Canceled)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ConcurrencyError::Store(err) if err.is_unavailable())
    }
}

pub type Result<T> = std::result::Result<T, ConcurrencyError>;
