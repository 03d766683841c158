//! Store error types

use crate::model::{LeaseId, Revision};

/// Error type for key-value store operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("required revision has been compacted (compact revision {compact_revision})")]
    Compacted { compact_revision: Revision },

    #[error("required revision {revision} is a future revision")]
    FutureRevision { revision: Revision },

    #[error("lease {0:x} not found")]
    LeaseNotFound(LeaseId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Whether the store could not be reached or the request timed out.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_compacted(&self) -> bool {
        matches!(self, StoreError::Compacted { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Unavailable("connection refused".to_string());
        assert_eq!(err.to_string(), "store unavailable: connection refused");

        let err = StoreError::Compacted {
            compact_revision: 42,
        };
        assert_eq!(
            err.to_string(),
            "required revision has been compacted (compact revision 42)"
        );

        let err = StoreError::LeaseNotFound(0x1f);
        assert_eq!(err.to_string(), "lease 1f not found");
    }

    #[test]
    fn test_error_kind_helpers() {
        assert!(StoreError::Unavailable("down".to_string()).is_unavailable());
        assert!(!StoreError::Unavailable("down".to_string()).is_compacted());
        assert!(
            StoreError::Compacted {
                compact_revision: 3
            }
            .is_compacted()
        );
        assert!(!StoreError::LeaseNotFound(1).is_unavailable());
    }
}
