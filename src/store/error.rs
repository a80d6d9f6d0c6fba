use std::error::Error;

use thiserror::Error;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error raised by store backends regardless of the underlying database.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend could not be reached or rejected the request transiently.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Human-readable description of the failed operation.
        message: String,
        /// Backend-specific failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// The store's security rules rejected the operation.
    #[error("permission denied for `{path}`")]
    PermissionDenied {
        /// Path the caller attempted to access.
        path: String,
    },
    /// A stored document did not match the expected shape.
    #[error("malformed document at `{path}`")]
    Malformed {
        /// Path of the offending document.
        path: String,
        /// Serialization failure.
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Construct an unavailable error from any backend failure.
    pub fn unavailable(message: impl Into<String>, source: impl Error + Send + Sync + 'static) -> Self {
        StoreError::Unavailable {
            message: message.into(),
            source: Box::new(source),
        }
    }

    /// Construct a malformed-document error for the given path.
    pub fn malformed(path: impl Into<String>, source: serde_json::Error) -> Self {
        StoreError::Malformed {
            path: path.into(),
            source,
        }
    }
}
