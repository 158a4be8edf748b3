//! Error types for imagestash
//!
//! All modules use `CacheResult<T>` as their return type.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error produced by a backend byte-stream.
///
/// Backend producers are external collaborators; their errors are carried
/// through [`CacheError::Backend`] untouched so callers can downcast back
/// to the original type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// All errors that can occur in imagestash
#[derive(Error, Debug)]
pub enum CacheError {
    // Lookup errors
    #[error("image {id} is not cached")]
    NotFound { id: String },

    #[error("invalid image identifier: {id:?}")]
    InvalidIdentifier { id: String },

    // Write-path errors
    #[error("image {id} is already being cached")]
    AlreadyBeingCached { id: String },

    #[error("checksum mismatch for image {id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("backend stream failed for image {id}")]
    Backend {
        id: String,
        #[source]
        source: BoxError,
    },

    // Configuration errors
    #[error("invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    // Storage errors
    #[error("cache index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    // General errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a not-found error for an identifier
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create a backend error wrapping the producer's original error
    pub fn backend(id: impl Into<String>, source: BoxError) -> Self {
        Self::Backend {
            id: id.into(),
            source,
        }
    }

    /// Whether this error means the identifier has no cached entry
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
