//! Error types for strata_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using strata_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Key absent from every queried store. The protocol's absence signal,
    /// distinct from all other errors.
    #[error("Block not found: {key}")]
    NotFound { key: String },

    /// Backing file for a record no longer exists.
    #[error("Backing file missing: {path}")]
    FileMissing { path: PathBuf },

    /// Backing file no longer matches the record (size, modtime, or
    /// content hash). This is the invalid-block condition.
    #[error("Backing file changed: {path}: {reason}")]
    FileChanged { path: PathBuf, reason: String },

    /// Stored bytes fail to decode as the expected structure.
    #[error("Corrupt data for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Underlying record database failure unrelated to any single key.
    #[error("Database error: {reason}")]
    Database { reason: String },

    /// Optimistic update found a concurrent modification.
    #[error("Conflict on {key}: value changed")]
    Conflict { key: String },

    /// Invalid key format or encoding.
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Store is invalid or not initialized.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Invalid pin name or format.
    #[error("Invalid pin: {reason}")]
    InvalidPin { reason: String },

    /// Invalid caller-supplied argument.
    #[error("Invalid argument: {reason}")]
    InvalidArg { reason: String },
}

impl Error {
    /// Create a NotFound error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Create a FileMissing error.
    pub fn file_missing(path: impl Into<PathBuf>) -> Self {
        Error::FileMissing { path: path.into() }
    }

    /// Create a FileChanged error.
    pub fn file_changed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::FileChanged {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a Corrupt error.
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a Database error.
    pub fn database(reason: impl Into<String>) -> Self {
        Error::Database {
            reason: reason.into(),
        }
    }

    /// Create a Conflict error.
    pub fn conflict(key: impl Into<String>) -> Self {
        Error::Conflict { key: key.into() }
    }

    /// Create an InvalidKey error.
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Error::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidPin error.
    pub fn invalid_pin(reason: impl Into<String>) -> Self {
        Error::InvalidPin {
            reason: reason.into(),
        }
    }

    /// Create an InvalidArg error.
    pub fn invalid_arg(reason: impl Into<String>) -> Self {
        Error::InvalidArg {
            reason: reason.into(),
        }
    }

    /// True if this is the reserved absence signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True if this error means the backing file diverged from the record
    /// (the invalid-block condition).
    pub fn is_invalid_block(&self) -> bool {
        matches!(self, Error::FileChanged { .. })
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct() {
        let err = Error::not_found("abc");
        assert!(err.is_not_found());
        assert!(!Error::database("boom").is_not_found());
        assert!(!Error::file_missing("/tmp/x").is_not_found());
    }

    #[test]
    fn test_invalid_block_classification() {
        assert!(Error::file_changed("/tmp/x", "size mismatch").is_invalid_block());
        assert!(!Error::file_missing("/tmp/x").is_invalid_block());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io { .. }));
    }
}
