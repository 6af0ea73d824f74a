//! Error types for MarrowDB.

use thiserror::Error;

/// Result type alias using MarrowError.
pub type Result<T> = std::result::Result<T, MarrowError>;

/// Errors that can occur in MarrowDB operations.
#[derive(Debug, Error)]
pub enum MarrowError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Buffer pool errors
    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: i32 },

    #[error("Page still pinned: {page_id}")]
    PagePinned { page_id: i32 },

    // Tuple storage errors
    #[error("Page full, unable to insert tuple")]
    PageFull,

    #[error("Tuple not found at {rid}")]
    TupleNotFound { rid: String },

    #[error("Tuple too large: {size} bytes")]
    TupleTooLarge { size: usize },

    // Index errors
    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    // Transaction errors
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    // WAL errors
    #[error("Log write failed: {0}")]
    LogWriteFailed(String),

    #[error("Log corrupted at offset {offset}: {reason}")]
    LogCorrupted { offset: u64, reason: String },

    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    // Corruption: invariant violations that cannot be recovered from
    #[error("Corruption detected: {0}")]
    Corruption(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: MarrowError = io_err.into();
        assert!(matches!(err, MarrowError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_buffer_pool_errors_display() {
        let err = MarrowError::BufferPoolFull;
        assert_eq!(err.to_string(), "Buffer pool full, unable to allocate frame");

        let err = MarrowError::PageNotFound { page_id: 42 };
        assert_eq!(err.to_string(), "Page not found: 42");
    }

    #[test]
    fn test_wal_errors_display() {
        let err = MarrowError::LogWriteFailed("disk full".to_string());
        assert_eq!(err.to_string(), "Log write failed: disk full");

        let err = MarrowError::LogCorrupted {
            offset: 1024,
            reason: "truncated record".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Log corrupted at offset 1024: truncated record"
        );
    }

    #[test]
    fn test_transaction_error_display() {
        let err = MarrowError::TransactionAborted("wait-die".to_string());
        assert_eq!(err.to_string(), "Transaction aborted: wait-die");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(7)
        }

        fn returns_err() -> Result<i32> {
            Err(MarrowError::KeyNotFound)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MarrowError>();
    }
}
