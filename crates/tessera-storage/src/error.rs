//! Storage error types.

use std::time::Duration;

use thiserror::Error;

/// Errors shared by storage, permission and cache backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Read, update or delete of an absent leaf.
    #[error("object not found: {path}")]
    NotFound { path: String },

    /// Create with an ID that is still live.
    #[error("object already exists: {path}")]
    ObjectExists { path: String },

    /// A node path was given where a leaf was required, or vice versa.
    #[error("invalid path: {path}")]
    InvalidPath { path: String },

    /// The transaction was already committed or rolled back.
    #[error("transaction has already been committed or rolled back")]
    TxDone,

    /// Connection string could not be parsed.
    #[error("invalid {kind} URL {url:?}")]
    InvalidUrl { kind: &'static str, url: String },

    /// No backend registered for the connection string scheme.
    #[error("unknown {kind} type {scheme:?}")]
    UnknownScheme { kind: &'static str, scheme: String },

    /// Pagination nonce is unknown or already spent.
    #[error("_token has invalid content")]
    InvalidToken,

    /// Database connection error.
    #[error("database connection error: {message}")]
    ConnectionError { message: String },

    /// Query execution error.
    #[error("query error: {message}")]
    QueryError { message: String },

    /// Transaction error.
    #[error("transaction error: {message}")]
    TransactionError { message: String },

    /// Document could not be encoded or decoded.
    #[error("serialization error: {message}")]
    SerializationError { message: String },

    /// Schema setup failed or the database schema is newer than supported.
    #[error("migration error: {message}")]
    MigrationError { message: String },

    /// Query exceeded its timeout.
    #[error("query timeout: '{operation}' exceeded {timeout:?}")]
    QueryTimeout { operation: String, timeout: Duration },
}

impl StorageError {
    pub fn not_found(path: impl ToString) -> Self {
        Self::NotFound {
            path: path.to_string(),
        }
    }

    pub fn invalid_path(path: impl ToString) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
