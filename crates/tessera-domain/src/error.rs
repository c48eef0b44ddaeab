//! Domain error types.

use thiserror::Error;

/// Errors raised while parsing or manipulating domain values.
#[derive(Debug, Error)]
pub enum DomainError {
    /// Document is not a JSON object.
    #[error("invalid object: {message}")]
    InvalidObject { message: String },

    /// Field assignment with an unexpected value type.
    #[error("invalid value for field '{field}': {message}")]
    InvalidField { field: String, message: String },

    /// Malformed request parameter.
    #[error("{param} has invalid content")]
    InvalidParam { param: String },

    /// Pagination token could not be encoded.
    #[error("pagination token error: {message}")]
    Token { message: String },

    /// Malformed URL.
    #[error("invalid URL: {message}")]
    InvalidUrl { message: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
