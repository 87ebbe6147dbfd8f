//! Error types shared across nfs4d crates

use thiserror::Error;

/// Errors raised by handle and lock primitives
#[derive(Debug, Error)]
pub enum CommonError {
    /// Malformed or corrupted filehandle
    #[error("invalid filehandle: {0}")]
    InvalidHandle(String),

    /// Lock acquisition failed
    #[error("lock conflict: {0}")]
    LockConflict(String),

    /// Invalid lock request
    #[error("invalid lock range: {0}")]
    LockRange(String),
}

/// Result type for shared primitives
pub type CommonResult<T> = Result<T, CommonError>;
