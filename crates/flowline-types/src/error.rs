//! Error types raised by storage and host collaborators.

use thiserror::Error;

/// Errors returned by the pluggable flow/instance storage hooks.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested key does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backing store failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Errors returned by host collaborators (cache, HTTP, pub/sub, data
/// source). Inside a script these surface as thrown errors.
#[derive(Debug, Error)]
pub enum HostError {
    /// The collaborator was never configured on the engine.
    #[error("{0} is not configured")]
    Unconfigured(&'static str),

    /// The collaborator failed.
    #[error("{0}")]
    Backend(String),

    /// An HTTP request completed with a non-success status.
    #[error("http status {code}: {message}")]
    Status { code: u16, message: String },
}
