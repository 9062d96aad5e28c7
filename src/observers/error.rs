//! Error type shared by the observers.

use thiserror::Error;

/// Errors raised while rendering or writing a report.
#[derive(Debug, Error)]
pub enum ObserverError {
    /// Serialization failed.
    #[cfg(feature = "json")]
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Writing the rendered output failed.
    #[error("write error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for observer operations.
pub type Result<T> = std::result::Result<T, ObserverError>;
