//! Error types shared across the synchronization engine.

use thiserror::Error;

/// Failures talking to the admin dashboard or the kitchen event stream.
///
/// None of these are fatal: transport failures degrade freshness until the
/// next poll, mutation failures leave the ticket at its last confirmed state.
#[derive(Debug, Clone, Error)]
pub enum KdsError {
    /// Network-level failure (connect, timeout, TLS, ...).
    #[error("{0}")]
    Transport(String),

    /// The admin dashboard answered with a non-success status.
    #[error("{message} (HTTP {status})")]
    Http { status: u16, message: String },

    /// The response body could not be interpreted.
    #[error("Invalid response from admin dashboard: {0}")]
    InvalidResponse(String),

    /// Missing or malformed configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Push channel failure.
    #[error("Event channel error: {0}")]
    Channel(String),
}

impl KdsError {
    /// Whether the error means the terminal credentials were rejected.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, KdsError::Http { status: 401 | 403, .. })
    }
}
