//! Error types for the cache engine.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine.
///
/// The durable store never returns these to its callers; it logs them and
/// degrades. They surface from configuration, relay transports and signing.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the core types (parsing, verification, signing).
    #[error(transparent)]
    Core(#[from] larder_core::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Relay connection or protocol error.
    #[error("Relay error: {0}")]
    Relay(String),

    /// An operation did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Channel send error.
    #[error("Channel error: {0}")]
    Channel(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Relay(e.to_string())
    }
}
