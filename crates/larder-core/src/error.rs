//! Error types for the larder core types.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling events, filters and wire messages.
#[derive(Error, Debug)]
pub enum Error {
    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Event failed id or signature verification.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// A relay frame that is not a well-formed protocol message.
    #[error("invalid relay message: {0}")]
    InvalidMessage(String),

    /// Key material could not be parsed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// No signer is configured, so a write action cannot proceed.
    #[error("no signer available")]
    SignerUnavailable,

    /// The signer refused or failed to sign.
    #[error("signing failed: {0}")]
    Signing(String),
}
