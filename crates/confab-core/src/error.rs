//! Error types for Confab Core

use thiserror::Error;

use confab_push::PushError;

/// Result type alias using Confab Error
pub type Result<T> = std::result::Result<T, Error>;

/// Confab error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] PushError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Rejected: {0}")]
    Rejected(#[from] Rejection),

    /// A mutation would have broken a channel invariant and was not applied
    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by the REST collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Decode error: {0}")]
    Decode(String),
}

/// A user intent refused before anything was mutated
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("message is empty")]
    EmptyMessage,

    #[error("channel is already responding")]
    Busy,
}

impl From<crate::message::TransitionError> for Error {
    fn from(e: crate::message::TransitionError) -> Self {
        Error::Invariant(e.to_string())
    }
}
