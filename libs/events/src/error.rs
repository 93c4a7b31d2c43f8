//! Error types for event decoding.

use thiserror::Error;

/// Errors that can occur when encoding or decoding feed frames.
#[derive(Debug, Error, Clone)]
pub enum EventError {
    /// The frame could not be parsed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// A block event names a block no valid block could have.
    #[error("invalid block name: {0}")]
    InvalidBlockName(String),

    /// The frame type is unknown.
    #[error("unknown frame type: {0}")]
    UnknownFrameType(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
