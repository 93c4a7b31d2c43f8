//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The name is longer than allowed.
    #[error("{kind} is {len} characters long, limit is {max}")]
    TooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },

    /// The name contains a character outside the allowed set.
    #[error("{kind} contains invalid character {character:?}")]
    InvalidCharacter { kind: &'static str, character: char },

    /// The job identifier is not a positive integer.
    #[error("invalid job id: {0}")]
    InvalidJobId(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
