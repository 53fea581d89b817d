//! Error types for name parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The name is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The name exceeds the maximum length for its kind.
    #[error("{kind} is {actual} characters long, maximum is {max}")]
    TooLong {
        kind: &'static str,
        max: usize,
        actual: usize,
    },

    /// The name contains a character outside the allowed set.
    #[error("{kind} contains invalid character {ch:?} at position {position}")]
    InvalidCharacter {
        kind: &'static str,
        ch: char,
        position: usize,
    },

    /// The name must start and end with an alphanumeric character.
    #[error("{kind} must start and end with an alphanumeric character")]
    InvalidBoundary { kind: &'static str },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}
