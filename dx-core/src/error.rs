//! Core error types

use thiserror::Error;

/// Errors raised while constructing or parsing core types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
