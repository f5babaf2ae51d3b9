#![forbid(unsafe_code)]
//! Error types for FrankenBees.
//!
//! Defines `FbsError` and a `Result<T>` alias used throughout the
//! workspace. Recoverable per-candidate failures are not errors; they
//! surface as `Ok(None)` plus a counter at the call site.

use thiserror::Error;

/// Unified error type for all FrankenBees operations.
#[derive(Debug, Error)]
pub enum FbsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata search failed: {detail}")]
    Search { detail: String },

    #[error("corrupt metadata in root {root}: {detail}")]
    Corruption { root: u64, detail: String },

    #[error("bad state file line {line}: {detail}")]
    StateParse { line: usize, detail: String },

    #[error("invariant violated: {0}")]
    InvalidState(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl FbsError {
    /// Build a `Search` error from an ioctl failure site.
    #[must_use]
    pub fn search(detail: impl Into<String>) -> Self {
        Self::Search {
            detail: detail.into(),
        }
    }

    /// Build an `InvalidState` error. These mark bugs, not weather.
    #[must_use]
    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::InvalidState(detail.into())
    }
}

/// Result alias using `FbsError`.
pub type Result<T> = std::result::Result<T, FbsError>;
