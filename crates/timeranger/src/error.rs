//! Error and Result types for TimeRanger operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for TimeRanger operations.
pub type Result<T> = std::result::Result<T, TrError>;

/// The error type for TimeRanger operations.
#[derive(Debug, Error)]
pub enum TrError {
    /// Invalid or missing caller input (bad pkey, unknown field, bad path).
    #[error("Parameter error: {0}")]
    Parameter(String),

    /// Write attempted through a non-master database handle.
    #[error("Not master: {0}")]
    NotMaster(String),

    /// Topic, key, record or file does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// On-disk state is inconsistent (truncated metadata, short read).
    #[error("Corruption in {file:?}: {detail}")]
    Corruption {
        /// File in which the inconsistency was detected.
        file: PathBuf,
        /// Human-readable description of the inconsistency.
        detail: String,
    },

    /// A list callback aborted an append with a negative status.
    #[error("List callback aborted append with status {0}")]
    ListAborted(i32),

    /// Underlying OS call failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed JSON, on disk or in caller input.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrError {
    /// Returns true for conditions that route through the critical-error
    /// policy (unrecoverable I/O or store corruption) rather than being
    /// returned as ordinary recoverable errors.
    pub fn is_critical(&self) -> bool {
        matches!(self, TrError::Corruption { .. } | TrError::Io(_))
    }
}

/// What to do when an unrecoverable I/O or corruption condition is hit.
///
/// Chosen once at database open. The default favors exiting the process
/// over continuing to operate on a possibly corrupt store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CriticalPolicy {
    /// Log the condition and terminate the process (default).
    #[default]
    Exit,
    /// Log the condition and return the error to the caller.
    Continue,
}
