//! Centralized error types for mailledger.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mailledger library.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A backing ledger file could not be read or written.
    ///
    /// The affected message must be skipped and retried on a later run.
    #[error("Ledger unavailable at '{path}': {source}")]
    LedgerUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A ledger row could not be decoded.
    #[error("Corrupt row {line} in '{path}': {reason}")]
    CorruptRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// The bounded-store snapshot is corrupt or was written by an incompatible version.
    #[error("Invalid quota snapshot '{path}': {reason}")]
    InvalidSnapshot { path: PathBuf, reason: String },

    /// Normalization failed; the record received a unique fallback key.
    #[error("Fingerprint fallback: {0}")]
    FingerprintFallback(String),

    /// The document store rejected an attachment.
    #[error("Could not persist artifact '{name}': {reason}")]
    ArtifactPersistence { name: String, reason: String },

    /// An eviction removed the entry being inserted.
    #[error("Quota eviction race on '{0}'")]
    QuotaEvictionRace(String),

    /// The inbound message source failed.
    #[error("Message source error: {0}")]
    Source(String),

    /// Another invocation holds the run lock.
    #[error("Another run holds the lock at '{0}'")]
    Locked(PathBuf),

    /// Configuration values are inconsistent.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience alias for `Result<T, LedgerError>`.
pub type Result<T> = std::result::Result<T, LedgerError>;

impl LedgerError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `LedgerUnavailable` variant from a path and an `io::Error`.
    pub fn unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::LedgerUnavailable {
            path: path.into(),
            source,
        }
    }
}

/// Allow `?` on `std::io::Error` when no path context is available
/// (rare, prefer `LedgerError::io`).
impl From<std::io::Error> for LedgerError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
