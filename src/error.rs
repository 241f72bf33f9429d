//! Error types for the key-value store and its transaction loggers.

use crate::types::Sequence;
use thiserror::Error;

/// Main error type for store and logger operations.
#[derive(Debug, Error)]
pub enum KvsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("No such key: {0}")]
    NoSuchKey(String),

    #[error("Cannot open transaction log {target}: {reason}")]
    LogOpen { target: String, reason: String },

    #[error("Transaction numbers out of sequence: {found:?} after {previous:?}")]
    SequenceOutOfOrder { previous: Sequence, found: Sequence },

    #[error("Transaction numbers skipped: expected {expected:?}, got {found:?}")]
    SequenceGap { expected: Sequence, found: Sequence },

    #[error("Persistence write failed ({backend}): {reason}")]
    PersistenceWrite {
        backend: &'static str,
        reason: String,
    },

    #[error("Malformed transaction record at line {line}: {reason}")]
    ReplayParse { line: u64, reason: String },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Transaction log is locked by another process")]
    Locked,

    #[error("Transaction logger is already running")]
    AlreadyRunning,

    #[error("Transaction logger is not running")]
    NotRunning,

    #[error("Transaction logger is closed")]
    LoggerClosed,

    #[error("Persistence worker panicked")]
    WorkerPanicked,
}

impl KvsError {
    /// Whether this error is a replay warning rather than a broken stream.
    ///
    /// Sequence warnings are reported while the replay keeps emitting events.
    pub fn is_sequence_warning(&self) -> bool {
        matches!(
            self,
            KvsError::SequenceOutOfOrder { .. } | KvsError::SequenceGap { .. }
        )
    }
}

/// Result type for store and logger operations.
pub type Result<T> = std::result::Result<T, KvsError>;
