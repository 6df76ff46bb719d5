//! Error types for journal operations.

use std::io;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur while reading or writing the journal.
#[derive(Debug, Error)]
pub enum JournalError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A complete frame failed validation.
    #[error("journal corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Offset of the bad frame.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// The journal file is held by another process.
    #[error("journal locked: another process owns {0}")]
    Locked(String),

    /// A batch could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A batch payload could not be decoded.
    #[error("decode error at offset {offset}: {reason}")]
    Decode {
        /// Offset of the frame.
        offset: u64,
        /// Decoder message.
        reason: String,
    },

    /// Write rejected by the backend (used for fault injection in tests).
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl JournalError {
    pub(crate) fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            reason: reason.into(),
        }
    }
}
