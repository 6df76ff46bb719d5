//! Journal backend trait.

use crate::error::JournalResult;

/// Byte store underneath a [`crate::Journal`].
///
/// Backends do not interpret the bytes they hold. The journal owns framing
/// and recovery.
///
/// # Invariants
///
/// - `append` writes the whole slice or fails without a partial effect the
///   journal cannot detect (a torn tail is detected by framing)
/// - `read_all` returns every byte appended since the last `replace`
/// - `replace` is atomic: readers see either the old or the new contents
pub trait JournalBackend: Send + Sync {
    /// Reads the entire contents.
    fn read_all(&self) -> JournalResult<Vec<u8>>;

    /// Appends data to the end and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> JournalResult<u64>;

    /// Makes all appended data durable.
    fn sync(&mut self) -> JournalResult<()>;

    /// Current size in bytes.
    fn size(&self) -> JournalResult<u64>;

    /// Drops everything after `new_size`. Used to cut off a torn tail.
    fn truncate(&mut self, new_size: u64) -> JournalResult<()>;

    /// Atomically swaps the full contents for `data`. Used by compaction.
    fn replace(&mut self, data: &[u8]) -> JournalResult<()>;

    /// Human readable location, for logs.
    fn describe(&self) -> String;
}
