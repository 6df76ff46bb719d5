//! # Wayfare Journal
//!
//! Durable append-only journal used by the Wayfare sync engine to persist
//! its queue, cursors and conflict records.
//!
//! The crate has two layers:
//!
//! - [`JournalBackend`] - an opaque byte store (append, read back, replace).
//!   [`InMemoryBackend`] is used by tests, [`FileBackend`] for real devices.
//! - [`Journal`] - typed record batches on top of a backend. Each batch is a
//!   single frame (magic, version, length, CBOR payload, CRC32) so a batch
//!   is either fully visible after a crash or not at all.
//!
//! ## Crash behavior
//!
//! - A truncated frame at the end of the journal is a torn write: it is
//!   dropped and the backend is truncated back to the last good frame.
//! - A CRC mismatch on a complete frame is corruption and surfaces as
//!   [`JournalError::Corrupted`].
//!
//! ## Example
//!
//! ```rust
//! use wayfare_journal::{InMemoryBackend, Journal};
//!
//! let backend = InMemoryBackend::new();
//! let mut journal: Journal<String> = Journal::open(Box::new(backend.clone())).unwrap();
//! journal.append(&["trip created".to_string()]).unwrap();
//!
//! let reopened: Journal<String> = Journal::open(Box::new(backend)).unwrap();
//! assert_eq!(reopened.replay().unwrap(), vec!["trip created".to_string()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod frame;
mod journal;
mod memory;

pub use backend::JournalBackend;
pub use error::{JournalError, JournalResult};
pub use file::FileBackend;
pub use frame::{compute_crc32, FRAME_HEADER_SIZE, JOURNAL_MAGIC, JOURNAL_VERSION};
pub use journal::{Journal, JournalStats};
pub use memory::InMemoryBackend;
