//! In-memory journal backend.

use crate::backend::JournalBackend;
use crate::error::{JournalError, JournalResult};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An in-memory journal backend.
///
/// Clones share the same buffer, so a test can drop a ledger, "restart"
/// by opening a new journal on a clone, and observe exactly what was
/// persisted before the simulated crash.
///
/// # Example
///
/// ```rust
/// use wayfare_journal::{InMemoryBackend, JournalBackend};
///
/// let mut backend = InMemoryBackend::new();
/// let survivor = backend.clone();
/// backend.append(b"queued").unwrap();
/// assert_eq!(survivor.read_all().unwrap(), b"queued");
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<Vec<u8>>>,
    reject_writes: Arc<AtomicBool>,
}

impl InMemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with pre-existing bytes, e.g. a torn journal.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            reject_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a copy of the stored bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Makes every following write fail until switched back off.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn check_writable(&self) -> JournalResult<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            Err(JournalError::WriteRejected("in-memory backend is read-only".into()))
        } else {
            Ok(())
        }
    }
}

impl JournalBackend for InMemoryBackend {
    fn read_all(&self) -> JournalResult<Vec<u8>> {
        Ok(self.data.read().clone())
    }

    fn append(&mut self, new_data: &[u8]) -> JournalResult<u64> {
        self.check_writable()?;
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn sync(&mut self) -> JournalResult<()> {
        Ok(())
    }

    fn size(&self) -> JournalResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> JournalResult<()> {
        let mut data = self.data.write();
        let new_size = usize::try_from(new_size).unwrap_or(usize::MAX);
        if new_size < data.len() {
            data.truncate(new_size);
        }
        Ok(())
    }

    fn replace(&mut self, new_data: &[u8]) -> JournalResult<()> {
        self.check_writable()?;
        *self.data.write() = new_data.to_vec();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(backend.append(b"trip").unwrap(), 0);
        assert_eq!(backend.append(b"memory").unwrap(), 4);
        assert_eq!(backend.size().unwrap(), 10);
    }

    #[test]
    fn clones_share_contents() {
        let mut backend = InMemoryBackend::new();
        let other = backend.clone();
        backend.append(b"abc").unwrap();
        assert_eq!(other.read_all().unwrap(), b"abc");
    }

    #[test]
    fn rejected_writes_leave_data_untouched() {
        let mut backend = InMemoryBackend::with_data(b"keep".to_vec());
        backend.set_reject_writes(true);
        assert!(matches!(
            backend.append(b"lost"),
            Err(JournalError::WriteRejected(_))
        ));
        assert!(backend.replace(b"lost").is_err());
        assert_eq!(backend.data(), b"keep");

        backend.set_reject_writes(false);
        backend.append(b"!").unwrap();
        assert_eq!(backend.data(), b"keep!");
    }

    #[test]
    fn truncate_beyond_size_is_noop() {
        let mut backend = InMemoryBackend::with_data(b"hello".to_vec());
        backend.truncate(100).unwrap();
        assert_eq!(backend.size().unwrap(), 5);
        backend.truncate(2).unwrap();
        assert_eq!(backend.data(), b"he");
    }
}
