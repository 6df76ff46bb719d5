//! Typed journal of record batches.

use crate::backend::JournalBackend;
use crate::error::{JournalError, JournalResult};
use crate::frame::{encode_frame, scan_frames, FrameKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tracing::{debug, warn};

/// Size and shape of a journal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// Bytes on the backend.
    pub size_bytes: u64,
    /// Frames written since the last compaction (snapshot frame excluded).
    pub batches_since_compaction: usize,
    /// Whether a torn tail was cut off when the journal was opened.
    pub recovered_torn_tail: bool,
}

/// Append-only journal of `R` records.
///
/// Every call to [`Journal::append`] writes one frame, so the records of a
/// single call are atomic with respect to crashes.
pub struct Journal<R> {
    backend: Box<dyn JournalBackend>,
    stats: JournalStats,
    _records: PhantomData<fn() -> R>,
}

impl<R> Journal<R>
where
    R: Serialize + DeserializeOwned,
{
    /// Opens a journal on `backend`, cutting off any torn tail.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Corrupted`] if a complete frame fails
    /// validation.
    pub fn open(mut backend: Box<dyn JournalBackend>) -> JournalResult<Self> {
        let bytes = backend.read_all()?;
        let scan = scan_frames(&bytes)?;

        let recovered_torn_tail = scan.valid_len < bytes.len() as u64;
        if recovered_torn_tail {
            warn!(
                location = %backend.describe(),
                dropped = bytes.len() as u64 - scan.valid_len,
                "dropping torn journal tail"
            );
            backend.truncate(scan.valid_len)?;
            backend.sync()?;
        }

        let batches_since_compaction = scan
            .frames
            .iter()
            .filter(|f| f.kind == FrameKind::Batch)
            .count();

        debug!(
            location = %backend.describe(),
            frames = scan.frames.len(),
            "journal opened"
        );

        Ok(Self {
            backend,
            stats: JournalStats {
                size_bytes: scan.valid_len,
                batches_since_compaction,
                recovered_torn_tail,
            },
            _records: PhantomData,
        })
    }

    /// Reads every record in commit order.
    pub fn replay(&self) -> JournalResult<Vec<R>> {
        let bytes = self.backend.read_all()?;
        let scan = scan_frames(&bytes)?;

        let mut records = Vec::new();
        for frame in scan.frames {
            let batch: Vec<R> =
                ciborium::from_reader(frame.payload.as_slice()).map_err(|e| {
                    JournalError::Decode {
                        offset: frame.offset,
                        reason: e.to_string(),
                    }
                })?;
            records.extend(batch);
        }
        Ok(records)
    }

    /// Appends `records` as one atomic batch and syncs it.
    ///
    /// An empty slice writes nothing.
    pub fn append(&mut self, records: &[R]) -> JournalResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let frame = encode_frame(FrameKind::Batch, &encode_records(records)?)?;
        self.backend.append(&frame)?;
        self.backend.sync()?;
        self.stats.size_bytes += frame.len() as u64;
        self.stats.batches_since_compaction += 1;
        Ok(())
    }

    /// Replaces the journal with a single snapshot frame holding `state`.
    pub fn compact(&mut self, state: &[R]) -> JournalResult<()> {
        let frame = encode_frame(FrameKind::Snapshot, &encode_records(state)?)?;
        self.backend.replace(&frame)?;
        debug!(
            location = %self.backend.describe(),
            before = self.stats.size_bytes,
            after = frame.len(),
            "journal compacted"
        );
        self.stats.size_bytes = frame.len() as u64;
        self.stats.batches_since_compaction = 0;
        Ok(())
    }

    /// Returns current statistics.
    pub fn stats(&self) -> JournalStats {
        self.stats
    }

    /// Where the journal lives.
    pub fn location(&self) -> String {
        self.backend.describe()
    }
}

fn encode_records<R: Serialize>(records: &[R]) -> JournalResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(&records, &mut payload)
        .map_err(|e| JournalError::Encode(e.to_string()))?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Record {
        Put { key: String, value: u32 },
        Remove { key: String },
    }

    fn put(key: &str, value: u32) -> Record {
        Record::Put {
            key: key.into(),
            value,
        }
    }

    #[test]
    fn empty_journal_replays_nothing() {
        let journal: Journal<Record> = Journal::open(Box::new(InMemoryBackend::new())).unwrap();
        assert!(journal.replay().unwrap().is_empty());
        assert_eq!(journal.stats(), JournalStats::default());
    }

    #[test]
    fn batches_replay_in_order() {
        let backend = InMemoryBackend::new();
        let mut journal = Journal::open(Box::new(backend.clone())).unwrap();
        journal.append(&[put("trip", 1), put("memory", 2)]).unwrap();
        journal
            .append(&[Record::Remove { key: "trip".into() }])
            .unwrap();

        let reopened: Journal<Record> = Journal::open(Box::new(backend)).unwrap();
        assert_eq!(
            reopened.replay().unwrap(),
            vec![
                put("trip", 1),
                put("memory", 2),
                Record::Remove { key: "trip".into() }
            ]
        );
        assert_eq!(reopened.stats().batches_since_compaction, 2);
    }

    #[test]
    fn empty_append_writes_nothing() {
        let backend = InMemoryBackend::new();
        let mut journal: Journal<Record> = Journal::open(Box::new(backend.clone())).unwrap();
        journal.append(&[]).unwrap();
        assert!(backend.data().is_empty());
    }

    #[test]
    fn torn_tail_is_cut_on_open() {
        let backend = InMemoryBackend::new();
        let mut journal = Journal::open(Box::new(backend.clone())).unwrap();
        journal.append(&[put("kept", 1)]).unwrap();
        let good_len = backend.data().len();
        journal.append(&[put("torn", 2)]).unwrap();

        let mut bytes = backend.data();
        bytes.truncate(bytes.len() - 5);
        let torn = InMemoryBackend::with_data(bytes);

        let reopened: Journal<Record> = Journal::open(Box::new(torn.clone())).unwrap();
        assert!(reopened.stats().recovered_torn_tail);
        assert_eq!(reopened.replay().unwrap(), vec![put("kept", 1)]);
        assert_eq!(torn.data().len(), good_len);
    }

    #[test]
    fn compaction_replaces_history() {
        let backend = InMemoryBackend::new();
        let mut journal = Journal::open(Box::new(backend.clone())).unwrap();
        for i in 0..10 {
            journal.append(&[put("trip", i)]).unwrap();
        }
        let before = backend.data().len();
        journal.compact(&[put("trip", 9)]).unwrap();
        assert!(backend.data().len() < before);
        assert_eq!(journal.stats().batches_since_compaction, 0);

        journal.append(&[put("memory", 1)]).unwrap();
        let reopened: Journal<Record> = Journal::open(Box::new(backend)).unwrap();
        assert_eq!(
            reopened.replay().unwrap(),
            vec![put("trip", 9), put("memory", 1)]
        );
    }

    #[test]
    fn failed_append_leaves_stats_alone() {
        let backend = InMemoryBackend::new();
        let mut journal: Journal<Record> = Journal::open(Box::new(backend.clone())).unwrap();
        backend.set_reject_writes(true);
        assert!(journal.append(&[put("trip", 1)]).is_err());
        assert_eq!(journal.stats().batches_since_compaction, 0);
        assert_eq!(journal.stats().size_bytes, 0);
    }
}
