//! The engine's durable state.
//!
//! Queue entries, pull cursors and conflict records live in one journal so
//! that a change spanning them (say, recording a conflict and blocking its
//! queue entry) commits as a single batch.
//!
//! # Invariants
//!
//! - Every commit is appended and synced before the in-memory index changes.
//! - At most one entry per entity key is indexed.
//! - Compaction rewrites the whole index as one snapshot frame.

use crate::error::SyncResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wayfare_journal::{FileBackend, InMemoryBackend, Journal, JournalBackend, JournalStats};
use wayfare_sync_protocol::{
    ConflictId, ConflictRecord, EntityKey, EntityType, EntryId, QueueStatus, RouteId, SyncCursor,
    SyncQueueEntry,
};

/// One durable change to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerRecord {
    /// Inserts or replaces a queue entry.
    PutEntry(SyncQueueEntry),
    /// Removes a queue entry.
    RemoveEntry(EntryId),
    /// Inserts or replaces a cursor.
    PutCursor(SyncCursor),
    /// Inserts or replaces a conflict record.
    PutConflict(ConflictRecord),
}

/// Counts describing a ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    /// Pending entries.
    pub pending: usize,
    /// Entries handed to a route.
    pub in_flight: usize,
    /// Entries that gave up.
    pub failed: usize,
    /// Entries held back by conflicts.
    pub blocked: usize,
    /// Stored cursors.
    pub cursors: usize,
    /// Conflicts waiting for the user.
    pub unresolved_conflicts: usize,
    /// Journal size in bytes.
    pub journal_bytes: u64,
    /// Journal batches since the last compaction.
    pub batches_since_compaction: usize,
}

/// A ledger behind the mutex every engine component shares.
pub type SharedLedger = Arc<Mutex<Ledger>>;

/// Journal-backed index of queue entries, cursors and conflicts.
pub struct Ledger {
    journal: Journal<LedgerRecord>,
    entries: BTreeMap<EntryId, SyncQueueEntry>,
    by_key: HashMap<EntityKey, EntryId>,
    cursors: BTreeMap<(EntityType, RouteId), SyncCursor>,
    conflicts: BTreeMap<ConflictId, ConflictRecord>,
    compaction_threshold: usize,
}

impl Ledger {
    /// Opens a ledger on `backend`, replaying every committed batch.
    pub fn open(backend: Box<dyn JournalBackend>, compaction_threshold: usize) -> SyncResult<Self> {
        let journal = Journal::open(backend)?;
        let records = journal.replay()?;

        let mut ledger = Self {
            journal,
            entries: BTreeMap::new(),
            by_key: HashMap::new(),
            cursors: BTreeMap::new(),
            conflicts: BTreeMap::new(),
            compaction_threshold,
        };
        let replayed = records.len();
        for record in records {
            ledger.apply(record);
        }

        info!(
            location = %ledger.journal.location(),
            records = replayed,
            entries = ledger.entries.len(),
            cursors = ledger.cursors.len(),
            conflicts = ledger.conflicts.len(),
            "ledger opened"
        );
        Ok(ledger)
    }

    /// Opens or creates a file-backed ledger.
    pub fn open_file(path: &Path, compaction_threshold: usize) -> SyncResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Self::open(Box::new(backend), compaction_threshold)
    }

    /// Creates an empty in-memory ledger.
    pub fn in_memory() -> SyncResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()), usize::MAX)
    }

    /// Wraps the ledger for sharing.
    pub fn into_shared(self) -> SharedLedger {
        Arc::new(Mutex::new(self))
    }

    /// Sets how many batches trigger compaction.
    pub fn set_compaction_threshold(&mut self, batches: usize) {
        self.compaction_threshold = batches.max(1);
    }

    /// Durably applies `records` as one batch.
    pub fn commit(&mut self, records: Vec<LedgerRecord>) -> SyncResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.journal.append(&records)?;
        debug!(records = records.len(), "ledger batch committed");
        for record in records {
            self.apply(record);
        }

        if self.journal.stats().batches_since_compaction >= self.compaction_threshold {
            if let Err(e) = self.compact() {
                warn!(error = %e, "ledger compaction failed; journal left as is");
            }
        }
        Ok(())
    }

    /// Rewrites the journal as a snapshot of the current index.
    pub fn compact(&mut self) -> SyncResult<()> {
        let snapshot = self.snapshot_records();
        self.journal.compact(&snapshot)?;
        info!(records = snapshot.len(), "ledger compacted");
        Ok(())
    }

    fn snapshot_records(&self) -> Vec<LedgerRecord> {
        let entries = self.entries.values().cloned().map(LedgerRecord::PutEntry);
        let cursors = self.cursors.values().cloned().map(LedgerRecord::PutCursor);
        let conflicts = self
            .conflicts
            .values()
            .cloned()
            .map(LedgerRecord::PutConflict);
        entries.chain(cursors).chain(conflicts).collect()
    }

    fn apply(&mut self, record: LedgerRecord) {
        match record {
            LedgerRecord::PutEntry(entry) => {
                if let Some(previous) = self.by_key.insert(entry.key, entry.id) {
                    if previous != entry.id {
                        self.entries.remove(&previous);
                    }
                }
                self.entries.insert(entry.id, entry);
            }
            LedgerRecord::RemoveEntry(id) => {
                if let Some(entry) = self.entries.remove(&id) {
                    if self.by_key.get(&entry.key) == Some(&id) {
                        self.by_key.remove(&entry.key);
                    }
                }
            }
            LedgerRecord::PutCursor(cursor) => {
                self.cursors
                    .insert((cursor.entity_type, cursor.route.clone()), cursor);
            }
            LedgerRecord::PutConflict(record) => {
                self.conflicts.insert(record.id, record);
            }
        }
    }

    /// A queue entry by id.
    pub fn entry(&self, id: &EntryId) -> Option<&SyncQueueEntry> {
        self.entries.get(id)
    }

    /// The entry queued for an entity, terminal or not.
    pub fn entry_for_key(&self, key: &EntityKey) -> Option<&SyncQueueEntry> {
        self.by_key.get(key).and_then(|id| self.entries.get(id))
    }

    /// All queue entries in id order.
    pub fn entries(&self) -> impl Iterator<Item = &SyncQueueEntry> {
        self.entries.values()
    }

    /// A cursor, if one was stored.
    pub fn cursor(&self, entity_type: EntityType, route: &RouteId) -> Option<&SyncCursor> {
        self.cursors.get(&(entity_type, route.clone()))
    }

    /// All cursors.
    pub fn cursors(&self) -> impl Iterator<Item = &SyncCursor> {
        self.cursors.values()
    }

    /// A conflict record by id.
    pub fn conflict(&self, id: &ConflictId) -> Option<&ConflictRecord> {
        self.conflicts.get(id)
    }

    /// All conflict records.
    pub fn conflicts(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.conflicts.values()
    }

    /// Returns current statistics.
    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats::default();
        for entry in self.entries.values() {
            match entry.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::InFlight => stats.in_flight += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::Completed => {}
            }
            if entry.blocked {
                stats.blocked += 1;
            }
        }
        stats.cursors = self.cursors.len();
        stats.unresolved_conflicts = self.conflicts.values().filter(|c| !c.is_resolved()).count();

        let JournalStats {
            size_bytes,
            batches_since_compaction,
            ..
        } = self.journal.stats();
        stats.journal_bytes = size_bytes;
        stats.batches_since_compaction = batches_since_compaction;
        stats
    }

    /// Where the journal lives.
    pub fn location(&self) -> String {
        self.journal.location()
    }

    /// Every record the journal currently replays to.
    pub fn dump(&self) -> SyncResult<Vec<LedgerRecord>> {
        Ok(self.journal.replay()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use wayfare_sync_protocol::{EntitySnapshot, OperationKind, Priority};

    fn entry(name: &str) -> SyncQueueEntry {
        let now = Utc.timestamp_opt(100, 0).unwrap();
        let snapshot = EntitySnapshot::new(EntityKey::generate(EntityType::Trip), now)
            .with_field("name", name);
        SyncQueueEntry::new(OperationKind::Create, snapshot, Priority::Normal, now)
    }

    #[test]
    fn replays_committed_batches() {
        let backend = InMemoryBackend::new();
        let first = entry("Oslo");
        let second = entry("Bergen");

        {
            let mut ledger = Ledger::open(Box::new(backend.clone()), 100).unwrap();
            ledger
                .commit(vec![
                    LedgerRecord::PutEntry(first.clone()),
                    LedgerRecord::PutEntry(second.clone()),
                ])
                .unwrap();
            ledger
                .commit(vec![LedgerRecord::RemoveEntry(first.id)])
                .unwrap();
        }

        let ledger = Ledger::open(Box::new(backend), 100).unwrap();
        assert!(ledger.entry(&first.id).is_none());
        assert_eq!(ledger.entry_for_key(&second.key), Some(&second));
        assert_eq!(ledger.stats().pending, 1);
    }

    #[test]
    fn failed_append_leaves_index_untouched() {
        let backend = InMemoryBackend::new();
        let mut ledger = Ledger::open(Box::new(backend.clone()), 100).unwrap();
        backend.set_reject_writes(true);

        let e = entry("Oslo");
        assert!(ledger.commit(vec![LedgerRecord::PutEntry(e.clone())]).is_err());
        assert!(ledger.entry(&e.id).is_none());
    }

    #[test]
    fn compaction_preserves_state() {
        let backend = InMemoryBackend::new();
        let keep = entry("Tromsø");
        {
            let mut ledger = Ledger::open(Box::new(backend.clone()), 4).unwrap();
            for i in 0..10 {
                let e = entry(&format!("trip {i}"));
                ledger.commit(vec![LedgerRecord::PutEntry(e.clone())]).unwrap();
                ledger.commit(vec![LedgerRecord::RemoveEntry(e.id)]).unwrap();
            }
            ledger.commit(vec![LedgerRecord::PutEntry(keep.clone())]).unwrap();
            assert!(ledger.stats().batches_since_compaction < 4);
        }

        let ledger = Ledger::open(Box::new(backend), 4).unwrap();
        assert_eq!(ledger.entries().count(), 1);
        assert_eq!(ledger.entry(&keep.id), Some(&keep));
    }

    #[test]
    fn file_ledger_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.wfj");
        let cursor = SyncCursor::new(EntityType::Memory, RouteId::new("graphql"));
        {
            let mut ledger = Ledger::open_file(&path, 100).unwrap();
            ledger
                .commit(vec![LedgerRecord::PutCursor(cursor.clone())])
                .unwrap();
        }
        let ledger = Ledger::open_file(&path, 100).unwrap();
        assert_eq!(
            ledger.cursor(EntityType::Memory, &RouteId::new("graphql")),
            Some(&cursor)
        );
    }
}
