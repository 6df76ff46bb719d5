//! Durable conflict records.
//!
//! Conflicts left for the user are stored here together with the block on
//! their queue entry, in one ledger batch. At most one unresolved record
//! exists per entity; a newer remote change refreshes it in place.
//! Conflicts settled by an automatic strategy are kept as resolved records.

use crate::error::{SyncError, SyncResult};
use crate::ledger::{LedgerRecord, SharedLedger};
use crate::queue::block_entry;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use wayfare_sync_protocol::{ConflictId, ConflictOutcome, ConflictRecord, EntityKey, EntryId};

/// Store of detected conflicts.
#[derive(Clone)]
pub struct ConflictLedger {
    ledger: SharedLedger,
}

impl ConflictLedger {
    /// Creates a conflict ledger over `ledger`.
    pub fn new(ledger: SharedLedger) -> Self {
        Self { ledger }
    }

    /// Persists an unresolved conflict and blocks `entry`, atomically.
    ///
    /// Returns the id of the stored record, which is the existing one if
    /// the entity already had an unresolved conflict.
    pub fn record(&self, record: ConflictRecord, entry: Option<EntryId>) -> SyncResult<ConflictId> {
        let mut ledger = self.ledger.lock();

        let stored = match ledger
            .conflicts()
            .find(|c| c.key == record.key && !c.is_resolved())
            .cloned()
        {
            Some(mut existing) => {
                existing.local_snapshot = record.local_snapshot;
                existing.remote_snapshot = record.remote_snapshot;
                existing.remote_version = record.remote_version;
                existing.remote_server_id = record.remote_server_id;
                existing.route = record.route;
                existing.detected_at = record.detected_at;
                existing
            }
            None => record,
        };

        let mut records = Vec::with_capacity(2);
        if let Some(mut entry) = entry.and_then(|id| ledger.entry(&id).cloned()) {
            block_entry(&mut entry);
            records.push(LedgerRecord::PutEntry(entry));
        }
        let id = stored.id;
        info!(conflict = %id, entity = %stored.key, "conflict deferred to user");
        records.push(LedgerRecord::PutConflict(stored));
        ledger.commit(records)?;
        Ok(id)
    }

    /// Persists a conflict that an automatic strategy settled right away.
    pub fn record_resolved(
        &self,
        mut record: ConflictRecord,
        outcome: ConflictOutcome,
        at: DateTime<Utc>,
    ) -> SyncResult<ConflictRecord> {
        record.settle(outcome, at);
        debug!(conflict = %record.id, entity = %record.key, ?outcome, "conflict settled automatically");
        self.ledger
            .lock()
            .commit(vec![LedgerRecord::PutConflict(record.clone())])?;
        Ok(record)
    }

    /// Marks a record settled.
    pub fn settle(
        &self,
        id: &ConflictId,
        outcome: ConflictOutcome,
        at: DateTime<Utc>,
    ) -> SyncResult<ConflictRecord> {
        let mut ledger = self.ledger.lock();
        let mut record = ledger
            .conflict(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("conflict {id}")))?;
        if record.is_resolved() {
            return Err(SyncError::AlreadyResolved(*id));
        }
        record.settle(outcome, at);
        ledger.commit(vec![LedgerRecord::PutConflict(record.clone())])?;
        Ok(record)
    }

    /// A record by id.
    pub fn get(&self, id: &ConflictId) -> Option<ConflictRecord> {
        self.ledger.lock().conflict(id).cloned()
    }

    /// The unresolved record for an entity, if any.
    pub fn unresolved_for(&self, key: &EntityKey) -> Option<ConflictRecord> {
        self.ledger
            .lock()
            .conflicts()
            .find(|c| c.key == *key && !c.is_resolved())
            .cloned()
    }

    /// Records waiting for the user, oldest first.
    pub fn unresolved(&self) -> Vec<ConflictRecord> {
        let mut records: Vec<_> = self
            .ledger
            .lock()
            .conflicts()
            .filter(|c| !c.is_resolved())
            .cloned()
            .collect();
        records.sort_by_key(|c| c.detected_at);
        records
    }

    /// Every record, resolved ones included.
    pub fn all(&self) -> Vec<ConflictRecord> {
        self.ledger.lock().conflicts().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use chrono::TimeZone;
    use wayfare_sync_protocol::{
        ConflictStrategy, EntitySnapshot, EntityType, OperationKind, Priority, QueueStatus,
        SyncQueueEntry,
    };

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn record(key: EntityKey, remote_version: u64) -> ConflictRecord {
        let base = EntitySnapshot::new(key, t(10)).with_field("name", "Rome");
        ConflictRecord::new(
            base.edited("name", "local", t(20)),
            base.edited("name", "remote", t(30)),
            remote_version,
            "srv-1".into(),
            Some(t(10)),
            ConflictStrategy::Manual,
            t(31),
        )
    }

    #[test]
    fn record_blocks_entry_atomically() {
        let shared = Ledger::in_memory().unwrap().into_shared();
        let conflicts = ConflictLedger::new(shared.clone());

        let key = EntityKey::generate(EntityType::Trip);
        let mut entry = SyncQueueEntry::new(
            OperationKind::Update,
            EntitySnapshot::new(key, t(20)).with_field("name", "local"),
            Priority::Normal,
            t(20),
        );
        entry.status = QueueStatus::InFlight;
        shared
            .lock()
            .commit(vec![LedgerRecord::PutEntry(entry.clone())])
            .unwrap();

        let id = conflicts.record(record(key, 2), Some(entry.id)).unwrap();
        let stored = shared.lock().entry(&entry.id).cloned().unwrap();
        assert!(stored.blocked);
        assert_eq!(stored.status, QueueStatus::Pending);
        assert_eq!(conflicts.unresolved_for(&key).unwrap().id, id);
    }

    #[test]
    fn newer_remote_refreshes_open_record() {
        let conflicts = ConflictLedger::new(Ledger::in_memory().unwrap().into_shared());
        let key = EntityKey::generate(EntityType::Trip);

        let first = conflicts.record(record(key, 2), None).unwrap();
        let second = conflicts.record(record(key, 5), None).unwrap();
        assert_eq!(first, second);
        assert_eq!(conflicts.unresolved().len(), 1);
        assert_eq!(conflicts.get(&first).unwrap().remote_version, 5);
    }

    #[test]
    fn settle_only_once() {
        let conflicts = ConflictLedger::new(Ledger::in_memory().unwrap().into_shared());
        let id = conflicts
            .record(record(EntityKey::generate(EntityType::Trip), 2), None)
            .unwrap();

        conflicts.settle(&id, ConflictOutcome::UserChoice, t(40)).unwrap();
        assert!(conflicts.unresolved().is_empty());
        assert!(matches!(
            conflicts.settle(&id, ConflictOutcome::UserChoice, t(41)),
            Err(SyncError::AlreadyResolved(_))
        ));
        assert_eq!(conflicts.all().len(), 1);
    }

    #[test]
    fn automatic_resolutions_are_kept_as_history() {
        let conflicts = ConflictLedger::new(Ledger::in_memory().unwrap().into_shared());
        let key = EntityKey::generate(EntityType::Trip);

        let settled = conflicts
            .record_resolved(record(key, 3), ConflictOutcome::AcceptedRemote, t(32))
            .unwrap();

        let stored = conflicts.get(&settled.id).unwrap();
        assert_eq!(stored.outcome, ConflictOutcome::AcceptedRemote);
        assert_eq!(stored.resolved_at, Some(t(32)));
        assert!(conflicts.unresolved_for(&key).is_none());
        assert_eq!(conflicts.all().len(), 1);
    }
}
