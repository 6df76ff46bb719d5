//! Durable offline queue.
//!
//! [`QueueManager`] owns the lifecycle of [`SyncQueueEntry`] values:
//! coalescing on enqueue, eligibility and dependency ordering on dequeue,
//! and the bookkeeping that follows each delivery attempt. Every mutation
//! is one ledger commit, so a crash leaves either the old or the new state.
//!
//! # Invariants
//!
//! - At most one entry exists per entity key.
//! - An entry is dequeued only if it is pending, unblocked, under the
//!   attempt limit and past its backoff delay.
//! - A child whose parent still has an unsent create entry is returned
//!   only after that parent, in the same batch.

use crate::clock::{to_chrono, Clock};
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::ledger::{LedgerRecord, LedgerStats, SharedLedger};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wayfare_sync_protocol::{
    CoalesceOutcome, EntityKey, EntitySnapshot, EntryId, OperationKind, Priority, QueueStatus,
    SyncQueueEntry,
};

/// A local mutation to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    /// Mutation kind as seen by the local store.
    pub operation: OperationKind,
    /// State after the mutation.
    pub payload: EntitySnapshot,
    /// Upload priority.
    pub priority: Priority,
    /// Whether the entity already exists remotely.
    pub had_server_id: bool,
}

/// What enqueueing a mutation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was created.
    Queued(EntryId),
    /// The mutation was folded into an existing entry.
    Coalesced(EntryId),
    /// The mutation cancelled the existing entry out.
    Dropped,
    /// Nothing needs to reach the remote (deleting an entity it never saw).
    Skipped,
}

impl EnqueueOutcome {
    /// The entry now carrying the mutation, if any.
    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::Coalesced(id) => Some(*id),
            EnqueueOutcome::Dropped | EnqueueOutcome::Skipped => None,
        }
    }
}

/// Records restoring the queue to its state before an enqueue.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct QueueUndo {
    records: Vec<LedgerRecord>,
}

/// The offline queue.
pub struct QueueManager {
    ledger: SharedLedger,
    clock: Arc<dyn Clock>,
    retry: RwLock<RetryConfig>,
}

impl QueueManager {
    /// Creates a queue over `ledger`.
    pub fn new(ledger: SharedLedger, clock: Arc<dyn Clock>, retry: RetryConfig) -> Self {
        Self {
            ledger,
            clock,
            retry: RwLock::new(retry),
        }
    }

    /// Replaces the retry policy.
    pub fn set_retry(&self, retry: RetryConfig) {
        *self.retry.write() = retry;
    }

    /// The retry policy in effect.
    pub fn retry_config(&self) -> RetryConfig {
        *self.retry.read()
    }

    /// Queues one mutation.
    pub fn enqueue(&self, mutation: PendingMutation) -> SyncResult<EnqueueOutcome> {
        let (mut outcomes, _undo) = self.enqueue_all(vec![mutation])?;
        Ok(outcomes.remove(0))
    }

    /// Queues several mutations as one atomic batch.
    ///
    /// Mutations of the same entity coalesce in order. The returned
    /// [`QueueUndo`] reverts the batch if the caller's own write fails.
    pub fn enqueue_all(
        &self,
        mutations: Vec<PendingMutation>,
    ) -> SyncResult<(Vec<EnqueueOutcome>, QueueUndo)> {
        let now = self.clock.now();
        let mut ledger = self.ledger.lock();

        let mut order: Vec<EntityKey> = Vec::new();
        let mut original: HashMap<EntityKey, Option<SyncQueueEntry>> = HashMap::new();
        let mut working: HashMap<EntityKey, Option<SyncQueueEntry>> = HashMap::new();
        let mut outcomes = Vec::with_capacity(mutations.len());

        for mutation in mutations {
            let key = mutation.payload.key;
            if !original.contains_key(&key) {
                let existing = ledger.entry_for_key(&key).cloned();
                original.insert(key, existing.clone());
                working.insert(key, existing);
                order.push(key);
            }

            let current = working.get(&key).cloned().flatten();
            let (next, outcome) = match current {
                Some(mut entry) => match entry.coalesce(
                    mutation.operation,
                    mutation.payload,
                    mutation.priority,
                    mutation.had_server_id,
                ) {
                    CoalesceOutcome::Kept => {
                        let id = entry.id;
                        (Some(entry), EnqueueOutcome::Coalesced(id))
                    }
                    CoalesceOutcome::Dropped => (None, EnqueueOutcome::Dropped),
                },
                None if mutation.operation == OperationKind::Delete && !mutation.had_server_id => {
                    (None, EnqueueOutcome::Skipped)
                }
                None => {
                    let entry = SyncQueueEntry::new(
                        mutation.operation,
                        mutation.payload,
                        mutation.priority,
                        now,
                    );
                    let id = entry.id;
                    (Some(entry), EnqueueOutcome::Queued(id))
                }
            };
            debug!(entity = %key, ?outcome, "mutation queued");
            working.insert(key, next);
            outcomes.push(outcome);
        }

        let mut records = Vec::new();
        let mut undo = Vec::new();
        for key in order {
            let before = original.remove(&key).flatten();
            let after = working.remove(&key).flatten();
            match (before, after) {
                (Some(before), Some(after)) => {
                    records.push(LedgerRecord::PutEntry(after));
                    undo.push(LedgerRecord::PutEntry(before));
                }
                (Some(before), None) => {
                    records.push(LedgerRecord::RemoveEntry(before.id));
                    undo.push(LedgerRecord::PutEntry(before));
                }
                (None, Some(after)) => {
                    undo.push(LedgerRecord::RemoveEntry(after.id));
                    records.push(LedgerRecord::PutEntry(after));
                }
                (None, None) => {}
            }
        }

        ledger.commit(records)?;
        Ok((outcomes, QueueUndo { records: undo }))
    }

    /// Reverts an enqueue.
    pub fn rollback(&self, undo: QueueUndo) -> SyncResult<()> {
        if undo.records.is_empty() {
            return Ok(());
        }
        warn!(records = undo.records.len(), "rolling back queued mutations");
        self.ledger.lock().commit(undo.records)
    }

    /// Takes up to `max` eligible entries and marks them in flight.
    ///
    /// Entries in `exclude` are skipped; the engine passes the entries it
    /// already attempted during the current run. The result is ordered by
    /// priority, then age, with every parent ahead of its children.
    pub fn dequeue_batch(
        &self,
        max: usize,
        exclude: &HashSet<EntryId>,
    ) -> SyncResult<Vec<SyncQueueEntry>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let retry = self.retry_config();
        let mut ledger = self.ledger.lock();

        let mut candidates: Vec<SyncQueueEntry> = ledger
            .entries()
            .filter(|e| {
                e.status == QueueStatus::Pending
                    && !e.blocked
                    && retry.allows(e.attempts)
                    && !exclude.contains(&e.id)
                    && e.last_attempt_at.map_or(true, |at| {
                        now >= at + to_chrono(retry.delay_after(e.attempts))
                    })
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        let unsent_parent: HashMap<EntryId, EntryId> = candidates
            .iter()
            .filter_map(|e| {
                let parent = ledger.entry_for_key(&e.parent?)?;
                (parent.operation == OperationKind::Create && parent.status != QueueStatus::Completed)
                    .then_some((e.id, parent.id))
            })
            .collect();

        let mut selected: Vec<SyncQueueEntry> = Vec::new();
        let mut selected_ids: HashSet<EntryId> = HashSet::new();
        loop {
            let before = selected.len();
            candidates.retain(|entry| {
                if selected.len() >= max {
                    return true;
                }
                let ready = unsent_parent
                    .get(&entry.id)
                    .map_or(true, |parent| selected_ids.contains(parent));
                if ready {
                    selected_ids.insert(entry.id);
                    selected.push(entry.clone());
                }
                !ready
            });
            if selected.len() == before || selected.len() >= max || candidates.is_empty() {
                break;
            }
        }

        for entry in &mut selected {
            entry.status = QueueStatus::InFlight;
            entry.last_attempt_at = Some(now);
        }
        ledger.commit(
            selected
                .iter()
                .cloned()
                .map(LedgerRecord::PutEntry)
                .collect(),
        )?;

        if !selected.is_empty() {
            debug!(count = selected.len(), "dequeued batch");
        }
        Ok(selected)
    }

    /// Removes an acknowledged entry.
    ///
    /// If the entry was coalesced while in flight its revision no longer
    /// matches `dispatched_revision`; it then returns to pending carrying
    /// the newer payload and this returns `true`.
    pub fn mark_completed(&self, id: &EntryId, dispatched_revision: u64) -> SyncResult<bool> {
        let mut ledger = self.ledger.lock();
        let Some(mut entry) = ledger.entry(id).cloned() else {
            return Ok(false);
        };

        if entry.revision == dispatched_revision {
            ledger.commit(vec![LedgerRecord::RemoveEntry(*id)])?;
            return Ok(false);
        }

        if entry.operation == OperationKind::Create {
            entry.operation = OperationKind::Update;
        }
        entry.status = QueueStatus::Pending;
        entry.attempts = 0;
        entry.last_error = None;
        entry.last_attempt_at = None;
        debug!(entry = %entry.id, revision = entry.revision, "entry changed in flight; requeued");
        ledger.commit(vec![LedgerRecord::PutEntry(entry)])?;
        Ok(true)
    }

    /// Records a failed attempt and returns the entry's new status.
    pub fn mark_failed(&self, id: &EntryId, error: &str) -> SyncResult<QueueStatus> {
        let retry = self.retry_config();
        let entry = self.update(id, |entry| {
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            entry.status = if retry.allows(entry.attempts) {
                QueueStatus::Pending
            } else {
                QueueStatus::Failed
            };
        })?;
        if entry.status == QueueStatus::Failed {
            warn!(entry = %entry.id, entity = %entry.key, attempts = entry.attempts, error, "entry gave up");
        }
        Ok(entry.status)
    }

    /// Fails an entry permanently; the remote will never accept it as is.
    pub fn mark_rejected(&self, id: &EntryId, error: &str) -> SyncResult<()> {
        let entry = self.update(id, |entry| {
            entry.status = QueueStatus::Failed;
            entry.last_error = Some(error.to_string());
        })?;
        warn!(entry = %entry.id, entity = %entry.key, error, "entry rejected");
        Ok(())
    }

    /// Returns an in-flight entry to pending without consuming an attempt.
    pub fn release(&self, id: &EntryId) -> SyncResult<()> {
        self.update(id, |entry| {
            if entry.status == QueueStatus::InFlight {
                entry.status = QueueStatus::Pending;
            }
            entry.last_attempt_at = None;
        })?;
        Ok(())
    }

    /// Resets a failed entry for another round of attempts.
    pub fn retry(&self, id: &EntryId) -> SyncResult<()> {
        let entry = self.update(id, reset_for_retry)?;
        info!(entry = %entry.id, entity = %entry.key, "entry retried by user");
        Ok(())
    }

    /// Resets every failed entry; returns their ids.
    pub fn retry_all_failed(&self) -> SyncResult<Vec<EntryId>> {
        let mut ledger = self.ledger.lock();
        let reset: Vec<SyncQueueEntry> = ledger
            .entries()
            .filter(|e| e.status == QueueStatus::Failed)
            .cloned()
            .map(|mut e| {
                reset_for_retry(&mut e);
                e
            })
            .collect();
        let ids = reset.iter().map(|e| e.id).collect();
        ledger.commit(reset.into_iter().map(LedgerRecord::PutEntry).collect())?;
        Ok(ids)
    }

    /// Holds an entry back until [`unblock`](Self::unblock).
    pub fn block(&self, id: &EntryId) -> SyncResult<()> {
        self.update(id, block_entry)?;
        Ok(())
    }

    /// Lets a blocked entry be dequeued again.
    pub fn unblock(&self, id: &EntryId) -> SyncResult<()> {
        self.update(id, |entry| entry.blocked = false)?;
        Ok(())
    }

    /// Puts an entry back in line after a conflict, optionally with a new
    /// payload. The revision moves so the next push is a new request.
    pub fn requeue(&self, id: &EntryId, payload: Option<EntitySnapshot>) -> SyncResult<()> {
        self.update(id, |entry| {
            if let Some(payload) = payload {
                entry.parent = payload.parent;
                entry.payload = payload;
            }
            if entry.operation == OperationKind::Create {
                entry.operation = OperationKind::Update;
            }
            entry.status = QueueStatus::Pending;
            entry.blocked = false;
            entry.attempts = 0;
            entry.last_error = None;
            entry.last_attempt_at = None;
            entry.revision += 1;
        })?;
        Ok(())
    }

    /// Deletes an entry outright.
    pub fn discard(&self, id: &EntryId) -> SyncResult<()> {
        let mut ledger = self.ledger.lock();
        if ledger.entry(id).is_some() {
            ledger.commit(vec![LedgerRecord::RemoveEntry(*id)])?;
        }
        Ok(())
    }

    /// Returns every in-flight entry to pending. Called on cold start.
    pub fn recover(&self) -> SyncResult<usize> {
        let mut ledger = self.ledger.lock();
        let stranded: Vec<LedgerRecord> = ledger
            .entries()
            .filter(|e| e.status == QueueStatus::InFlight)
            .cloned()
            .map(|mut e| {
                e.status = QueueStatus::Pending;
                LedgerRecord::PutEntry(e)
            })
            .collect();
        let count = stranded.len();
        ledger.commit(stranded)?;
        if count > 0 {
            info!(count, "recovered in-flight entries");
        }
        Ok(count)
    }

    /// An entry by id.
    pub fn entry(&self, id: &EntryId) -> Option<SyncQueueEntry> {
        self.ledger.lock().entry(id).cloned()
    }

    /// The entry queued for an entity.
    pub fn entry_for(&self, key: &EntityKey) -> Option<SyncQueueEntry> {
        self.ledger.lock().entry_for_key(key).cloned()
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Vec<SyncQueueEntry> {
        let mut entries: Vec<_> = self.ledger.lock().entries().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        entries
    }

    /// Entries that gave up.
    pub fn failed(&self) -> Vec<SyncQueueEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.status == QueueStatus::Failed)
            .collect()
    }

    /// Entries still waiting to be delivered.
    pub fn pending_count(&self) -> usize {
        self.ledger
            .lock()
            .entries()
            .filter(|e| e.is_non_terminal())
            .count()
    }

    /// Total entries, failed ones included.
    pub fn len(&self) -> usize {
        self.ledger.lock().entries().count()
    }

    /// Returns true if the queue holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ledger statistics.
    pub fn stats(&self) -> LedgerStats {
        self.ledger.lock().stats()
    }

    fn update<F>(&self, id: &EntryId, f: F) -> SyncResult<SyncQueueEntry>
    where
        F: FnOnce(&mut SyncQueueEntry),
    {
        let mut ledger = self.ledger.lock();
        let mut entry = ledger
            .entry(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("queue entry {id}")))?;
        f(&mut entry);
        ledger.commit(vec![LedgerRecord::PutEntry(entry.clone())])?;
        Ok(entry)
    }
}

fn reset_for_retry(entry: &mut SyncQueueEntry) {
    if entry.status != QueueStatus::InFlight {
        entry.status = QueueStatus::Pending;
    }
    entry.attempts = 0;
    entry.last_error = None;
    entry.last_attempt_at = None;
}

pub(crate) fn block_entry(entry: &mut SyncQueueEntry) {
    entry.blocked = true;
    if entry.status == QueueStatus::InFlight {
        entry.status = QueueStatus::Pending;
        entry.last_attempt_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::Ledger;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::time::Duration;
    use wayfare_journal::InMemoryBackend;
    use wayfare_sync_protocol::EntityType;

    struct Fixture {
        clock: Arc<ManualClock>,
        queue: QueueManager,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_000, 0).unwrap()));
        let ledger = Ledger::in_memory().unwrap().into_shared();
        let retry = RetryConfig::new(3)
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(60));
        let queue = QueueManager::new(ledger, clock.clone(), retry);
        Fixture { clock, queue }
    }

    fn snapshot(ty: EntityType, parent: Option<EntityKey>) -> EntitySnapshot {
        let mut s = EntitySnapshot::new(EntityKey::generate(ty), Utc.timestamp_opt(1_000, 0).unwrap())
            .with_field("name", "x")
            .with_field("uri", "file:///x.jpg");
        s.parent = parent;
        s
    }

    fn mutation(op: OperationKind, payload: EntitySnapshot) -> PendingMutation {
        PendingMutation {
            operation: op,
            payload,
            priority: Priority::Normal,
            had_server_id: false,
        }
    }

    fn create(queue: &QueueManager, payload: EntitySnapshot) -> EntryId {
        queue
            .enqueue(mutation(OperationKind::Create, payload))
            .unwrap()
            .entry_id()
            .unwrap()
    }

    #[test]
    fn create_update_delete_coalesce_to_nothing() {
        let f = fixture();
        let trip = snapshot(EntityType::Trip, None);
        let id = create(&f.queue, trip.clone());

        let updated = trip.edited("name", "y", Utc.timestamp_opt(1_001, 0).unwrap());
        assert_eq!(
            f.queue
                .enqueue(mutation(OperationKind::Update, updated.clone()))
                .unwrap(),
            EnqueueOutcome::Coalesced(id)
        );
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.queue.entry(&id).unwrap().payload, updated);

        assert_eq!(
            f.queue
                .enqueue(mutation(OperationKind::Delete, updated.tombstone(Utc::now())))
                .unwrap(),
            EnqueueOutcome::Dropped
        );
        assert!(f.queue.is_empty());
    }

    #[test]
    fn delete_of_never_synced_entity_is_skipped() {
        let f = fixture();
        let trip = snapshot(EntityType::Trip, None);
        assert_eq!(
            f.queue
                .enqueue(mutation(OperationKind::Delete, trip.tombstone(Utc::now())))
                .unwrap(),
            EnqueueOutcome::Skipped
        );
        assert!(f.queue.is_empty());
    }

    #[test]
    fn rollback_restores_previous_state() {
        let f = fixture();
        let trip = snapshot(EntityType::Trip, None);
        let id = create(&f.queue, trip.clone());

        let memory = snapshot(EntityType::Memory, Some(trip.key));
        let (outcomes, undo) = f
            .queue
            .enqueue_all(vec![
                mutation(OperationKind::Update, trip.edited("name", "z", Utc::now())),
                mutation(OperationKind::Create, memory.clone()),
            ])
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(f.queue.len(), 2);

        f.queue.rollback(undo).unwrap();
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.queue.entry(&id).unwrap().payload, trip);
        assert!(f.queue.entry_for(&memory.key).is_none());
    }

    #[test]
    fn dequeue_orders_by_priority_then_age() {
        let f = fixture();
        let low = create(&f.queue, snapshot(EntityType::Trip, None));
        f.clock.advance(Duration::from_secs(1));
        let older = create(&f.queue, snapshot(EntityType::Trip, None));
        f.clock.advance(Duration::from_secs(1));
        let newer = create(&f.queue, snapshot(EntityType::Trip, None));
        let urgent = f
            .queue
            .enqueue(PendingMutation {
                priority: Priority::High,
                ..mutation(OperationKind::Create, snapshot(EntityType::Trip, None))
            })
            .unwrap()
            .entry_id()
            .unwrap();
        f.queue
            .update(&low, |e| e.priority = Priority::Low)
            .unwrap();

        let batch: Vec<_> = f
            .queue
            .dequeue_batch(10, &HashSet::new())
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(batch, vec![urgent, older, newer, low]);
        assert!(f
            .queue
            .entries()
            .iter()
            .all(|e| e.status == QueueStatus::InFlight));
    }

    #[test]
    fn child_waits_for_parent_create() {
        let f = fixture();
        let trip = snapshot(EntityType::Trip, None);
        let memory = snapshot(EntityType::Memory, Some(trip.key));

        let memory_id = f
            .queue
            .enqueue(PendingMutation {
                priority: Priority::High,
                ..mutation(OperationKind::Create, memory)
            })
            .unwrap()
            .entry_id()
            .unwrap();
        f.clock.advance(Duration::from_secs(1));
        let trip_id = create(&f.queue, trip);

        let batch: Vec<_> = f
            .queue
            .dequeue_batch(10, &HashSet::new())
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(batch, vec![trip_id, memory_id]);
    }

    #[test]
    fn child_is_held_when_parent_is_not_in_batch() {
        let f = fixture();
        let trip = snapshot(EntityType::Trip, None);
        let trip_id = create(&f.queue, trip.clone());
        let memory_id = create(&f.queue, snapshot(EntityType::Memory, Some(trip.key)));

        let excluded: HashSet<_> = [trip_id].into_iter().collect();
        assert!(f.queue.dequeue_batch(10, &excluded).unwrap().is_empty());

        let batch = f.queue.dequeue_batch(1, &HashSet::new()).unwrap();
        assert_eq!(batch[0].id, trip_id);
        assert!(f
            .queue
            .dequeue_batch(10, &HashSet::new())
            .unwrap()
            .is_empty());

        f.queue.mark_completed(&trip_id, 0).unwrap();
        let batch = f.queue.dequeue_batch(10, &HashSet::new()).unwrap();
        assert_eq!(batch[0].id, memory_id);
    }

    #[test]
    fn failures_back_off_then_give_up() {
        let f = fixture();
        let id = create(&f.queue, snapshot(EntityType::Trip, None));
        let none = HashSet::new();

        f.queue.dequeue_batch(1, &none).unwrap();
        assert_eq!(f.queue.mark_failed(&id, "timeout").unwrap(), QueueStatus::Pending);
        assert!(f.queue.dequeue_batch(1, &none).unwrap().is_empty());

        f.clock.advance(Duration::from_secs(19));
        assert!(f.queue.dequeue_batch(1, &none).unwrap().is_empty());
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.queue.dequeue_batch(1, &none).unwrap().len(), 1);
        assert_eq!(f.queue.mark_failed(&id, "timeout").unwrap(), QueueStatus::Pending);

        f.clock.advance(Duration::from_secs(39));
        assert!(f.queue.dequeue_batch(1, &none).unwrap().is_empty());
        f.clock.advance(Duration::from_secs(1));
        assert_eq!(f.queue.dequeue_batch(1, &none).unwrap().len(), 1);
        assert_eq!(f.queue.mark_failed(&id, "timeout").unwrap(), QueueStatus::Failed);

        f.clock.advance(Duration::from_secs(3_600));
        assert!(f.queue.dequeue_batch(1, &none).unwrap().is_empty());

        f.queue.retry(&id).unwrap();
        let entry = f.queue.entry(&id).unwrap();
        assert_eq!((entry.status, entry.attempts), (QueueStatus::Pending, 0));
        assert_eq!(f.queue.dequeue_batch(1, &none).unwrap().len(), 1);
    }

    #[test]
    fn rejected_entries_fail_immediately() {
        let f = fixture();
        let id = create(&f.queue, snapshot(EntityType::Trip, None));
        f.queue.dequeue_batch(1, &HashSet::new()).unwrap();
        f.queue.mark_rejected(&id, "schema").unwrap();

        assert_eq!(f.queue.failed().len(), 1);
        assert_eq!(f.queue.retry_all_failed().unwrap(), vec![id]);
        assert!(f.queue.failed().is_empty());
    }

    #[test]
    fn release_keeps_attempts() {
        let f = fixture();
        let id = create(&f.queue, snapshot(EntityType::Trip, None));
        f.queue.dequeue_batch(1, &HashSet::new()).unwrap();
        f.queue.release(&id).unwrap();

        let entry = f.queue.entry(&id).unwrap();
        assert_eq!((entry.status, entry.attempts), (QueueStatus::Pending, 0));
        assert_eq!(f.queue.dequeue_batch(1, &HashSet::new()).unwrap().len(), 1);
    }

    #[test]
    fn edit_while_in_flight_is_not_lost() {
        let f = fixture();
        let trip = snapshot(EntityType::Trip, None);
        let id = create(&f.queue, trip.clone());
        let dispatched = f.queue.dequeue_batch(1, &HashSet::new()).unwrap().remove(0);

        let edited = trip.edited("name", "late edit", Utc::now());
        f.queue
            .enqueue(mutation(OperationKind::Update, edited.clone()))
            .unwrap();

        assert!(f.queue.mark_completed(&id, dispatched.revision).unwrap());
        let entry = f.queue.entry(&id).unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.operation, OperationKind::Update);
        assert_eq!(entry.payload, edited);
    }

    #[test]
    fn blocked_entries_are_skipped() {
        let f = fixture();
        let id = create(&f.queue, snapshot(EntityType::Trip, None));
        f.queue.block(&id).unwrap();
        assert!(f.queue.dequeue_batch(5, &HashSet::new()).unwrap().is_empty());
        f.queue.unblock(&id).unwrap();
        assert_eq!(f.queue.dequeue_batch(5, &HashSet::new()).unwrap().len(), 1);
    }

    #[test]
    fn recover_resets_in_flight_after_restart() {
        let backend = InMemoryBackend::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc.timestamp_opt(0, 0).unwrap()));
        let id = {
            let ledger = Ledger::open(Box::new(backend.clone()), 100)
                .unwrap()
                .into_shared();
            let queue = QueueManager::new(ledger, clock.clone(), RetryConfig::default());
            let id = create(&queue, snapshot(EntityType::Trip, None));
            queue.dequeue_batch(1, &HashSet::new()).unwrap();
            id
        };

        let ledger = Ledger::open(Box::new(backend), 100).unwrap().into_shared();
        let queue = QueueManager::new(ledger, clock, RetryConfig::default());
        assert_eq!(queue.entry(&id).unwrap().status, QueueStatus::InFlight);
        assert_eq!(queue.recover().unwrap(), 1);
        assert_eq!(queue.entry(&id).unwrap().status, QueueStatus::Pending);
    }

    #[test]
    fn failed_journal_write_leaves_queue_unchanged() {
        let backend = InMemoryBackend::new();
        let ledger = Ledger::open(Box::new(backend.clone()), 100)
            .unwrap()
            .into_shared();
        let queue = QueueManager::new(ledger, Arc::new(crate::clock::SystemClock), RetryConfig::default());

        backend.set_reject_writes(true);
        let result = queue.enqueue(mutation(OperationKind::Create, snapshot(EntityType::Trip, None)));
        assert!(matches!(result, Err(SyncError::Ledger(_))));
        assert!(queue.is_empty());
    }

    fn op_strategy() -> impl Strategy<Value = OperationKind> {
        prop_oneof![
            Just(OperationKind::Create),
            Just(OperationKind::Update),
            Just(OperationKind::Delete),
        ]
    }

    proptest! {
        #[test]
        fn one_entry_per_entity(ops in prop::collection::vec((0usize..3, op_strategy(), any::<bool>()), 1..40)) {
            let f = fixture();
            let keys: Vec<_> = (0..3).map(|_| snapshot(EntityType::Trip, None)).collect();
            for (which, op, server) in ops {
                f.queue.enqueue(PendingMutation {
                    had_server_id: server,
                    ..mutation(op, keys[which].clone())
                }).unwrap();
                if server && which == 0 {
                    f.queue.dequeue_batch(1, &HashSet::new()).unwrap();
                }
            }
            let entries = f.queue.entries();
            let distinct: HashSet<_> = entries.iter().map(|e| e.key).collect();
            prop_assert_eq!(distinct.len(), entries.len());
        }
    }
}
