//! Change tracking for local edits.
//!
//! The application commits edits through [`ChangeTracker`] instead of
//! writing the local store directly. Each commit is queued first, in one
//! ledger batch, and then written to the store; a failed store write rolls
//! the queue back, so an edit is either both stored and queued or neither.
//!
//! # Example
//!
//! ```rust,ignore
//! let trip = EntitySnapshot::new(EntityKey::generate(EntityType::Trip), now)
//!     .with_field("name", "Patagonia");
//! tracker.commit(LocalCommit::new().upsert(trip))?;
//! ```

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::queue::{EnqueueOutcome, PendingMutation, QueueManager};
use crate::store::LocalStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};
use wayfare_sync_protocol::{
    EntityKey, EntitySnapshot, EntitySyncMeta, OperationKind, Priority, StoredEntity,
};

/// One local edit.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    /// Create or replace an entity.
    Upsert(EntitySnapshot),
    /// Delete an entity.
    Delete(EntityKey),
}

impl LocalChange {
    /// The entity this change touches.
    pub fn key(&self) -> EntityKey {
        match self {
            LocalChange::Upsert(snapshot) => snapshot.key,
            LocalChange::Delete(key) => *key,
        }
    }
}

/// A set of edits committed together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalCommit {
    /// Edits in application order.
    pub changes: Vec<LocalChange>,
    /// Upload priority of the queued entries.
    pub priority: Priority,
}

impl LocalCommit {
    /// Creates an empty commit with normal priority.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an upsert.
    pub fn upsert(mut self, snapshot: EntitySnapshot) -> Self {
        self.changes.push(LocalChange::Upsert(snapshot));
        self
    }

    /// Adds a delete.
    pub fn delete(mut self, key: EntityKey) -> Self {
        self.changes.push(LocalChange::Delete(key));
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Records local edits in the store and the queue.
pub struct ChangeTracker {
    store: Arc<dyn LocalStore>,
    queue: Arc<QueueManager>,
    clock: Arc<dyn Clock>,
    write_lock: Arc<Mutex<()>>,
}

impl ChangeTracker {
    /// Creates a tracker.
    pub fn new(store: Arc<dyn LocalStore>, queue: Arc<QueueManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            queue,
            clock,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Shares the lock that serializes read-modify-write cycles on the
    /// store with the engine.
    pub fn with_write_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.write_lock = lock;
        self
    }

    /// Applies a commit. Returns one outcome per change.
    pub fn commit(&self, commit: LocalCommit) -> SyncResult<Vec<EnqueueOutcome>> {
        let _write = self.write_lock.lock();
        let now = self.clock.now();
        let mut working: HashMap<EntityKey, StoredEntity> = HashMap::new();
        let mut order: Vec<EntityKey> = Vec::new();
        let mut mutations = Vec::with_capacity(commit.changes.len());

        for change in commit.changes {
            let key = change.key();
            let existing = match working.get(&key) {
                Some(entity) => Some(entity.clone()),
                None => self.store.load(&key)?,
            };
            let meta = existing
                .as_ref()
                .map(|e| e.meta.clone())
                .unwrap_or_default();

            let (operation, snapshot) = match change {
                LocalChange::Upsert(snapshot) => {
                    snapshot.validate()?;
                    let operation = match &existing {
                        Some(e) if !e.snapshot.deleted => OperationKind::Update,
                        _ => OperationKind::Create,
                    };
                    (operation, snapshot)
                }
                LocalChange::Delete(key) => {
                    let current = existing
                        .ok_or_else(|| SyncError::NotFound(format!("entity {key}")))?;
                    (OperationKind::Delete, current.snapshot.tombstone(now))
                }
            };

            mutations.push(PendingMutation {
                operation,
                payload: snapshot.clone(),
                priority: commit.priority,
                had_server_id: meta.server_id.is_some(),
            });
            if !working.contains_key(&key) {
                order.push(key);
            }
            working.insert(key, StoredEntity { snapshot, meta });
        }

        if mutations.is_empty() {
            return Ok(Vec::new());
        }

        let (outcomes, undo) = self.queue.enqueue_all(mutations.clone())?;

        let mut queued: HashMap<EntityKey, bool> = HashMap::new();
        for (mutation, outcome) in mutations.iter().zip(&outcomes) {
            queued.insert(mutation.payload.key, outcome.entry_id().is_some());
        }
        let entities: Vec<StoredEntity> = order
            .into_iter()
            .filter_map(|key| {
                let mut entity = working.remove(&key)?;
                entity.meta.needs_sync = queued.get(&key).copied().unwrap_or(false);
                Some(entity)
            })
            .collect();

        if let Err(store_error) = self.store.apply_merged(&entities) {
            if let Err(rollback_error) = self.queue.rollback(undo) {
                error!(%rollback_error, "queue rollback failed after store write failure");
            }
            return Err(store_error.into());
        }

        debug!(entities = entities.len(), "local commit applied");
        Ok(outcomes)
    }

    /// Restores the link between the store's `needs_sync` flags and the
    /// queue after a crash. Returns the number of entities repaired.
    ///
    /// Entities modified after `since`, or flagged, that have no queue
    /// entry are queued again; flags are corrected to match the queue.
    pub fn rescan(&self, since: Option<DateTime<Utc>>) -> SyncResult<usize> {
        let _write = self.write_lock.lock();
        let candidates = self.store.list_modified_since(since)?;

        let mut mutations = Vec::new();
        let mut flagged: Vec<StoredEntity> = Vec::new();
        for entity in candidates {
            let entry = self.queue.entry_for(&entity.snapshot.key);
            match entry {
                None if entity.modified_since_sync() => {
                    mutations.push(PendingMutation {
                        operation: rescan_operation(&entity.snapshot, &entity.meta),
                        payload: entity.snapshot.clone(),
                        priority: Priority::Normal,
                        had_server_id: entity.meta.server_id.is_some(),
                    });
                    flagged.push(entity);
                }
                None => {}
                Some(entry) if entry.is_non_terminal() != entity.meta.needs_sync => {
                    let mut entity = entity;
                    entity.meta.needs_sync = entry.is_non_terminal();
                    flagged.push(entity);
                }
                Some(_) => {}
            }
        }

        if !mutations.is_empty() {
            let (outcomes, _undo) = self.queue.enqueue_all(mutations.clone())?;
            let requeued: HashMap<EntityKey, bool> = mutations
                .iter()
                .zip(&outcomes)
                .map(|(m, o)| (m.payload.key, o.entry_id().is_some()))
                .collect();
            for entity in &mut flagged {
                if let Some(queued) = requeued.get(&entity.snapshot.key) {
                    entity.meta.needs_sync = *queued;
                }
            }
        }

        let repaired = flagged.len();
        if repaired > 0 {
            self.store.apply_merged(&flagged)?;
            info!(repaired, requeued = mutations.len(), "rescan repaired sync flags");
        }
        Ok(repaired)
    }
}

fn rescan_operation(snapshot: &EntitySnapshot, meta: &EntitySyncMeta) -> OperationKind {
    if snapshot.deleted {
        OperationKind::Delete
    } else if meta.server_id.is_none() {
        OperationKind::Create
    } else {
        OperationKind::Update
    }
}
