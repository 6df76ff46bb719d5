//! Local object store interface.
//!
//! The engine never owns entity data. It reads and writes entities and
//! their [`EntitySyncMeta`](wayfare_sync_protocol::EntitySyncMeta) through
//! [`LocalStore`], whose writes must be atomic per call.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use wayfare_sync_protocol::{EntityKey, StoredEntity};

/// Persistence for entities and their sync metadata.
pub trait LocalStore: Send + Sync {
    /// Loads an entity.
    fn load(&self, key: &EntityKey) -> StoreResult<Option<StoredEntity>>;

    /// Writes entities with their metadata in one atomic step.
    fn apply_merged(&self, entities: &[StoredEntity]) -> StoreResult<()>;

    /// Entities modified after `since`, plus every entity flagged
    /// `needs_sync`. `None` lists everything.
    fn list_modified_since(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<StoredEntity>>;
}

/// An in-memory local store.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entities: RwLock<BTreeMap<EntityKey, StoredEntity>>,
    failure: RwLock<Option<StoreError>>,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with `error` until cleared.
    pub fn fail_writes(&self, error: Option<StoreError>) {
        *self.failure.write() = error;
    }

    /// Returns an entity without going through the trait.
    pub fn get(&self, key: &EntityKey) -> Option<StoredEntity> {
        self.entities.read().get(key).cloned()
    }

    /// All stored entities in key order.
    pub fn entities(&self) -> Vec<StoredEntity> {
        self.entities.read().values().cloned().collect()
    }

    /// Number of stored entities, tombstones included.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns true if the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}

impl LocalStore for MemoryLocalStore {
    fn load(&self, key: &EntityKey) -> StoreResult<Option<StoredEntity>> {
        Ok(self.entities.read().get(key).cloned())
    }

    fn apply_merged(&self, entities: &[StoredEntity]) -> StoreResult<()> {
        if let Some(error) = self.failure.read().clone() {
            return Err(error);
        }
        let mut map = self.entities.write();
        for entity in entities {
            map.insert(entity.snapshot.key, entity.clone());
        }
        Ok(())
    }

    fn list_modified_since(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<StoredEntity>> {
        Ok(self
            .entities
            .read()
            .values()
            .filter(|e| {
                e.meta.needs_sync || since.map_or(true, |since| e.snapshot.updated_at > since)
            })
            .cloned()
            .collect())
    }
}
