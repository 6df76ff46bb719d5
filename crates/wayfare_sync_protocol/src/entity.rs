//! Synced entities and their sync metadata.

use crate::cursor::RouteId;
use crate::error::{ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of synced entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A trip, the root of the hierarchy.
    Trip,
    /// A memory recorded during a trip.
    Memory,
    /// A photo, video or audio clip attached to a memory.
    Media,
}

impl EntityType {
    /// All entity types, parents before children.
    pub const ALL: [EntityType; 3] = [EntityType::Trip, EntityType::Memory, EntityType::Media];

    /// Stable name used in cursors, logs and remote payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Trip => "trip",
            EntityType::Memory => "memory",
            EntityType::Media => "media",
        }
    }

    /// The entity type this one must reference, if any.
    pub fn parent_type(&self) -> Option<EntityType> {
        match self {
            EntityType::Trip => None,
            EntityType::Memory => Some(EntityType::Trip),
            EntityType::Media => Some(EntityType::Memory),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trip" => Ok(EntityType::Trip),
            "memory" => Ok(EntityType::Memory),
            "media" => Ok(EntityType::Media),
            other => Err(ProtocolError::UnknownEntityType(other.to_string())),
        }
    }
}

/// Client-generated entity identifier.
///
/// Remote pushes are upserts keyed by this id, which is what makes a
/// replayed push idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EntityId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ProtocolError::InvalidId(format!("{s}: {e}")))
    }
}

/// Fully qualified entity reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity kind.
    pub entity_type: EntityType,
    /// Entity id.
    pub id: EntityId,
}

impl EntityKey {
    /// Creates a key.
    pub fn new(entity_type: EntityType, id: EntityId) -> Self {
        Self { entity_type, id }
    }

    /// Creates a key with a fresh id.
    pub fn generate(entity_type: EntityType) -> Self {
        Self::new(entity_type, EntityId::new())
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// Serialized entity state.
///
/// Every field carries the time it was last modified so field-level merges
/// can tell which side changed a field since the last agreed baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Which entity this is.
    pub key: EntityKey,
    /// Referenced parent (Memory → Trip, Media → Memory).
    pub parent: Option<EntityKey>,
    /// Field values.
    pub fields: Map<String, Value>,
    /// Per-field modification times.
    pub field_updated_at: BTreeMap<String, DateTime<Utc>>,
    /// Last modification of any field or of the deleted flag.
    pub updated_at: DateTime<Utc>,
    /// Tombstone marker.
    pub deleted: bool,
}

impl EntitySnapshot {
    /// Creates an empty, live snapshot.
    pub fn new(key: EntityKey, updated_at: DateTime<Utc>) -> Self {
        Self {
            key,
            parent: None,
            fields: Map::new(),
            field_updated_at: BTreeMap::new(),
            updated_at,
            deleted: false,
        }
    }

    /// Sets the parent reference.
    pub fn with_parent(mut self, parent: EntityKey) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Sets a field stamped with the snapshot's `updated_at`.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        self.field_updated_at.insert(name.clone(), self.updated_at);
        self.fields.insert(name, value.into());
        self
    }

    /// Returns a copy with `name` set to `value` at time `at`.
    pub fn edited(&self, name: &str, value: impl Into<Value>, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.fields.insert(name.to_string(), value.into());
        next.field_updated_at.insert(name.to_string(), at);
        next.updated_at = next.updated_at.max(at);
        next
    }

    /// Returns a tombstone of this entity deleted at `at`.
    pub fn tombstone(&self, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.deleted = true;
        next.updated_at = next.updated_at.max(at);
        next
    }

    /// Reads a string field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Modification time of `field`, falling back to the entity's.
    pub fn field_time(&self, field: &str) -> DateTime<Utc> {
        self.field_updated_at
            .get(field)
            .copied()
            .unwrap_or(self.updated_at)
    }

    /// Whether `field` was modified after `baseline`.
    ///
    /// With no baseline the entity was never synced, so every field counts
    /// as changed.
    pub fn field_changed_since(&self, field: &str, baseline: Option<DateTime<Utc>>) -> bool {
        match baseline {
            None => true,
            Some(baseline) => self.field_time(field) > baseline,
        }
    }

    /// Checks the snapshot against its entity type's schema.
    pub fn validate(&self) -> ProtocolResult<()> {
        let invalid = |reason: &str| ProtocolError::InvalidEntity {
            entity: self.key.to_string(),
            reason: reason.to_string(),
        };

        match (self.key.entity_type.parent_type(), self.parent) {
            (None, Some(_)) => return Err(invalid("trips cannot have a parent")),
            (Some(expected), Some(parent)) if parent.entity_type != expected => {
                return Err(invalid("parent has the wrong entity type"));
            }
            (Some(_), None) if !self.deleted => return Err(invalid("missing parent reference")),
            _ => {}
        }

        if self.deleted {
            return Ok(());
        }

        let non_empty = |name: &str| self.text(name).is_some_and(|v| !v.trim().is_empty());
        match self.key.entity_type {
            EntityType::Trip if !non_empty("name") => Err(invalid("trip name is required")),
            EntityType::Media if !non_empty("uri") => Err(invalid("media uri is required")),
            _ => Ok(()),
        }
    }
}

/// Where an entity stands on one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteVersion {
    /// Identifier the route assigned.
    pub server_id: String,
    /// Last version acknowledged by or adopted from the route.
    pub sync_version: u64,
}

/// Sync metadata attached to every local entity.
///
/// Routes number versions independently, so pushes and pulls compare
/// against [`version_on`](Self::version_on) for the route in use.
/// `server_id` and `sync_version` summarize all routes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySyncMeta {
    /// Remote identifier, set by the first acknowledged push.
    pub server_id: Option<String>,
    /// Highest version seen on any route. Never decreases.
    pub sync_version: u64,
    /// True while a non-terminal queue entry references this entity.
    pub needs_sync: bool,
    /// Remote `updated_at` of the last exchanged state.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Server id and version per route.
    #[serde(default)]
    pub routes: BTreeMap<RouteId, RouteVersion>,
}

impl EntitySyncMeta {
    /// Version on `route`; zero if the entity never reached it.
    pub fn version_on(&self, route: &RouteId) -> u64 {
        self.routes.get(route).map_or(0, |r| r.sync_version)
    }

    /// Identifier `route` assigned, if the entity reached it.
    pub fn server_id_on(&self, route: &RouteId) -> Option<&str> {
        self.routes.get(route).map(|r| r.server_id.as_str())
    }

    /// Records a state acknowledged by or adopted from `route`.
    pub fn record_exchange(&mut self, route: &RouteId, server_id: &str, version: u64) {
        let slot = self.routes.entry(route.clone()).or_insert_with(|| RouteVersion {
            server_id: server_id.to_string(),
            sync_version: 0,
        });
        slot.server_id = server_id.to_string();
        slot.sync_version = slot.sync_version.max(version);
        if self.server_id.is_none() {
            self.server_id = Some(server_id.to_string());
        }
        self.sync_version = self.sync_version.max(version);
    }
}

/// An entity as held by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntity {
    /// Entity state.
    pub snapshot: EntitySnapshot,
    /// Sync metadata.
    pub meta: EntitySyncMeta,
}

impl StoredEntity {
    /// Whether the local copy diverged from the last synced state.
    pub fn modified_since_sync(&self) -> bool {
        self.meta.needs_sync
            || self
                .meta
                .last_synced_at
                .map_or(true, |synced| self.snapshot.updated_at > synced)
    }
}
