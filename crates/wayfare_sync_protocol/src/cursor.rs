//! Pull cursors.
//!
//! A cursor is an exclusive high-water mark over the remote's
//! `(updated_at, entity_id)` ordering for one entity type on one route.
//!
//! # Invariants
//!
//! - A cursor never moves backwards.
//! - It only advances after every change up to the new position has been
//!   merged locally.

use crate::entity::{EntityId, EntityType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Route identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteId(String);

impl RouteId {
    /// Creates a route id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Position in the remote change order.
///
/// Ordered by `updated_at`, then `entity_id`, so that changes sharing a
/// timestamp are neither skipped nor read twice across pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CursorPosition {
    /// Remote storage time.
    pub updated_at: DateTime<Utc>,
    /// Tie-breaker.
    pub entity_id: EntityId,
}

impl CursorPosition {
    /// Creates a position.
    pub fn new(updated_at: DateTime<Utc>, entity_id: EntityId) -> Self {
        Self {
            updated_at,
            entity_id,
        }
    }
}

/// High-water mark for one entity type on one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Tracked entity type.
    pub entity_type: EntityType,
    /// Route the cursor belongs to.
    pub route: RouteId,
    /// Last merged position, `None` before the first pull.
    pub position: Option<CursorPosition>,
    /// Highest remote version merged so far.
    pub last_synced_version: Option<u64>,
}

impl SyncCursor {
    /// Creates a cursor at the beginning of time.
    pub fn new(entity_type: EntityType, route: RouteId) -> Self {
        Self {
            entity_type,
            route,
            position: None,
            last_synced_version: None,
        }
    }

    /// Whether a change at `position` lies beyond this cursor.
    pub fn is_after(&self, position: &CursorPosition) -> bool {
        self.position.map_or(true, |current| *position > current)
    }

    /// Moves the cursor forward.
    ///
    /// Returns `false` and leaves the cursor unchanged when `position`
    /// is not beyond the current one.
    pub fn advance(&mut self, position: CursorPosition, version: Option<u64>) -> bool {
        if !self.is_after(&position) {
            return false;
        }
        self.position = Some(position);
        if let Some(version) = version {
            self.last_synced_version = Some(self.last_synced_version.map_or(version, |v| v.max(version)));
        }
        true
    }
}
