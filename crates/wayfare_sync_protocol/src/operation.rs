//! Queue entries and coalescing.

use crate::entity::{EntityKey, EntitySnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Entity does not exist remotely yet.
    Create,
    /// Entity exists remotely and changed.
    Update,
    /// Entity was deleted locally.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        })
    }
}

/// Upload priority. Higher priorities are dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work such as media metadata.
    Low,
    /// Regular edits.
    #[default]
    Normal,
    /// User-visible edits that should land first.
    High,
}

/// Lifecycle of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be sent.
    Pending,
    /// Handed to a route adapter.
    InFlight,
    /// Gave up; needs an explicit user retry.
    Failed,
    /// Acknowledged by the remote.
    Completed,
}

impl QueueStatus {
    /// Whether the entry still represents outstanding work.
    pub fn is_non_terminal(&self) -> bool {
        matches!(self, QueueStatus::Pending | QueueStatus::InFlight)
    }
}

/// Queue entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Generates a new id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for EntryId {
    type Err = crate::ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::ProtocolError::InvalidId(format!("{s}: {e}")))
    }
}

/// What happened when a mutation was folded into an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceOutcome {
    /// The entry absorbed the mutation and stays queued.
    Kept,
    /// The mutations cancel out (create then delete before any send);
    /// the entry should be removed.
    Dropped,
}

/// A durable pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    /// Entry id.
    pub id: EntryId,
    /// Entity the mutation applies to.
    pub key: EntityKey,
    /// Mutation kind.
    pub operation: OperationKind,
    /// Entity state to send.
    pub payload: EntitySnapshot,
    /// Parent the entity references, for upload ordering.
    pub parent: Option<EntityKey>,
    /// Upload priority.
    pub priority: Priority,
    /// When the first mutation was queued.
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts.
    pub attempts: u32,
    /// When the entry was last handed to a route.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Message of the last failure.
    pub last_error: Option<String>,
    /// Lifecycle state.
    pub status: QueueStatus,
    /// Held back by an unresolved conflict.
    pub blocked: bool,
    /// Bumped every time a mutation is coalesced in.
    pub revision: u64,
}

impl SyncQueueEntry {
    /// Creates a pending entry for a single mutation.
    pub fn new(
        operation: OperationKind,
        payload: EntitySnapshot,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EntryId::new(),
            key: payload.key,
            operation,
            parent: payload.parent,
            payload,
            priority,
            created_at: now,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            status: QueueStatus::Pending,
            blocked: false,
            revision: 0,
        }
    }

    /// Whether the entry still represents outstanding work.
    pub fn is_non_terminal(&self) -> bool {
        self.status.is_non_terminal()
    }

    /// Folds a newer mutation of the same entity into this entry.
    ///
    /// `had_server_id` tells whether the entity already exists remotely.
    /// A failed entry is superseded by the newer edit and becomes pending
    /// again with a fresh attempt budget.
    pub fn coalesce(
        &mut self,
        next: OperationKind,
        payload: EntitySnapshot,
        priority: Priority,
        had_server_id: bool,
    ) -> CoalesceOutcome {
        use OperationKind::{Create, Delete, Update};

        let in_flight = self.status == QueueStatus::InFlight;
        let merged = match (self.operation, next) {
            (Create, Create | Update) => Create,
            (Create, Delete) if !had_server_id && !in_flight => {
                return CoalesceOutcome::Dropped;
            }
            (Create, Delete) => Delete,
            (Update, Update | Create) => Update,
            (Update | Delete, Delete) => Delete,
            (Delete, Create | Update) => {
                if had_server_id {
                    Update
                } else {
                    Create
                }
            }
        };

        self.operation = merged;
        self.parent = payload.parent;
        self.payload = payload;
        self.priority = self.priority.max(priority);
        self.revision += 1;

        if self.status == QueueStatus::Failed {
            self.status = QueueStatus::Pending;
            self.attempts = 0;
            self.last_error = None;
            self.last_attempt_at = None;
        }

        CoalesceOutcome::Kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn snapshot(name: &str) -> EntitySnapshot {
        EntitySnapshot::new(EntityKey::generate(EntityType::Trip), at(1)).with_field("name", name)
    }

    fn entry(op: OperationKind) -> SyncQueueEntry {
        SyncQueueEntry::new(op, snapshot("v1"), Priority::Normal, at(1))
    }

    fn fold(entry: &mut SyncQueueEntry, op: OperationKind, server: bool) -> CoalesceOutcome {
        let mut payload = entry.payload.clone();
        payload.fields.insert("name".into(), "v2".into());
        entry.coalesce(op, payload, Priority::Normal, server)
    }

    #[test]
    fn create_then_update_stays_create_with_latest_payload() {
        let mut e = entry(OperationKind::Create);
        assert_eq!(fold(&mut e, OperationKind::Update, false), CoalesceOutcome::Kept);
        assert_eq!(e.operation, OperationKind::Create);
        assert_eq!(e.payload.text("name"), Some("v2"));
        assert_eq!(e.revision, 1);
    }

    #[test]
    fn update_then_delete_becomes_delete() {
        let mut e = entry(OperationKind::Update);
        fold(&mut e, OperationKind::Delete, true);
        assert_eq!(e.operation, OperationKind::Delete);
    }

    #[test]
    fn unsent_create_then_delete_drops() {
        let mut e = entry(OperationKind::Create);
        assert_eq!(fold(&mut e, OperationKind::Delete, false), CoalesceOutcome::Dropped);
    }

    #[test]
    fn in_flight_create_then_delete_becomes_delete() {
        let mut e = entry(OperationKind::Create);
        e.status = QueueStatus::InFlight;
        assert_eq!(fold(&mut e, OperationKind::Delete, false), CoalesceOutcome::Kept);
        assert_eq!(e.operation, OperationKind::Delete);
        assert_eq!(e.status, QueueStatus::InFlight);
    }

    #[test]
    fn delete_then_create_depends_on_server_id() {
        let mut with_server = entry(OperationKind::Delete);
        fold(&mut with_server, OperationKind::Create, true);
        assert_eq!(with_server.operation, OperationKind::Update);

        let mut without_server = entry(OperationKind::Delete);
        fold(&mut without_server, OperationKind::Create, false);
        assert_eq!(without_server.operation, OperationKind::Create);
    }

    #[test]
    fn failed_entry_is_revived_by_new_edit() {
        let mut e = entry(OperationKind::Update);
        e.status = QueueStatus::Failed;
        e.attempts = 5;
        e.last_error = Some("timeout".into());
        fold(&mut e, OperationKind::Update, true);
        assert_eq!(e.status, QueueStatus::Pending);
        assert_eq!(e.attempts, 0);
        assert!(e.last_error.is_none());
    }

    #[test]
    fn priority_only_rises() {
        let mut e = SyncQueueEntry::new(
            OperationKind::Update,
            snapshot("v1"),
            Priority::High,
            at(1),
        );
        let payload = e.payload.clone();
        e.coalesce(OperationKind::Update, payload, Priority::Low, true);
        assert_eq!(e.priority, Priority::High);
    }

    #[test]
    fn status_terminality() {
        assert!(QueueStatus::Pending.is_non_terminal());
        assert!(QueueStatus::InFlight.is_non_terminal());
        assert!(!QueueStatus::Failed.is_non_terminal());
        assert!(!QueueStatus::Completed.is_non_terminal());
        assert!(Priority::High > Priority::Normal && Priority::Normal > Priority::Low);
    }
}
