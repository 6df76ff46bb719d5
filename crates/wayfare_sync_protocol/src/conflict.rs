//! Conflict records and resolution.
//!
//! [`resolve`] is a pure function of its inputs: the same local snapshot,
//! remote snapshot, baseline and strategy always produce the same
//! [`Resolution`], whichever device runs it and in whatever order the
//! changes arrived.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use wayfare_sync_protocol::{resolve, ConflictStrategy, EntityKey, EntitySnapshot, EntityType, Resolution};
//!
//! let t = |s| Utc.timestamp_opt(s, 0).unwrap();
//! let base = EntitySnapshot::new(EntityKey::generate(EntityType::Trip), t(10))
//!     .with_field("name", "Iceland");
//! let local = base.edited("name", "Iceland (local)", t(20));
//! let remote = base.edited("name", "Iceland (remote)", t(30));
//!
//! let outcome = resolve(&local, &remote, Some(t(10)), ConflictStrategy::NewerWins);
//! assert_eq!(outcome, Resolution::AcceptRemote);
//! ```

use crate::cursor::RouteId;
use crate::entity::{EntityKey, EntitySnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// How a conflict between a local and a remote edit is settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Remote state always wins.
    ServerWins,
    /// Local state always wins.
    ClientWins,
    /// Latest `updated_at` wins; ties go to the remote.
    #[default]
    NewerWins,
    /// Left for the user to decide.
    Manual,
    /// Field-level merge against the last synced baseline.
    Merge,
}

impl ConflictStrategy {
    /// Whether the strategy settles conflicts without user input.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictStrategy::Manual)
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::ClientWins => "client_wins",
            ConflictStrategy::NewerWins => "newer_wins",
            ConflictStrategy::Manual => "manual",
            ConflictStrategy::Merge => "merge",
        })
    }
}

/// Result of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Apply the remote state locally and drop the pending local change.
    AcceptRemote,
    /// Keep the local state and push it again on top of the remote version.
    KeepLocal,
    /// Apply this merged state locally and push it.
    Merged(EntitySnapshot),
    /// Persist the conflict and wait for the user.
    Deferred,
}

/// Resolves a conflict between `local` and `remote`.
///
/// `baseline` is the remote `updated_at` both sides last agreed on; `None`
/// means the entity was never synced.
pub fn resolve(
    local: &EntitySnapshot,
    remote: &EntitySnapshot,
    baseline: Option<DateTime<Utc>>,
    strategy: ConflictStrategy,
) -> Resolution {
    match strategy {
        ConflictStrategy::ServerWins => Resolution::AcceptRemote,
        ConflictStrategy::ClientWins => Resolution::KeepLocal,
        ConflictStrategy::NewerWins => newer_wins(local, remote),
        ConflictStrategy::Manual => Resolution::Deferred,
        ConflictStrategy::Merge => merge(local, remote, baseline),
    }
}

fn newer_wins(local: &EntitySnapshot, remote: &EntitySnapshot) -> Resolution {
    if local.updated_at > remote.updated_at {
        Resolution::KeepLocal
    } else {
        Resolution::AcceptRemote
    }
}

fn merge(
    local: &EntitySnapshot,
    remote: &EntitySnapshot,
    baseline: Option<DateTime<Utc>>,
) -> Resolution {
    if local.deleted || remote.deleted {
        return newer_wins(local, remote);
    }

    let names: BTreeSet<&String> = local.fields.keys().chain(remote.fields.keys()).collect();

    let mut fields = Map::new();
    let mut field_updated_at = BTreeMap::new();
    for name in names {
        let local_changed = local.field_changed_since(name, baseline);
        let remote_changed = remote.field_changed_since(name, baseline);
        let take_local = match (local_changed, remote_changed) {
            (true, false) => true,
            (false, true) | (false, false) => false,
            (true, true) => local.field_time(name) > remote.field_time(name),
        };
        let source = if take_local { local } else { remote };
        if let Some(value) = source.fields.get(name.as_str()) {
            fields.insert(name.clone(), value.clone());
            field_updated_at.insert(name.clone(), source.field_time(name));
        }
    }

    if fields == remote.fields {
        return Resolution::AcceptRemote;
    }
    if fields == local.fields {
        return Resolution::KeepLocal;
    }

    let parent = if local.updated_at > remote.updated_at {
        local.parent
    } else {
        remote.parent
    };

    Resolution::Merged(EntitySnapshot {
        key: remote.key,
        parent,
        fields,
        field_updated_at,
        updated_at: local.updated_at.max(remote.updated_at),
        deleted: false,
    })
}

/// Conflict record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Generates a new id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ConflictId {
    type Err = crate::ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::ProtocolError::InvalidId(format!("{s}: {e}")))
    }
}

/// How a recorded conflict ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOutcome {
    /// Waiting for the user.
    Unresolved,
    /// Remote state was applied.
    AcceptedRemote,
    /// Local state was kept and re-queued.
    KeptLocal,
    /// A merged state was applied and queued.
    Merged,
    /// The user picked a snapshot.
    UserChoice,
}

impl From<&Resolution> for ConflictOutcome {
    fn from(resolution: &Resolution) -> Self {
        match resolution {
            Resolution::AcceptRemote => ConflictOutcome::AcceptedRemote,
            Resolution::KeepLocal => ConflictOutcome::KeptLocal,
            Resolution::Merged(_) => ConflictOutcome::Merged,
            Resolution::Deferred => ConflictOutcome::Unresolved,
        }
    }
}

/// A detected conflict.
///
/// Unresolved records block automatic pushes of their entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Record id.
    pub id: ConflictId,
    /// Conflicting entity.
    pub key: EntityKey,
    /// Local state at detection.
    pub local_snapshot: EntitySnapshot,
    /// Remote state at detection.
    pub remote_snapshot: EntitySnapshot,
    /// Remote version at detection.
    pub remote_version: u64,
    /// Remote identifier of the entity.
    pub remote_server_id: String,
    /// Route the remote state came from.
    #[serde(default)]
    pub route: Option<RouteId>,
    /// Last agreed remote `updated_at`.
    pub baseline_synced_at: Option<DateTime<Utc>>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
    /// Strategy in effect at detection.
    pub strategy: ConflictStrategy,
    /// Current outcome.
    pub outcome: ConflictOutcome,
    /// When the conflict was settled.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    /// Creates an unresolved record.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_snapshot: EntitySnapshot,
        remote_snapshot: EntitySnapshot,
        remote_version: u64,
        remote_server_id: String,
        baseline_synced_at: Option<DateTime<Utc>>,
        strategy: ConflictStrategy,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            key: local_snapshot.key,
            local_snapshot,
            remote_snapshot,
            remote_version,
            remote_server_id,
            route: None,
            baseline_synced_at,
            detected_at,
            strategy,
            outcome: ConflictOutcome::Unresolved,
            resolved_at: None,
        }
    }

    /// Tags the record with the route the remote state came from.
    pub fn on_route(mut self, route: RouteId) -> Self {
        self.route = Some(route);
        self
    }

    /// Whether the record has reached a terminal outcome.
    pub fn is_resolved(&self) -> bool {
        self.outcome != ConflictOutcome::Unresolved
    }

    /// Marks the record settled.
    pub fn settle(&mut self, outcome: ConflictOutcome, at: DateTime<Utc>) {
        self.outcome = outcome;
        self.resolved_at = Some(at);
    }
}
