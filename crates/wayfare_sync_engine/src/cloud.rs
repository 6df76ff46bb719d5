//! Route adapter for the platform cloud record store.
//!
//! The record store is a per-user private zone of typed records, read
//! through a zone change feed. [`CloudRecordClient`] abstracts the
//! platform SDK; [`CloudSyncRoute`] maps it onto [`RouteAdapter`].
//!
//! The change feed is paged by opaque change tokens while the engine
//! tracks positions. The route remembers, per entity type, the token that
//! ends at a given position and reuses it only when the engine asks to
//! continue from exactly that position; otherwise it reads the feed from
//! the start and filters by position.

use crate::auth::AuthToken;
use crate::error::{RouteError, RouteResult};
use crate::route::RouteAdapter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};
use wayfare_sync_protocol::{
    CursorPosition, EntityId, EntityKey, EntitySnapshot, EntityType, OperationKind, PullPage,
    PullRequest, PushAck, PushOutcome, PushRequest, RemoteChange, RouteId,
};

/// A record in the private zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudRecord {
    /// Record name, the entity's client id.
    pub record_name: EntityId,
    /// Record type.
    pub record_type: EntityType,
    /// Parent reference.
    pub parent: Option<EntityId>,
    /// Field values.
    pub fields: Map<String, Value>,
    /// Per-field modification times.
    pub field_updated_at: BTreeMap<String, DateTime<Utc>>,
    /// Client modification time.
    pub modified_at: DateTime<Utc>,
    /// Server modification time, set by the store.
    pub server_modified_at: Option<DateTime<Utc>>,
    /// Record version, set by the store.
    pub version: u64,
    /// Tombstone marker.
    pub deleted: bool,
}

impl CloudRecord {
    /// Builds the record for a snapshot.
    pub fn from_snapshot(snapshot: &EntitySnapshot) -> Self {
        Self {
            record_name: snapshot.key.id,
            record_type: snapshot.key.entity_type,
            parent: snapshot.parent.map(|p| p.id),
            fields: snapshot.fields.clone(),
            field_updated_at: snapshot.field_updated_at.clone(),
            modified_at: snapshot.updated_at,
            server_modified_at: None,
            version: 0,
            deleted: snapshot.deleted,
        }
    }

    fn position(&self) -> Option<CursorPosition> {
        self.server_modified_at
            .map(|at| CursorPosition::new(at, self.record_name))
    }

    fn into_change(self) -> RouteResult<RemoteChange> {
        let remote_updated_at = self
            .server_modified_at
            .ok_or_else(|| RouteError::Transient("record without server timestamp".into()))?;
        let parent = match (self.record_type.parent_type(), self.parent) {
            (Some(parent_type), Some(id)) => Some(EntityKey::new(parent_type, id)),
            (None, Some(_)) => {
                return Err(RouteError::Transient(format!(
                    "{} record carries a parent",
                    self.record_type
                )))
            }
            _ => None,
        };
        Ok(RemoteChange {
            payload: EntitySnapshot {
                key: EntityKey::new(self.record_type, self.record_name),
                parent,
                fields: self.fields,
                field_updated_at: self.field_updated_at,
                updated_at: self.modified_at,
                deleted: self.deleted,
            },
            server_id: self.record_name.to_string(),
            sync_version: self.version,
            remote_updated_at,
        })
    }
}

/// Account state reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Signed in and usable.
    Available,
    /// No account on the device.
    NoAccount,
    /// Access is restricted by policy.
    Restricted,
    /// The account cannot be checked right now.
    TemporarilyUnavailable,
}

/// One batch of the zone change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneChanges {
    /// Changed records.
    pub records: Vec<CloudRecord>,
    /// Token to continue from.
    pub change_token: String,
    /// More batches follow.
    pub more_coming: bool,
}

/// Errors from the platform SDK.
#[derive(Debug, Clone, PartialEq)]
pub enum CloudError {
    /// The device is offline.
    NetworkUnavailable,
    /// The service is down.
    ServiceUnavailable,
    /// Too many requests.
    RateLimited,
    /// No signed-in account.
    NotAuthenticated,
    /// The stored record is newer than the expected version.
    ServerRecordChanged(Box<CloudRecord>),
    /// The record was rejected.
    InvalidArguments(String),
    /// The user's storage is full.
    QuotaExceeded,
    /// The change token is no longer valid.
    ChangeTokenExpired,
    /// Anything else.
    Internal(String),
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudError::NetworkUnavailable => f.write_str("network unavailable"),
            CloudError::ServiceUnavailable => f.write_str("service unavailable"),
            CloudError::RateLimited => f.write_str("rate limited"),
            CloudError::NotAuthenticated => f.write_str("not authenticated"),
            CloudError::ServerRecordChanged(record) => {
                write!(f, "server record {} changed", record.record_name)
            }
            CloudError::InvalidArguments(reason) => write!(f, "invalid arguments: {reason}"),
            CloudError::QuotaExceeded => f.write_str("quota exceeded"),
            CloudError::ChangeTokenExpired => f.write_str("change token expired"),
            CloudError::Internal(reason) => write!(f, "internal error: {reason}"),
        }
    }
}

impl From<CloudError> for RouteError {
    fn from(error: CloudError) -> Self {
        match error {
            CloudError::NetworkUnavailable
            | CloudError::ServiceUnavailable
            | CloudError::RateLimited
            | CloudError::ChangeTokenExpired
            | CloudError::Internal(_) => RouteError::Transient(error.to_string()),
            CloudError::NotAuthenticated => RouteError::Unauthorized,
            CloudError::InvalidArguments(reason) => RouteError::Validation(reason),
            CloudError::QuotaExceeded => RouteError::Unavailable(error.to_string()),
            CloudError::ServerRecordChanged(_) => RouteError::Fatal(error.to_string()),
        }
    }
}

/// Platform record store abstraction.
#[async_trait]
pub trait CloudRecordClient: Send + Sync {
    /// Reports the account state.
    async fn account_status(&self) -> Result<AccountStatus, CloudError>;

    /// Saves a record if the stored version equals `expected_version`.
    async fn save_record(
        &self,
        record: CloudRecord,
        expected_version: u64,
    ) -> Result<CloudRecord, CloudError>;

    /// Reads the change feed for one record type.
    async fn fetch_changes(
        &self,
        record_type: EntityType,
        change_token: Option<String>,
        limit: usize,
    ) -> Result<ZoneChanges, CloudError>;
}

#[derive(Debug, Clone)]
struct SavedToken {
    position: CursorPosition,
    token: String,
}

/// Cloud record store route adapter.
pub struct CloudSyncRoute<C: CloudRecordClient> {
    id: RouteId,
    client: C,
    account_available: AtomicBool,
    saved: Mutex<HashMap<EntityType, SavedToken>>,
    reading: Mutex<HashMap<EntityType, Option<CursorPosition>>>,
}

impl<C: CloudRecordClient> CloudSyncRoute<C> {
    /// Creates the route with id `cloud`.
    pub fn new(client: C) -> Self {
        Self::with_id(RouteId::new("cloud"), client)
    }

    /// Creates the route with a custom id.
    pub fn with_id(id: RouteId, client: C) -> Self {
        Self {
            id,
            client,
            account_available: AtomicBool::new(true),
            saved: Mutex::new(HashMap::new()),
            reading: Mutex::new(HashMap::new()),
        }
    }

    /// The platform client.
    pub fn client(&self) -> &C {
        &self.client
    }

    fn start_token(&self, request: &PullRequest) -> Option<String> {
        if request.page_token.is_some() {
            return request.page_token.clone();
        }
        let since = request.since?;
        self.saved
            .lock()
            .get(&request.entity_type)
            .filter(|saved| saved.position == since)
            .map(|saved| saved.token.clone())
    }

    async fn fetch(&self, request: &PullRequest) -> RouteResult<ZoneChanges> {
        let token = self.start_token(request);
        let resumed = token.is_some() && request.page_token.is_none();
        match self
            .client
            .fetch_changes(request.entity_type, token, request.limit)
            .await
        {
            Err(CloudError::ChangeTokenExpired) if resumed => {
                warn!(route = %self.id, entity_type = %request.entity_type, "change token expired; rereading zone");
                self.saved.lock().remove(&request.entity_type);
                self.client
                    .fetch_changes(request.entity_type, None, request.limit)
                    .await
                    .map_err(RouteError::from)
            }
            other => other.map_err(RouteError::from),
        }
    }
}

#[async_trait]
impl<C: CloudRecordClient> RouteAdapter for CloudSyncRoute<C> {
    fn id(&self) -> &RouteId {
        &self.id
    }

    async fn push(&self, request: PushRequest, _token: Option<AuthToken>) -> RouteResult<PushOutcome> {
        let mut record = CloudRecord::from_snapshot(&request.snapshot);
        if request.operation == OperationKind::Delete {
            record.deleted = true;
        }
        match self.client.save_record(record, request.base_version).await {
            Ok(saved) => {
                let ack = PushAck {
                    server_id: saved.record_name.to_string(),
                    sync_version: saved.version,
                    updated_at: saved.modified_at,
                };
                ack.validate()
                    .map_err(|e| RouteError::Transient(e.to_string()))?;
                Ok(PushOutcome::Applied(ack))
            }
            Err(CloudError::ServerRecordChanged(current)) => {
                debug!(route = %self.id, record = %current.record_name, "server record changed");
                Ok(PushOutcome::Conflict(current.into_change()?))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn pull(&self, request: PullRequest, _token: Option<AuthToken>) -> RouteResult<PullPage> {
        let batch = self.fetch(&request).await?;

        let mut records: Vec<CloudRecord> = batch
            .records
            .into_iter()
            .filter(|r| r.record_type == request.entity_type)
            .filter(|r| match (r.position(), request.since) {
                (Some(position), Some(since)) => position > since,
                _ => true,
            })
            .collect();
        records.sort_by_key(|r| r.position());
        records.truncate(request.limit);

        let mut reading = self.reading.lock();
        let furthest = reading
            .remove(&request.entity_type)
            .flatten()
            .or(request.since)
            .max(records.last().and_then(CloudRecord::position));

        let next_page_token = if batch.more_coming {
            reading.insert(request.entity_type, furthest);
            Some(batch.change_token)
        } else {
            if let Some(position) = furthest {
                self.saved.lock().insert(
                    request.entity_type,
                    SavedToken {
                        position,
                        token: batch.change_token,
                    },
                );
            }
            None
        };
        drop(reading);

        let changes = records
            .into_iter()
            .map(CloudRecord::into_change)
            .collect::<RouteResult<Vec<_>>>()?;
        Ok(PullPage {
            changes,
            next_page_token,
        })
    }

    async fn probe(&self) -> RouteResult<()> {
        let status = self.client.account_status().await?;
        self.account_available
            .store(status != AccountStatus::NoAccount && status != AccountStatus::Restricted, Ordering::SeqCst);
        match status {
            AccountStatus::Available => Ok(()),
            AccountStatus::TemporarilyUnavailable => {
                Err(RouteError::Transient("account temporarily unavailable".into()))
            }
            AccountStatus::NoAccount | AccountStatus::Restricted => {
                Err(RouteError::Unavailable(format!("account status {status:?}")))
            }
        }
    }

    fn is_available(&self) -> bool {
        self.account_available.load(Ordering::SeqCst)
    }
}
