//! Typed push and pull messages exchanged with route adapters.

use crate::cursor::CursorPosition;
use crate::entity::{EntityKey, EntitySnapshot, EntityType};
use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::{OperationKind, SyncQueueEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Uploads one queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Stable across retries of the same entry revision.
    pub idempotency_key: String,
    /// Mutation kind.
    pub operation: OperationKind,
    /// Entity state to upsert.
    pub snapshot: EntitySnapshot,
    /// Known remote identifier.
    pub server_id: Option<String>,
    /// Remote version the local edit was made against.
    pub base_version: u64,
}

impl PushRequest {
    /// Builds the request for a queue entry.
    pub fn for_entry(entry: &SyncQueueEntry, server_id: Option<String>, base_version: u64) -> Self {
        Self {
            idempotency_key: format!("{}:{}", entry.id, entry.revision),
            operation: entry.operation,
            snapshot: entry.payload.clone(),
            server_id,
            base_version,
        }
    }

    /// Entity the request targets.
    pub fn key(&self) -> EntityKey {
        self.snapshot.key
    }
}

/// Remote acknowledgement of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// Remote identifier of the entity.
    pub server_id: String,
    /// Version assigned by the remote.
    pub sync_version: u64,
    /// `updated_at` of the state the remote stored, the new sync baseline.
    pub updated_at: DateTime<Utc>,
}

impl PushAck {
    /// Checks the acknowledgement before it touches local state.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.server_id.trim().is_empty() {
            return Err(ProtocolError::InvalidAck("empty server id".into()));
        }
        if self.sync_version == 0 {
            return Err(ProtocolError::InvalidAck("version must be positive".into()));
        }
        Ok(())
    }
}

/// Result of a push that reached the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The remote stored the state.
    Applied(PushAck),
    /// The remote holds a newer version than `base_version`.
    Conflict(RemoteChange),
}

/// A change read from a remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// Remote state.
    pub payload: EntitySnapshot,
    /// Remote identifier.
    pub server_id: String,
    /// Remote version.
    pub sync_version: u64,
    /// When the remote stored this state, in the remote's clock.
    pub remote_updated_at: DateTime<Utc>,
}

impl RemoteChange {
    /// Entity the change applies to.
    pub fn key(&self) -> EntityKey {
        self.payload.key
    }

    /// Where this change sits in the remote ordering.
    pub fn position(&self) -> CursorPosition {
        CursorPosition::new(self.remote_updated_at, self.payload.key.id)
    }
}

/// Requests one page of changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Entity type to pull.
    pub entity_type: EntityType,
    /// Exclusive lower bound.
    pub since: Option<CursorPosition>,
    /// Continuation token from the previous page.
    pub page_token: Option<String>,
    /// Maximum changes per page.
    pub limit: usize,
}

/// One page of remote changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullPage {
    /// Changes in remote order.
    pub changes: Vec<RemoteChange>,
    /// Set when more pages follow.
    pub next_page_token: Option<String>,
}

impl PullPage {
    /// Whether this is the last page.
    pub fn is_last(&self) -> bool {
        self.next_page_token.is_none()
    }

    /// Checks the page against the request that produced it.
    ///
    /// Every change must have the requested type, a valid payload, lie
    /// after `since`, and appear in ascending position order.
    pub fn validate(&self, request: &PullRequest) -> ProtocolResult<()> {
        if self.changes.len() > request.limit {
            return Err(ProtocolError::InvalidPage(format!(
                "{} changes exceed limit {}",
                self.changes.len(),
                request.limit
            )));
        }

        let mut previous = request.since;
        for change in &self.changes {
            if change.key().entity_type != request.entity_type {
                return Err(ProtocolError::InvalidPage(format!(
                    "{} in a {} page",
                    change.key(),
                    request.entity_type
                )));
            }
            if change.server_id.trim().is_empty() {
                return Err(ProtocolError::InvalidPage(format!(
                    "{} has no server id",
                    change.key()
                )));
            }
            change.payload.validate()?;

            let position = change.position();
            if previous.is_some_and(|p| position <= p) {
                return Err(ProtocolError::InvalidPage(format!(
                    "{} is out of order",
                    change.key()
                )));
            }
            previous = Some(position);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Priority;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn change(secs: i64) -> RemoteChange {
        RemoteChange {
            payload: EntitySnapshot::new(EntityKey::generate(EntityType::Trip), t(secs))
                .with_field("name", "Lisbon"),
            server_id: format!("srv-{secs}"),
            sync_version: 1,
            remote_updated_at: t(secs),
        }
    }

    fn request(since: Option<CursorPosition>) -> PullRequest {
        PullRequest {
            entity_type: EntityType::Trip,
            since,
            page_token: None,
            limit: 10,
        }
    }

    #[test]
    fn idempotency_key_tracks_revision() {
        let payload = change(1).payload;
        let mut entry = SyncQueueEntry::new(OperationKind::Create, payload, Priority::Normal, t(1));
        let first = PushRequest::for_entry(&entry, None, 0);
        assert_eq!(first, PushRequest::for_entry(&entry, None, 0));

        entry.revision += 1;
        assert_ne!(
            first.idempotency_key,
            PushRequest::for_entry(&entry, None, 0).idempotency_key
        );
    }

    #[test]
    fn ack_validation() {
        let ack = PushAck {
            server_id: "srv".into(),
            sync_version: 1,
            updated_at: t(1),
        };
        assert!(ack.validate().is_ok());
        assert!(PushAck { sync_version: 0, ..ack.clone() }.validate().is_err());
        assert!(PushAck { server_id: " ".into(), ..ack }.validate().is_err());
    }

    #[test]
    fn ordered_page_validates() {
        let page = PullPage {
            changes: vec![change(1), change(2), change(3)],
            next_page_token: None,
        };
        assert!(page.validate(&request(None)).is_ok());
        assert!(page.is_last());
    }

    #[test]
    fn page_rejects_changes_before_cursor() {
        let page = PullPage {
            changes: vec![change(5)],
            next_page_token: None,
        };
        let since = change(9).position();
        assert!(matches!(
            page.validate(&request(Some(since))),
            Err(ProtocolError::InvalidPage(_))
        ));
    }

    #[test]
    fn page_rejects_wrong_type_and_bad_payload() {
        let mut wrong_type = change(1);
        wrong_type.payload.key = EntityKey::generate(EntityType::Memory);
        let page = PullPage {
            changes: vec![wrong_type],
            next_page_token: None,
        };
        assert!(page.validate(&request(None)).is_err());

        let mut nameless = change(1);
        nameless.payload.fields.clear();
        let page = PullPage {
            changes: vec![nameless],
            next_page_token: None,
        };
        assert!(matches!(
            page.validate(&request(None)),
            Err(ProtocolError::InvalidEntity { .. })
        ));
    }
}
