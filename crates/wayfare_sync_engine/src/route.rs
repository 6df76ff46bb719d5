//! Route adapter abstraction.
//!
//! A route is one remote store the engine can push to and pull from. The
//! adapter set is fixed when the engine is built; the engine only ever
//! sees [`RouteAdapter`] trait objects.

use crate::auth::AuthToken;
use crate::error::{RouteError, RouteResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use wayfare_sync_protocol::{PullPage, PullRequest, PushAck, PushOutcome, PushRequest, RouteId};

/// A remote store.
///
/// Pushes are upserts keyed by the client entity id and carry an
/// idempotency key, so replaying one is harmless.
#[async_trait]
pub trait RouteAdapter: Send + Sync {
    /// Stable identifier, used for cursors and health tracking.
    fn id(&self) -> &RouteId;

    /// Uploads one entity state.
    async fn push(&self, request: PushRequest, token: Option<AuthToken>) -> RouteResult<PushOutcome>;

    /// Reads one page of changes.
    async fn pull(&self, request: PullRequest, token: Option<AuthToken>) -> RouteResult<PullPage>;

    /// Cheap reachability check used to bring a route back from cool-down.
    async fn probe(&self) -> RouteResult<()>;

    /// Whether the route can currently be used at all.
    fn is_available(&self) -> bool {
        true
    }
}

/// A route that keeps everything on the device.
///
/// Pushes are acknowledged locally and pulls are always empty. Used when
/// the user has no account or sync is turned off.
#[derive(Debug)]
pub struct LocalOnlyRoute {
    id: RouteId,
    acknowledged: AtomicU64,
}

impl LocalOnlyRoute {
    /// Creates the route with id `local`.
    pub fn new() -> Self {
        Self {
            id: RouteId::new("local"),
            acknowledged: AtomicU64::new(0),
        }
    }

    /// Number of pushes acknowledged so far.
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::SeqCst)
    }
}

impl Default for LocalOnlyRoute {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteAdapter for LocalOnlyRoute {
    fn id(&self) -> &RouteId {
        &self.id
    }

    async fn push(&self, request: PushRequest, _token: Option<AuthToken>) -> RouteResult<PushOutcome> {
        request
            .snapshot
            .validate()
            .map_err(|e| RouteError::Validation(e.to_string()))?;
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
        Ok(PushOutcome::Applied(PushAck {
            server_id: request
                .server_id
                .unwrap_or_else(|| format!("local-{}", request.snapshot.key.id)),
            sync_version: request.base_version + 1,
            updated_at: request.snapshot.updated_at,
        }))
    }

    async fn pull(&self, _request: PullRequest, _token: Option<AuthToken>) -> RouteResult<PullPage> {
        Ok(PullPage::default())
    }

    async fn probe(&self) -> RouteResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wayfare_sync_protocol::{
        EntityKey, EntitySnapshot, EntityType, OperationKind, Priority, SyncQueueEntry,
    };

    #[tokio::test]
    async fn local_route_acknowledges_valid_pushes() {
        let route = LocalOnlyRoute::new();
        let snapshot =
            EntitySnapshot::new(EntityKey::generate(EntityType::Trip), Utc::now()).with_field("name", "Cusco");
        let entry = SyncQueueEntry::new(OperationKind::Create, snapshot, Priority::Normal, Utc::now());

        let outcome = route
            .push(PushRequest::for_entry(&entry, None, 0), None)
            .await
            .unwrap();
        let PushOutcome::Applied(ack) = outcome else {
            panic!("expected an ack");
        };
        assert_eq!(ack.sync_version, 1);
        assert!(ack.server_id.starts_with("local-"));
        assert_eq!(route.acknowledged(), 1);
    }

    #[tokio::test]
    async fn local_route_rejects_invalid_payload() {
        let route = LocalOnlyRoute::new();
        let snapshot = EntitySnapshot::new(EntityKey::generate(EntityType::Trip), Utc::now());
        let entry = SyncQueueEntry::new(OperationKind::Create, snapshot, Priority::Normal, Utc::now());

        let result = route.push(PushRequest::for_entry(&entry, None, 0), None).await;
        assert!(matches!(result, Err(RouteError::Validation(_))));
        assert!(route
            .pull(
                PullRequest {
                    entity_type: EntityType::Trip,
                    since: None,
                    page_token: None,
                    limit: 10
                },
                None
            )
            .await
            .unwrap()
            .changes
            .is_empty());
    }
}
