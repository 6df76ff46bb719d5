//! Route adapter for the Wayfare GraphQL backend.
//!
//! The wire client is abstracted by [`GraphqlClient`] so any HTTP stack can
//! carry the requests. Each operation has typed variable and payload
//! structs; responses are decoded and validated here before anything
//! reaches the engine.

use crate::auth::AuthToken;
use crate::error::{RouteError, RouteResult};
use crate::route::RouteAdapter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use wayfare_sync_protocol::{
    EntityId, EntityKey, EntitySnapshot, EntityType, OperationKind, PullPage, PullRequest, PushAck,
    PushOutcome, PushRequest, RemoteChange, RouteId,
};

const UPSERT_ENTITY: &str = "mutation UpsertEntity($input: EntityInput!, $idempotencyKey: String!, $baseVersion: Int!, $serverId: ID) { upsertEntity(input: $input, idempotencyKey: $idempotencyKey, baseVersion: $baseVersion, serverId: $serverId) { entity { ...EntityNode } conflict { ...EntityNode } } }";

const ENTITY_CHANGES: &str = "query EntityChanges($entityType: EntityType!, $sinceUpdatedAt: DateTime, $sinceId: ID, $after: String, $first: Int!) { entityChanges(entityType: $entityType, sinceUpdatedAt: $sinceUpdatedAt, sinceId: $sinceId, after: $after, first: $first) { nodes { ...EntityNode } pageInfo { hasNextPage endCursor } } }";

const PING: &str = "query Ping { ping }";

/// A GraphQL operation ready to send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest {
    /// Operation name.
    pub operation_name: &'static str,
    /// Document text.
    pub query: &'static str,
    /// Operation variables.
    pub variables: Value,
}

/// A GraphQL response envelope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GraphqlResponse {
    /// Result data.
    #[serde(default)]
    pub data: Option<Value>,
    /// Errors reported by the server.
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

/// One GraphQL error.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GraphqlError {
    /// Human-readable message.
    pub message: String,
    /// Machine-readable details.
    #[serde(default)]
    pub extensions: Option<GraphqlErrorExtensions>,
}

/// Error extensions carrying the error code.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GraphqlErrorExtensions {
    /// Error code such as `UNAUTHENTICATED`.
    pub code: Option<String>,
}

/// Failure below the GraphQL layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request never got an HTTP response.
    Network(String),
    /// The server answered with a non-success HTTP status.
    Status(u16, String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Network(message) => write!(f, "network: {message}"),
            TransportError::Status(code, message) => write!(f, "http {code}: {message}"),
        }
    }
}

/// GraphQL client abstraction.
///
/// Implement this trait over the application's HTTP stack.
#[async_trait]
pub trait GraphqlClient: Send + Sync {
    /// Sends one operation with an optional bearer token.
    async fn execute(
        &self,
        request: GraphqlRequest,
        bearer: Option<String>,
    ) -> Result<GraphqlResponse, TransportError>;
}

/// Entity as sent to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityInput {
    /// Client-generated id.
    pub client_id: EntityId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Parent client id.
    pub parent_id: Option<EntityId>,
    /// Field values.
    pub fields: Map<String, Value>,
    /// Per-field modification times.
    pub field_updated_at: BTreeMap<String, DateTime<Utc>>,
    /// Entity modification time.
    pub updated_at: DateTime<Utc>,
    /// Tombstone marker.
    pub deleted: bool,
}

impl From<&EntitySnapshot> for EntityInput {
    fn from(snapshot: &EntitySnapshot) -> Self {
        Self {
            client_id: snapshot.key.id,
            entity_type: snapshot.key.entity_type,
            parent_id: snapshot.parent.map(|p| p.id),
            fields: snapshot.fields.clone(),
            field_updated_at: snapshot.field_updated_at.clone(),
            updated_at: snapshot.updated_at,
            deleted: snapshot.deleted,
        }
    }
}

/// Variables of `UpsertEntity`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertVariables {
    /// Entity state.
    pub input: EntityInput,
    /// Replay guard.
    pub idempotency_key: String,
    /// Version the edit was based on.
    pub base_version: u64,
    /// Known server id.
    pub server_id: Option<String>,
}

/// Entity as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityNode {
    /// Client-generated id.
    pub client_id: EntityId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Parent client id.
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    /// Server id.
    pub server_id: String,
    /// Server version.
    pub version: u64,
    /// Field values.
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Per-field modification times.
    #[serde(default)]
    pub field_updated_at: BTreeMap<String, DateTime<Utc>>,
    /// Entity modification time.
    pub updated_at: DateTime<Utc>,
    /// Server storage time, the pagination order.
    pub server_updated_at: DateTime<Utc>,
    /// Tombstone marker.
    #[serde(default)]
    pub deleted: bool,
}

impl EntityNode {
    fn into_change(self) -> RouteResult<RemoteChange> {
        let parent = match (self.entity_type.parent_type(), self.parent_id) {
            (Some(parent_type), Some(id)) => Some(EntityKey::new(parent_type, id)),
            (None, Some(_)) => {
                return Err(malformed(format!(
                    "{} node carries a parent",
                    self.entity_type
                )))
            }
            _ => None,
        };
        Ok(RemoteChange {
            payload: EntitySnapshot {
                key: EntityKey::new(self.entity_type, self.client_id),
                parent,
                fields: self.fields,
                field_updated_at: self.field_updated_at,
                updated_at: self.updated_at,
                deleted: self.deleted,
            },
            server_id: self.server_id,
            sync_version: self.version,
            remote_updated_at: self.server_updated_at,
        })
    }
}

/// Payload of `upsertEntity`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpsertPayload {
    /// Stored entity when the upsert applied.
    #[serde(default)]
    pub entity: Option<EntityNode>,
    /// Current server state when the base version was stale.
    #[serde(default)]
    pub conflict: Option<EntityNode>,
}

/// Variables of `EntityChanges`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesVariables {
    /// Entity type to list.
    pub entity_type: EntityType,
    /// Exclusive lower bound, time part.
    pub since_updated_at: Option<DateTime<Utc>>,
    /// Exclusive lower bound, id part.
    pub since_id: Option<EntityId>,
    /// Continuation cursor.
    pub after: Option<String>,
    /// Page size.
    pub first: usize,
}

/// Payload of `entityChanges`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesPayload {
    /// Changed entities.
    pub nodes: Vec<EntityNode>,
    /// Pagination state.
    pub page_info: PageInfo,
}

/// Relay-style page info.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// More pages follow.
    pub has_next_page: bool,
    /// Cursor of the last node.
    #[serde(default)]
    pub end_cursor: Option<String>,
}

/// GraphQL route adapter.
pub struct GraphqlRoute<C: GraphqlClient> {
    id: RouteId,
    client: C,
}

impl<C: GraphqlClient> GraphqlRoute<C> {
    /// Creates the route with id `graphql`.
    pub fn new(client: C) -> Self {
        Self::with_id(RouteId::new("graphql"), client)
    }

    /// Creates the route with a custom id.
    pub fn with_id(id: RouteId, client: C) -> Self {
        Self { id, client }
    }

    /// The wire client.
    pub fn client(&self) -> &C {
        &self.client
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation_name: &'static str,
        query: &'static str,
        variables: Value,
        field: &str,
        token: Option<AuthToken>,
    ) -> RouteResult<T> {
        let request = GraphqlRequest {
            operation_name,
            query,
            variables,
        };
        let bearer = token.map(|t| t.expose().to_string());
        let response = self
            .client
            .execute(request, bearer)
            .await
            .map_err(map_transport_error)?;

        if let Some(error) = response.errors.first() {
            return Err(map_graphql_error(error));
        }
        let data = response
            .data
            .and_then(|mut data| data.get_mut(field).map(Value::take))
            .ok_or_else(|| malformed(format!("missing {field}")))?;
        serde_json::from_value(data).map_err(|e| malformed(e.to_string()))
    }
}

#[async_trait]
impl<C: GraphqlClient> RouteAdapter for GraphqlRoute<C> {
    fn id(&self) -> &RouteId {
        &self.id
    }

    async fn push(&self, request: PushRequest, token: Option<AuthToken>) -> RouteResult<PushOutcome> {
        let mut input = EntityInput::from(&request.snapshot);
        if request.operation == OperationKind::Delete {
            input.deleted = true;
        }
        let variables = UpsertVariables {
            input,
            idempotency_key: request.idempotency_key,
            base_version: request.base_version,
            server_id: request.server_id,
        };
        let variables = serde_json::to_value(&variables).map_err(|e| RouteError::Fatal(e.to_string()))?;

        let payload: UpsertPayload = self
            .call("UpsertEntity", UPSERT_ENTITY, variables, "upsertEntity", token)
            .await?;

        match (payload.entity, payload.conflict) {
            (_, Some(conflict)) => Ok(PushOutcome::Conflict(conflict.into_change()?)),
            (Some(entity), None) => {
                let ack = PushAck {
                    server_id: entity.server_id,
                    sync_version: entity.version,
                    updated_at: entity.updated_at,
                };
                ack.validate().map_err(|e| malformed(e.to_string()))?;
                debug!(route = %self.id, server_id = %ack.server_id, "upsert applied");
                Ok(PushOutcome::Applied(ack))
            }
            (None, None) => Err(malformed("upsert returned neither entity nor conflict")),
        }
    }

    async fn pull(&self, request: PullRequest, token: Option<AuthToken>) -> RouteResult<PullPage> {
        let variables = ChangesVariables {
            entity_type: request.entity_type,
            since_updated_at: request.since.map(|p| p.updated_at),
            since_id: request.since.map(|p| p.entity_id),
            after: request.page_token.clone(),
            first: request.limit,
        };
        let variables = serde_json::to_value(&variables).map_err(|e| RouteError::Fatal(e.to_string()))?;

        let payload: ChangesPayload = self
            .call("EntityChanges", ENTITY_CHANGES, variables, "entityChanges", token)
            .await?;

        let changes = payload
            .nodes
            .into_iter()
            .map(EntityNode::into_change)
            .collect::<RouteResult<Vec<_>>>()?;
        let next_page_token = if payload.page_info.has_next_page {
            Some(
                payload
                    .page_info
                    .end_cursor
                    .ok_or_else(|| malformed("next page without a cursor"))?,
            )
        } else {
            None
        };
        Ok(PullPage {
            changes,
            next_page_token,
        })
    }

    async fn probe(&self) -> RouteResult<()> {
        let response = self
            .client
            .execute(
                GraphqlRequest {
                    operation_name: "Ping",
                    query: PING,
                    variables: Value::Object(Map::new()),
                },
                None,
            )
            .await
            .map_err(map_transport_error)?;
        match response.errors.first() {
            Some(error) => Err(map_graphql_error(error)),
            None => Ok(()),
        }
    }
}

fn malformed(reason: impl fmt::Display) -> RouteError {
    RouteError::Transient(format!("malformed response: {reason}"))
}

fn map_transport_error(error: TransportError) -> RouteError {
    match error {
        TransportError::Network(message) => RouteError::Transient(message),
        TransportError::Status(401 | 403, _) => RouteError::Unauthorized,
        TransportError::Status(code @ (408 | 429 | 500..=599), message) => {
            RouteError::Transient(format!("http {code}: {message}"))
        }
        TransportError::Status(code @ 400..=499, message) => {
            RouteError::Validation(format!("http {code}: {message}"))
        }
        TransportError::Status(code, message) => RouteError::Fatal(format!("http {code}: {message}")),
    }
}

fn map_graphql_error(error: &GraphqlError) -> RouteError {
    let code = error
        .extensions
        .as_ref()
        .and_then(|e| e.code.as_deref())
        .unwrap_or_default();
    match code {
        "UNAUTHENTICATED" | "FORBIDDEN" => RouteError::Unauthorized,
        "BAD_USER_INPUT" | "VALIDATION_FAILED" => RouteError::Validation(error.message.clone()),
        "RATE_LIMITED" | "INTERNAL_SERVER_ERROR" | "SERVICE_UNAVAILABLE" => {
            RouteError::Transient(error.message.clone())
        }
        _ => RouteError::Fatal(error.message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use wayfare_sync_protocol::{CursorPosition, Priority, SyncQueueEntry};

    #[derive(Default)]
    struct ScriptedClient {
        responses: Mutex<VecDeque<Result<GraphqlResponse, TransportError>>>,
        requests: Mutex<Vec<(GraphqlRequest, Option<String>)>>,
    }

    impl ScriptedClient {
        fn respond(&self, response: Result<GraphqlResponse, TransportError>) {
            self.responses.lock().push_back(response);
        }

        fn respond_data(&self, data: Value) {
            self.respond(Ok(GraphqlResponse {
                data: Some(data),
                errors: Vec::new(),
            }));
        }
    }

    #[async_trait]
    impl GraphqlClient for ScriptedClient {
        async fn execute(
            &self,
            request: GraphqlRequest,
            bearer: Option<String>,
        ) -> Result<GraphqlResponse, TransportError> {
            self.requests.lock().push((request, bearer));
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Network("no scripted response".into())))
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn push_request() -> PushRequest {
        let snapshot =
            EntitySnapshot::new(EntityKey::generate(EntityType::Trip), t(10)).with_field("name", "Hanoi");
        let entry = SyncQueueEntry::new(OperationKind::Create, snapshot, Priority::Normal, t(10));
        PushRequest::for_entry(&entry, None, 0)
    }

    fn node(key: EntityKey, version: u64) -> Value {
        json!({
            "clientId": key.id,
            "entityType": "trip",
            "serverId": "srv-9",
            "version": version,
            "fields": {"name": "Hanoi"},
            "updatedAt": t(10),
            "serverUpdatedAt": t(11),
        })
    }

    #[tokio::test]
    async fn push_maps_applied_entity_to_ack() {
        let route = GraphqlRoute::new(ScriptedClient::default());
        let request = push_request();
        route
            .client()
            .respond_data(json!({"upsertEntity": {"entity": node(request.key(), 4)}}));

        let outcome = route
            .push(request.clone(), Some(AuthToken::new("tok")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PushOutcome::Applied(PushAck {
                server_id: "srv-9".into(),
                sync_version: 4,
                updated_at: t(10),
            })
        );

        let sent = route.client().requests.lock()[0].clone();
        assert_eq!(sent.0.operation_name, "UpsertEntity");
        assert_eq!(sent.1.as_deref(), Some("tok"));
        assert_eq!(
            sent.0.variables["idempotencyKey"],
            json!(request.idempotency_key)
        );
    }

    #[tokio::test]
    async fn push_maps_conflict() {
        let route = GraphqlRoute::new(ScriptedClient::default());
        let request = push_request();
        route
            .client()
            .respond_data(json!({"upsertEntity": {"conflict": node(request.key(), 7)}}));

        let PushOutcome::Conflict(change) = route.push(request.clone(), None).await.unwrap() else {
            panic!("expected a conflict");
        };
        assert_eq!(change.key(), request.key());
        assert_eq!(change.sync_version, 7);
        assert_eq!(change.remote_updated_at, t(11));
    }

    #[tokio::test]
    async fn errors_are_classified() {
        let route = GraphqlRoute::new(ScriptedClient::default());
        let client = route.client();
        client.respond(Err(TransportError::Status(401, "expired".into())));
        client.respond(Err(TransportError::Status(503, "maintenance".into())));
        client.respond(Err(TransportError::Status(422, "bad".into())));
        client.respond(Ok(GraphqlResponse {
            data: None,
            errors: vec![GraphqlError {
                message: "name too long".into(),
                extensions: Some(GraphqlErrorExtensions {
                    code: Some("BAD_USER_INPUT".into()),
                }),
            }],
        }));
        client.respond_data(json!({"somethingElse": {}}));

        let results = [
            route.push(push_request(), None).await,
            route.push(push_request(), None).await,
            route.push(push_request(), None).await,
            route.push(push_request(), None).await,
            route.push(push_request(), None).await,
        ];
        assert!(matches!(results[0], Err(RouteError::Unauthorized)));
        assert!(matches!(results[1], Err(RouteError::Transient(_))));
        assert!(matches!(results[2], Err(RouteError::Validation(_))));
        assert!(matches!(results[3], Err(RouteError::Validation(_))));
        assert!(matches!(results[4], Err(RouteError::Transient(_))));
    }

    #[tokio::test]
    async fn pull_builds_page() {
        let route = GraphqlRoute::new(ScriptedClient::default());
        let key = EntityKey::generate(EntityType::Trip);
        route.client().respond_data(json!({
            "entityChanges": {
                "nodes": [node(key, 2)],
                "pageInfo": {"hasNextPage": true, "endCursor": "c1"}
            }
        }));

        let since = CursorPosition::new(t(5), EntityId::new());
        let page = route
            .pull(
                PullRequest {
                    entity_type: EntityType::Trip,
                    since: Some(since),
                    page_token: None,
                    limit: 50,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.next_page_token.as_deref(), Some("c1"));

        let sent = route.client().requests.lock()[0].0.clone();
        assert_eq!(sent.variables["first"], json!(50));
        assert_eq!(sent.variables["sinceId"], json!(since.entity_id));
    }

    #[tokio::test]
    async fn probe_reports_network_errors() {
        let route = GraphqlRoute::new(ScriptedClient::default());
        assert!(matches!(route.probe().await, Err(RouteError::Transient(_))));
        route.client().respond_data(json!({"ping": true}));
        assert!(route.probe().await.is_ok());
    }
}
