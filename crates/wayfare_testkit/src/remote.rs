//! In-memory remote backend.
//!
//! [`InMemoryRemote`] behaves like the real backends the engine talks to:
//! pushes are versioned upserts keyed by client id with idempotency keys,
//! stale base versions are answered with the server's state, and pulls
//! page through changes in server storage order. Several devices can
//! share one remote through their own [`RemoteRoute`] adapters.
//!
//! Failures are scripted with [`Fault`]s, consumed in order.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use wayfare_sync_engine::{AuthToken, RouteAdapter, RouteError, RouteResult};
use wayfare_sync_protocol::{
    EntityKey, EntitySnapshot, OperationKind, PullPage, PullRequest, PushAck, PushOutcome,
    PushRequest, RemoteChange, RouteId,
};

/// A scripted failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// The next push fails with this error before reaching the server.
    Push(RouteError),
    /// The next push is applied, then its response is lost.
    LoseAck,
    /// The next pull fails with this error.
    Pull(RouteError),
    /// The next probe fails with this error.
    Probe(RouteError),
    /// The pull after `pages` more successful pulls fails with this error.
    PullAfter {
        /// Pulls served before the failure.
        pages: usize,
        /// The error returned.
        error: RouteError,
    },
}

#[derive(Debug)]
struct RemoteState {
    records: BTreeMap<EntityKey, RemoteChange>,
    acks: HashMap<String, PushAck>,
    last_stamp: DateTime<Utc>,
    next_server_id: u64,
    faults: VecDeque<Fault>,
    offline: bool,
    required_token: Option<String>,
    latency: Duration,
    pushes: Vec<PushRequest>,
    pulls: usize,
}

impl RemoteState {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            acks: HashMap::new(),
            last_stamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
            next_server_id: 0,
            faults: VecDeque::new(),
            offline: false,
            required_token: None,
            latency: Duration::ZERO,
            pushes: Vec::new(),
            pulls: 0,
        }
    }

    /// Server storage time; strictly increasing.
    fn stamp(&mut self) -> DateTime<Utc> {
        self.last_stamp += ChronoDuration::milliseconds(1);
        self.last_stamp
    }

    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let index = self.faults.iter().position(matches)?;
        let fault = self.faults.remove(index);
        debug!(?fault, "fault triggered");
        fault
    }

    fn check_access(&self, token: Option<&AuthToken>) -> RouteResult<()> {
        if self.offline {
            return Err(RouteError::Transient("connection refused".into()));
        }
        match (&self.required_token, token) {
            (Some(required), Some(token)) if token.expose() == required => Ok(()),
            (Some(_), _) => Err(RouteError::Unauthorized),
            (None, _) => Ok(()),
        }
    }

    fn upsert(&mut self, snapshot: EntitySnapshot) -> RemoteChange {
        let key = snapshot.key;
        let (server_id, version) = match self.records.get(&key) {
            Some(current) => (current.server_id.clone(), current.sync_version + 1),
            None => {
                self.next_server_id += 1;
                (format!("srv-{}", self.next_server_id), 1)
            }
        };
        let change = RemoteChange {
            payload: snapshot,
            server_id,
            sync_version: version,
            remote_updated_at: self.stamp(),
        };
        self.records.insert(key, change.clone());
        change
    }

    fn push(&mut self, request: &PushRequest) -> RouteResult<PushOutcome> {
        request
            .snapshot
            .validate()
            .map_err(|e| RouteError::Validation(e.to_string()))?;
        self.pushes.push(request.clone());

        if let Some(ack) = self.acks.get(&request.idempotency_key) {
            return Ok(PushOutcome::Applied(ack.clone()));
        }
        if let Some(current) = self.records.get(&request.key()) {
            if current.sync_version != request.base_version {
                return Ok(PushOutcome::Conflict(current.clone()));
            }
        }

        let mut snapshot = request.snapshot.clone();
        if request.operation == OperationKind::Delete {
            snapshot.deleted = true;
        }
        let change = self.upsert(snapshot);
        let ack = PushAck {
            server_id: change.server_id,
            sync_version: change.sync_version,
            updated_at: request.snapshot.updated_at,
        };
        self.acks
            .insert(request.idempotency_key.clone(), ack.clone());
        Ok(PushOutcome::Applied(ack))
    }

    fn pull(&mut self, request: &PullRequest) -> RouteResult<PullPage> {
        self.pulls += 1;
        let mut matching: Vec<&RemoteChange> = self
            .records
            .values()
            .filter(|c| c.key().entity_type == request.entity_type)
            .filter(|c| request.since.map_or(true, |since| c.position() > since))
            .collect();
        matching.sort_by_key(|c| c.position());

        let offset = match &request.page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| RouteError::Validation(format!("bad page token {token}")))?,
            None => 0,
        };
        let changes: Vec<RemoteChange> = matching
            .iter()
            .skip(offset)
            .take(request.limit)
            .map(|c| (*c).clone())
            .collect();
        let consumed = offset + changes.len();
        Ok(PullPage {
            next_page_token: (consumed < matching.len()).then(|| consumed.to_string()),
            changes,
        })
    }
}

/// A shared in-memory backend.
#[derive(Debug, Clone)]
pub struct InMemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState::new())),
        }
    }

    /// An adapter for this remote with the given route id.
    pub fn route(&self, id: &str) -> Arc<RemoteRoute> {
        Arc::new(RemoteRoute {
            id: RouteId::new(id),
            remote: self.clone(),
            available: AtomicBool::new(true),
        })
    }

    /// Makes every call fail as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Requires this bearer token on every push and pull.
    pub fn require_token(&self, token: Option<&str>) {
        self.state.lock().required_token = token.map(str::to_string);
    }

    /// Delays every push and pull.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Schedules a failure.
    pub fn inject(&self, fault: Fault) {
        let mut state = self.state.lock();
        let fault = match fault {
            Fault::PullAfter { pages, error } => Fault::PullAfter {
                pages: state.pulls + pages,
                error,
            },
            other => other,
        };
        debug!(?fault, "fault scheduled");
        state.faults.push_back(fault);
    }

    /// Writes an entity state directly, as another device would.
    pub fn write_from_other_device(&self, snapshot: EntitySnapshot) -> RemoteChange {
        self.state.lock().upsert(snapshot)
    }

    /// The server's current state of an entity.
    pub fn get(&self, key: &EntityKey) -> Option<RemoteChange> {
        self.state.lock().records.get(key).cloned()
    }

    /// Every stored entity state.
    pub fn records(&self) -> Vec<RemoteChange> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Every push request that reached the server, replays included.
    pub fn pushes(&self) -> Vec<PushRequest> {
        self.state.lock().pushes.clone()
    }

    /// Number of pushes for one entity that reached the server.
    pub fn pushes_for(&self, key: &EntityKey) -> usize {
        self.state
            .lock()
            .pushes
            .iter()
            .filter(|p| p.key() == *key)
            .count()
    }

    /// Number of pull requests served.
    pub fn pull_count(&self) -> usize {
        self.state.lock().pulls
    }

    fn latency(&self) -> Duration {
        self.state.lock().latency
    }
}

/// One device's adapter for an [`InMemoryRemote`].
#[derive(Debug)]
pub struct RemoteRoute {
    id: RouteId,
    remote: InMemoryRemote,
    available: AtomicBool,
}

impl RemoteRoute {
    /// Marks the route usable or not, like a signed-out platform account.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// The backing remote.
    pub fn remote(&self) -> &InMemoryRemote {
        &self.remote
    }
}

#[async_trait]
impl RouteAdapter for RemoteRoute {
    fn id(&self) -> &RouteId {
        &self.id
    }

    async fn push(&self, request: PushRequest, token: Option<AuthToken>) -> RouteResult<PushOutcome> {
        let latency = self.remote.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.remote.state.lock();
        state.check_access(token.as_ref())?;
        match state.take_fault(|f| matches!(f, Fault::Push(_) | Fault::LoseAck)) {
            Some(Fault::Push(error)) => Err(error),
            Some(_) => {
                state.push(&request)?;
                Err(RouteError::Timeout)
            }
            None => state.push(&request),
        }
    }

    async fn pull(&self, request: PullRequest, token: Option<AuthToken>) -> RouteResult<PullPage> {
        let latency = self.remote.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.remote.state.lock();
        state.check_access(token.as_ref())?;
        let served = state.pulls;
        let fault = state.take_fault(|f| match f {
            Fault::Pull(_) => true,
            Fault::PullAfter { pages, .. } => *pages == served,
            _ => false,
        });
        match fault {
            Some(Fault::Pull(error)) | Some(Fault::PullAfter { error, .. }) => Err(error),
            _ => state.pull(&request),
        }
    }

    async fn probe(&self) -> RouteResult<()> {
        let mut state = self.remote.state.lock();
        if state.offline {
            return Err(RouteError::Transient("connection refused".into()));
        }
        match state.take_fault(|f| matches!(f, Fault::Probe(_))) {
            Some(Fault::Probe(error)) => Err(error),
            _ => Ok(()),
        }
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfare_sync_protocol::{EntityType, Priority, SyncQueueEntry};

    fn trip(name: &str) -> EntitySnapshot {
        EntitySnapshot::new(EntityKey::generate(EntityType::Trip), Utc::now()).with_field("name", name)
    }

    fn request(snapshot: EntitySnapshot, base_version: u64) -> PushRequest {
        let entry = SyncQueueEntry::new(OperationKind::Create, snapshot, Priority::Normal, Utc::now());
        PushRequest::for_entry(&entry, None, base_version)
    }

    #[tokio::test]
    async fn replayed_push_returns_same_ack() {
        let remote = InMemoryRemote::new();
        let route = remote.route("remote");
        let push = request(trip("Hanoi"), 0);

        let first = route.push(push.clone(), None).await.unwrap();
        let second = route.push(push.clone(), None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(remote.get(&push.key()).unwrap().sync_version, 1);
    }

    #[tokio::test]
    async fn stale_base_version_conflicts() {
        let remote = InMemoryRemote::new();
        let route = remote.route("remote");
        let snapshot = trip("Hue");
        remote.write_from_other_device(snapshot.clone());

        let outcome = route.push(request(snapshot, 0), None).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Conflict(change) if change.sync_version == 1));
    }

    #[tokio::test]
    async fn pull_pages_in_storage_order() {
        let remote = InMemoryRemote::new();
        let route = remote.route("remote");
        for i in 0..5 {
            remote.write_from_other_device(trip(&format!("Trip {i}")));
        }

        let mut request = PullRequest {
            entity_type: EntityType::Trip,
            since: None,
            page_token: None,
            limit: 2,
        };
        let mut seen = Vec::new();
        loop {
            let page = route.pull(request.clone(), None).await.unwrap();
            page.validate(&request).unwrap();
            seen.extend(page.changes.iter().map(RemoteChange::position));
            match page.next_page_token {
                Some(token) => request.page_token = Some(token),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn token_and_faults_are_enforced() {
        let remote = InMemoryRemote::new();
        let route = remote.route("remote");
        remote.require_token(Some("secret"));

        let push = request(trip("Da Lat"), 0);
        let denied = route.push(push.clone(), Some(AuthToken::new("wrong"))).await;
        assert_eq!(denied, Err(RouteError::Unauthorized));

        remote.inject(Fault::LoseAck);
        let lost = route.push(push.clone(), Some(AuthToken::new("secret"))).await;
        assert_eq!(lost, Err(RouteError::Timeout));
        assert_eq!(remote.records().len(), 1);
    }
}
