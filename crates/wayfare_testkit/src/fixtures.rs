//! Device fixtures.
//!
//! A [`Device`] wires a complete engine the way an app would: an in-memory
//! entity store, a ledger (in memory or in a temp dir), a manual clock and
//! one or more routes. Helpers create trips, memories and media through
//! the change tracker and stamp them with the device clock.

use crate::remote::RemoteRoute;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wayfare_sync_engine::{
    AuthToken, Clock, ConfigHandle, Ledger, LocalCommit, ManualClock, MemoryLocalStore, NetworkMonitor,
    NetworkStatus, RouteAdapter, StaticAuth, SyncConfig, SyncContext, SyncEngine, SyncReport,
    SyncResult,
};
use wayfare_sync_protocol::{
    ConflictStrategy, EntityKey, EntitySnapshot, EntityType, StoredEntity, SyncQueueEntry,
};

/// Default start time of device clocks.
pub fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

/// Configures a [`Device`].
pub struct DeviceBuilder {
    name: String,
    routes: Vec<Arc<dyn RouteAdapter>>,
    config: SyncConfig,
    token: Option<AuthToken>,
    network: NetworkStatus,
    start: DateTime<Utc>,
    durable: bool,
}

impl DeviceBuilder {
    /// Adds a route.
    pub fn route(mut self, route: Arc<dyn RouteAdapter>) -> Self {
        self.routes.push(route);
        self
    }

    /// Adds an in-memory remote route.
    pub fn remote(self, route: &Arc<RemoteRoute>) -> Self {
        self.route(route.clone())
    }

    /// Replaces the configuration.
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the conflict strategy.
    pub fn strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.config = self.config.with_conflict_strategy(strategy);
        self
    }

    /// Starts without credentials.
    pub fn signed_out(mut self) -> Self {
        self.token = None;
        self
    }

    /// Sets the initial connectivity.
    pub fn network(mut self, status: NetworkStatus) -> Self {
        self.network = status;
        self
    }

    /// Starts the device clock at `start`.
    pub fn clock_at(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    /// Keeps the ledger in a temp dir so the device can be restarted.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Builds the device.
    pub fn build(self) -> Device {
        let dir = if self.durable {
            Some(TempDir::new().expect("Failed to create temp directory"))
        } else {
            None
        };
        let ledger_path = dir.as_ref().map(|d| d.path().join("sync.ledger"));
        let store = Arc::new(MemoryLocalStore::new());
        let auth = Arc::new(StaticAuth::new(self.token));
        let network = NetworkMonitor::new(self.network);
        let clock = Arc::new(ManualClock::new(self.start));
        let config = ConfigHandle::new(self.config);

        let engine = open_engine(
            ledger_path.as_ref(),
            &store,
            &self.routes,
            &auth,
            &network,
            &config,
            &clock,
        );
        Device {
            name: self.name,
            engine,
            store,
            auth,
            network,
            clock,
            config,
            routes: self.routes,
            ledger_path,
            _dir: dir,
        }
    }
}

fn open_engine(
    ledger_path: Option<&PathBuf>,
    store: &Arc<MemoryLocalStore>,
    routes: &[Arc<dyn RouteAdapter>],
    auth: &Arc<StaticAuth>,
    network: &NetworkMonitor,
    config: &ConfigHandle,
    clock: &Arc<ManualClock>,
) -> Arc<SyncEngine> {
    let threshold = config.current().compaction_threshold;
    let ledger = match ledger_path {
        Some(path) => Ledger::open_file(path, threshold).expect("Failed to open ledger"),
        None => Ledger::in_memory().expect("Failed to open in-memory ledger"),
    };
    let ctx = SyncContext::new(
        ledger.into_shared(),
        store.clone(),
        routes.to_vec(),
        auth.clone(),
        network.clone(),
        config.clone(),
        clock.clone(),
    );
    Arc::new(SyncEngine::new(ctx).expect("Failed to start engine"))
}

/// One simulated device.
pub struct Device {
    /// Name used in assertion messages.
    pub name: String,
    /// The engine.
    pub engine: Arc<SyncEngine>,
    /// Entity store.
    pub store: Arc<MemoryLocalStore>,
    /// Credentials.
    pub auth: Arc<StaticAuth>,
    /// Connectivity.
    pub network: NetworkMonitor,
    /// Device clock.
    pub clock: Arc<ManualClock>,
    /// Live configuration.
    pub config: ConfigHandle,
    routes: Vec<Arc<dyn RouteAdapter>>,
    ledger_path: Option<PathBuf>,
    _dir: Option<TempDir>,
}

impl Device {
    /// Starts configuring a device.
    pub fn builder(name: &str) -> DeviceBuilder {
        DeviceBuilder {
            name: name.to_string(),
            routes: Vec::new(),
            config: SyncConfig::new(),
            token: Some(AuthToken::new("device-token")),
            network: NetworkStatus::Wifi,
            start: epoch(),
            durable: false,
        }
    }

    /// A signed-in, online device using one remote route.
    pub fn with_remote(name: &str, route: &Arc<RemoteRoute>) -> Self {
        Self::builder(name).remote(route).build()
    }

    /// Current device time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Moves the device clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Commits through the change tracker.
    pub fn commit(&self, commit: LocalCommit) -> SyncResult<()> {
        self.engine.context().tracker().commit(commit)?;
        Ok(())
    }

    /// Creates a trip one second from now.
    pub fn create_trip(&self, name: &str) -> EntitySnapshot {
        self.advance(Duration::from_secs(1));
        let trip = EntitySnapshot::new(EntityKey::generate(EntityType::Trip), self.now())
            .with_field("name", name);
        self.commit(LocalCommit::new().upsert(trip.clone()))
            .expect("Failed to create trip");
        trip
    }

    /// Creates a memory under `trip`.
    pub fn create_memory(&self, trip: &EntitySnapshot, title: &str) -> EntitySnapshot {
        self.advance(Duration::from_secs(1));
        let memory = EntitySnapshot::new(EntityKey::generate(EntityType::Memory), self.now())
            .with_parent(trip.key)
            .with_field("title", title);
        self.commit(LocalCommit::new().upsert(memory.clone()))
            .expect("Failed to create memory");
        memory
    }

    /// Creates a media item under `memory`.
    pub fn create_media(&self, memory: &EntitySnapshot, uri: &str) -> EntitySnapshot {
        self.advance(Duration::from_secs(1));
        let media = EntitySnapshot::new(EntityKey::generate(EntityType::Media), self.now())
            .with_parent(memory.key)
            .with_field("uri", uri);
        self.commit(LocalCommit::new().upsert(media.clone()))
            .expect("Failed to create media");
        media
    }

    /// Edits one field of the stored entity one second from now.
    pub fn edit(&self, key: &EntityKey, field: &str, value: &str) -> EntitySnapshot {
        self.advance(Duration::from_secs(1));
        let current = self.entity(key).expect("Entity to edit does not exist");
        let edited = current.snapshot.edited(field, value, self.now());
        self.commit(LocalCommit::new().upsert(edited.clone()))
            .expect("Failed to edit entity");
        edited
    }

    /// Deletes an entity one second from now.
    pub fn delete(&self, key: &EntityKey) {
        self.advance(Duration::from_secs(1));
        self.commit(LocalCommit::new().delete(*key))
            .expect("Failed to delete entity");
    }

    /// Runs one sync cycle and returns its report.
    pub async fn sync(&self) -> SyncReport {
        self.engine
            .perform_sync()
            .await
            .expect("Another sync was already running")
    }

    /// Stored state of an entity.
    pub fn entity(&self, key: &EntityKey) -> Option<StoredEntity> {
        self.store.get(key)
    }

    /// Stored snapshot of an entity.
    pub fn snapshot(&self, key: &EntityKey) -> Option<EntitySnapshot> {
        self.entity(key).map(|e| e.snapshot)
    }

    /// Live queue entry of an entity.
    pub fn queued(&self, key: &EntityKey) -> Option<SyncQueueEntry> {
        self.engine.context().queue.entry_for(key)
    }

    /// Number of live queue entries.
    pub fn queue_len(&self) -> usize {
        self.engine.context().queue.len()
    }

    /// Simulates a process restart: the engine and ledger are reopened,
    /// the entity store survives.
    ///
    /// # Panics
    ///
    /// Panics unless the device was built with
    /// [`durable`](DeviceBuilder::durable).
    pub fn restart(self) -> Device {
        let path = self
            .ledger_path
            .clone()
            .expect("Only durable devices can restart");
        drop(self.engine);
        let engine = open_engine(
            Some(&path),
            &self.store,
            &self.routes,
            &self.auth,
            &self.network,
            &self.config,
            &self.clock,
        );
        Device { engine, ..self }
    }
}

/// Asserts that two devices hold the same live state for `keys`.
pub fn assert_converged(a: &Device, b: &Device, keys: &[EntityKey]) {
    for key in keys {
        let left = a.snapshot(key);
        let right = b.snapshot(key);
        assert_eq!(
            left.as_ref().map(|s| (&s.fields, s.deleted)),
            right.as_ref().map(|s| (&s.fields, s.deleted)),
            "{} and {} disagree on {}",
            a.name,
            b.name,
            key
        );
    }
}
