//! Sync engine state machine.
//!
//! One run moves through `Uploading`, `Downloading` and `Reconciling`
//! and returns to `Idle`:
//!
//! ```text
//! Idle ──▶ Uploading ──▶ Downloading ──▶ Reconciling ──▶ Idle
//!              │               │                │
//!              └───────────────┴────────────────┴──▶ Error | AuthRequired | Halted
//! ```
//!
//! # Invariants
//!
//! - At most one run executes at a time. A trigger that arrives during a
//!   run schedules exactly one follow-up run.
//! - Each queue entry is pushed at most once per run, plus one retry after
//!   a conflict put it back in line.
//! - A child entry is never pushed in the same wave as, or before, its
//!   parent. If the parent does not complete, the child is released.
//! - A cursor only moves after every page of its batch was merged.
//! - A fatal local error halts the engine until [`SyncEngine::clear_halt`].

use crate::auth::{AuthProvider, AuthToken};
use crate::clock::Clock;
use crate::config::{ConfigHandle, SyncConfig};
use crate::conflicts::ConflictLedger;
use crate::cursors::CursorStore;
use crate::error::{ErrorClass, RouteError, SyncError, SyncResult};
use crate::ledger::SharedLedger;
use crate::network::NetworkMonitor;
use crate::queue::{PendingMutation, QueueManager};
use crate::route::RouteAdapter;
use crate::selector::{HealthPolicy, RouteSelector};
use crate::store::LocalStore;
use crate::tracker::ChangeTracker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use wayfare_sync_protocol::{
    resolve, ConflictId, ConflictOutcome, ConflictRecord, ConflictStrategy, EntityKey,
    EntitySnapshot, EntitySyncMeta, EntryId, OperationKind, Priority, ProtocolError, PullRequest,
    PushOutcome, PushRequest, QueueStatus, RemoteChange, Resolution, RouteId, StoredEntity,
    SyncQueueEntry,
};

/// Everything the engine works with, passed in explicitly.
#[derive(Clone)]
pub struct SyncContext {
    /// Durable queue, cursor and conflict state.
    pub ledger: SharedLedger,
    /// Application data.
    pub store: Arc<dyn LocalStore>,
    /// Offline queue.
    pub queue: Arc<QueueManager>,
    /// Pull cursors.
    pub cursors: CursorStore,
    /// Conflict records.
    pub conflicts: ConflictLedger,
    /// Route choice and health.
    pub selector: Arc<RouteSelector>,
    /// Credentials.
    pub auth: Arc<dyn AuthProvider>,
    /// Connectivity.
    pub network: NetworkMonitor,
    /// Live configuration.
    pub config: ConfigHandle,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Serializes read-modify-write cycles on the store between the engine
    /// and the change tracker.
    pub write_lock: Arc<Mutex<()>>,
}

impl SyncContext {
    /// Wires the components around one ledger.
    pub fn new(
        ledger: SharedLedger,
        store: Arc<dyn LocalStore>,
        routes: Vec<Arc<dyn RouteAdapter>>,
        auth: Arc<dyn AuthProvider>,
        network: NetworkMonitor,
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let current = config.current();
        let queue = Arc::new(QueueManager::new(ledger.clone(), clock.clone(), current.retry));
        let selector = Arc::new(RouteSelector::new(routes, clock.clone()));
        selector.set_policy(HealthPolicy::from(&current));
        Self {
            cursors: CursorStore::new(ledger.clone()),
            conflicts: ConflictLedger::new(ledger.clone()),
            ledger,
            store,
            queue,
            selector,
            auth,
            network,
            config,
            clock,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A change tracker writing through this context.
    pub fn tracker(&self) -> ChangeTracker {
        ChangeTracker::new(self.store.clone(), self.queue.clone(), self.clock.clone())
            .with_write_lock(self.write_lock.clone())
    }
}

/// The engine's current activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Waiting for a trigger.
    Idle,
    /// Pushing queued entries.
    Uploading,
    /// Pulling remote changes.
    Downloading,
    /// Merging pulled changes into the store.
    Reconciling,
    /// The last run failed; the next trigger retries.
    Error,
    /// Paused until credentials are available.
    AuthRequired,
    /// Stopped after a fatal local error.
    Halted,
}

impl SyncState {
    /// Returns true while a run is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Uploading | SyncState::Downloading | SyncState::Reconciling
        )
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum SyncOutcome {
    /// Upload and download finished.
    Completed,
    /// No usable connection.
    Offline,
    /// Cancelled by the caller.
    Cancelled,
    /// No token, or the route rejected it.
    AuthRequired,
    /// No route can be used right now.
    RouteUnavailable(String),
    /// The run failed and will be retried on the next trigger.
    Failed(String),
    /// The engine is halted.
    Halted(String),
}

impl SyncOutcome {
    fn final_state(&self) -> SyncState {
        match self {
            SyncOutcome::Completed
            | SyncOutcome::Offline
            | SyncOutcome::Cancelled
            | SyncOutcome::RouteUnavailable(_) => SyncState::Idle,
            SyncOutcome::AuthRequired => SyncState::AuthRequired,
            SyncOutcome::Failed(_) => SyncState::Error,
            SyncOutcome::Halted(_) => SyncState::Halted,
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Completed => f.write_str("completed"),
            SyncOutcome::Offline => f.write_str("offline"),
            SyncOutcome::Cancelled => f.write_str("cancelled"),
            SyncOutcome::AuthRequired => f.write_str("auth required"),
            SyncOutcome::RouteUnavailable(reason) => write!(f, "route unavailable: {reason}"),
            SyncOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            SyncOutcome::Halted(reason) => write!(f, "halted: {reason}"),
        }
    }
}

/// Per-run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    /// Entries acknowledged by the route.
    pub pushed: usize,
    /// Failed push attempts that will be retried.
    pub failed: usize,
    /// Entries that gave up or were rejected.
    pub rejected: usize,
    /// Remote changes pulled.
    pub pulled: usize,
    /// Remote changes written to the store.
    pub applied: usize,
    /// Remote changes already reflected locally.
    pub skipped: usize,
    /// Conflicts settled automatically.
    pub conflicts_resolved: usize,
    /// Conflicts left for the user.
    pub conflicts_deferred: usize,
}

/// Snapshot published while a run progresses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncProgress {
    /// Current state.
    pub state: SyncState,
    /// Route of the current run.
    pub route: Option<RouteId>,
    /// Counters so far.
    pub counts: SyncCounts,
    /// Entries still waiting.
    pub pending: usize,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            route: None,
            counts: SyncCounts::default(),
            pending: 0,
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    /// Route used, if one was selected.
    pub route: Option<RouteId>,
    /// How the run ended.
    pub outcome: SyncOutcome,
    /// Counters.
    pub counts: SyncCounts,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// How long it took.
    pub duration: Duration,
}

/// Lifetime statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    /// Runs executed.
    pub runs: u64,
    /// Runs that completed.
    pub completed_runs: u64,
    /// Entries acknowledged.
    pub pushed: u64,
    /// Changes pulled.
    pub pulled: u64,
    /// Conflicts seen.
    pub conflicts: u64,
    /// Start of the last run.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Outcome of the last run.
    pub last_outcome: Option<SyncOutcome>,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

enum Flow {
    Continue,
    Stop(SyncOutcome),
}

enum Settled {
    Completed,
    Held,
    Requeued,
    Unauthorized,
}

/// The sync engine.
pub struct SyncEngine {
    ctx: SyncContext,
    state: watch::Sender<SyncState>,
    progress: watch::Sender<SyncProgress>,
    running: AtomicBool,
    follow_up: AtomicBool,
    run_lock: tokio::sync::Mutex<()>,
    run_counter: AtomicU64,
    halted: Mutex<Option<String>>,
    stats: RwLock<SyncStats>,
    cancel: Mutex<CancellationToken>,
}

impl SyncEngine {
    /// Creates an engine. In-flight entries left by a previous process are
    /// returned to pending, then every stored entity's `needs_sync` flag is
    /// matched against the queue.
    pub fn new(ctx: SyncContext) -> SyncResult<Self> {
        let recovered = ctx.queue.recover()?;
        ctx.ledger
            .lock()
            .set_compaction_threshold(ctx.config.current().compaction_threshold);
        let repaired = ctx.tracker().rescan(None)?;
        if recovered > 0 || repaired > 0 {
            info!(recovered, repaired, "engine started with recovered entries");
        }
        Ok(Self {
            ctx,
            state: watch::channel(SyncState::Idle).0,
            progress: watch::channel(SyncProgress::default()).0,
            running: AtomicBool::new(false),
            follow_up: AtomicBool::new(false),
            run_lock: tokio::sync::Mutex::new(()),
            run_counter: AtomicU64::new(0),
            halted: Mutex::new(None),
            stats: RwLock::new(SyncStats::default()),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// The engine's components.
    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Latest progress.
    pub fn progress(&self) -> SyncProgress {
        self.progress.borrow().clone()
    }

    /// Subscribes to progress updates.
    pub fn subscribe_progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.subscribe()
    }

    /// Lifetime statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true once a fatal local error stopped the engine.
    pub fn is_halted(&self) -> bool {
        self.halted.lock().is_some()
    }

    /// Lets the engine run again after a fatal error was dealt with.
    pub fn clear_halt(&self) {
        if self.halted.lock().take().is_some() {
            info!("halt cleared");
            self.state.send_replace(SyncState::Idle);
        }
    }

    /// Cancels the run in progress. Entries not yet settled are released.
    ///
    /// A cancel that lands after [`perform_sync`](Self::perform_sync) was
    /// called but before its run started stops that run. With no run
    /// claimed the call does nothing.
    pub fn cancel(&self) {
        if self.running.load(Ordering::SeqCst) {
            self.cancel.lock().cancel();
        } else {
            debug!("no sync running; cancel ignored");
        }
    }

    /// Runs a sync cycle.
    ///
    /// Returns `None` if a run was already in progress; that run is then
    /// followed by exactly one more, however many calls arrived meanwhile.
    pub async fn perform_sync(&self) -> Option<SyncReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.follow_up.store(true, Ordering::SeqCst);
            debug!("sync already running; follow-up scheduled");
            return None;
        }

        loop {
            let run = self.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
            let report = self.run_once().instrument(info_span!("sync_run", run)).await;

            if self.follow_up.swap(false, Ordering::SeqCst) {
                continue;
            }
            self.running.store(false, Ordering::SeqCst);
            if self.follow_up.load(Ordering::SeqCst) && !self.running.swap(true, Ordering::SeqCst) {
                self.follow_up.store(false, Ordering::SeqCst);
                continue;
            }
            return Some(report);
        }
    }

    /// Resets a failed entry so the next run tries it again.
    pub fn retry(&self, id: &EntryId) -> SyncResult<()> {
        let _write = self.ctx.write_lock.lock();
        self.ctx.queue.retry(id)?;
        if let Some(entry) = self.ctx.queue.entry(id) {
            self.flag_needs_sync(&entry.key, true)?;
        }
        Ok(())
    }

    /// Resets every failed entry. Returns how many were reset.
    pub fn retry_all_failed(&self) -> SyncResult<usize> {
        let _write = self.ctx.write_lock.lock();
        let ids = self.ctx.queue.retry_all_failed()?;
        for id in &ids {
            if let Some(entry) = self.ctx.queue.entry(id) {
                self.flag_needs_sync(&entry.key, true)?;
            }
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "failed entries reset");
        }
        Ok(ids.len())
    }

    /// Conflicts waiting for the user.
    pub fn unresolved_conflicts(&self) -> Vec<ConflictRecord> {
        self.ctx.conflicts.unresolved()
    }

    /// Settles a deferred conflict with the state the user chose.
    ///
    /// Choosing the remote snapshot adopts it and drops the local change;
    /// anything else is stored on top of the remote version and pushed.
    pub async fn resolve_manual(
        &self,
        id: &ConflictId,
        chosen: EntitySnapshot,
    ) -> SyncResult<ConflictRecord> {
        let _run = self.run_lock.lock().await;
        let record = self
            .ctx
            .conflicts
            .get(id)
            .ok_or_else(|| SyncError::NotFound(format!("conflict {id}")))?;
        if record.is_resolved() {
            return Err(SyncError::AlreadyResolved(*id));
        }
        if chosen.key != record.key {
            return Err(ProtocolError::InvalidEntity {
                entity: chosen.key.to_string(),
                reason: format!("chosen state belongs to another entity than {}", record.key),
            }
            .into());
        }
        chosen.validate()?;

        {
            let _write = self.ctx.write_lock.lock();
            let entry = self.ctx.queue.entry_for(&record.key);
            let current = self
                .ctx
                .store
                .load(&record.key)?
                .map(|e| e.meta)
                .unwrap_or_default();
            let meta = |needs_sync| {
                let mut meta = current.clone();
                if let Some(route) = &record.route {
                    meta.record_exchange(route, &record.remote_server_id, record.remote_version);
                }
                meta.needs_sync = needs_sync;
                meta.last_synced_at = Some(record.remote_snapshot.updated_at);
                meta
            };

            if chosen == record.remote_snapshot {
                self.ctx.store.apply_merged(&[StoredEntity {
                    snapshot: chosen,
                    meta: meta(false),
                }])?;
                if let Some(entry) = entry {
                    self.ctx.queue.discard(&entry.id)?;
                }
            } else {
                self.ctx.store.apply_merged(&[StoredEntity {
                    snapshot: chosen.clone(),
                    meta: meta(true),
                }])?;
                self.push_again(entry.map(|e| e.id), chosen, true)?;
            }
        }

        let settled = self
            .ctx
            .conflicts
            .settle(id, ConflictOutcome::UserChoice, self.ctx.clock.now())?;
        info!(conflict = %id, entity = %settled.key, "conflict resolved by user");
        Ok(settled)
    }

    async fn run_once(&self) -> SyncReport {
        let _run = self.run_lock.lock().await;
        let config = self.ctx.config.current();
        let started = Instant::now();
        let started_at = self.ctx.clock.now();
        let cancel = self.cancel.lock().clone();

        self.ctx.queue.set_retry(config.retry);
        self.ctx.selector.set_policy(HealthPolicy::from(&config));
        self.ctx
            .ledger
            .lock()
            .set_compaction_threshold(config.compaction_threshold);

        let mut route = None;
        let mut counts = SyncCounts::default();
        let outcome = match self.execute(&config, &cancel, &mut route, &mut counts).await {
            Ok(outcome) => outcome,
            Err(error) => self.outcome_for(error),
        };

        if outcome != SyncOutcome::Completed {
            if let Err(e) = self.ctx.queue.recover() {
                warn!(error = %e, "could not release in-flight entries");
            }
        }

        let state = outcome.final_state();
        self.state.send_replace(state);
        self.progress.send_replace(SyncProgress {
            state,
            route: route.clone(),
            counts,
            pending: self.ctx.queue.pending_count(),
        });

        *self.cancel.lock() = CancellationToken::new();

        let report = SyncReport {
            route,
            outcome,
            counts,
            started_at,
            duration: started.elapsed(),
        };
        self.record_stats(&report);
        info!(
            route = report.route.as_ref().map(RouteId::as_str),
            outcome = %report.outcome,
            pushed = counts.pushed,
            pulled = counts.pulled,
            applied = counts.applied,
            conflicts = counts.conflicts_resolved + counts.conflicts_deferred,
            duration_ms = report.duration.as_millis() as u64,
            "sync run finished"
        );
        report
    }

    async fn execute(
        &self,
        config: &SyncConfig,
        cancel: &CancellationToken,
        route_used: &mut Option<RouteId>,
        counts: &mut SyncCounts,
    ) -> SyncResult<SyncOutcome> {
        let halted = self.halted.lock().clone();
        if let Some(reason) = halted {
            return Ok(SyncOutcome::Halted(reason));
        }
        if !self.ctx.network.is_online(config.wifi_only) {
            debug!(status = ?self.ctx.network.status(), "skipping sync while offline");
            return Ok(SyncOutcome::Offline);
        }
        let Some(token) = self.ctx.auth.current_token() else {
            return Ok(SyncOutcome::AuthRequired);
        };

        self.ctx.selector.refresh().await;
        let route = match self.ctx.selector.select(&config.route_preference) {
            Ok(route) => route,
            Err(error) => {
                warn!(%error, "no route for this run");
                return Ok(SyncOutcome::RouteUnavailable(error.to_string()));
            }
        };
        *route_used = Some(route.id().clone());

        self.enter(SyncState::Uploading, route_used, counts);
        if let Flow::Stop(outcome) = self.upload(&route, &token, config, cancel, counts).await? {
            return Ok(outcome);
        }

        if cancel.is_cancelled() {
            return Ok(SyncOutcome::Cancelled);
        }
        self.enter(SyncState::Downloading, route_used, counts);
        if let Flow::Stop(outcome) = self.download(&route, &token, config, cancel, counts).await? {
            return Ok(outcome);
        }
        Ok(SyncOutcome::Completed)
    }

    async fn upload(
        &self,
        route: &Arc<dyn RouteAdapter>,
        token: &AuthToken,
        config: &SyncConfig,
        cancel: &CancellationToken,
        counts: &mut SyncCounts,
    ) -> SyncResult<Flow> {
        let mut attempted: HashSet<EntryId> = HashSet::new();
        let mut second_chance: HashSet<EntryId> = HashSet::new();

        loop {
            if let Some(outcome) = self.interrupted(config, cancel) {
                return Ok(Flow::Stop(outcome));
            }
            let batch = self
                .ctx
                .queue
                .dequeue_batch(config.upload_batch_size, &attempted)?;
            if batch.is_empty() {
                return Ok(Flow::Continue);
            }
            attempted.extend(batch.iter().map(|e| e.id));
            debug!(entries = batch.len(), "upload batch");

            let mut held: HashSet<EntityKey> = HashSet::new();
            let mut waves = into_waves(batch).into_iter();
            while let Some(wave) = waves.next() {
                let (ready, orphaned): (Vec<_>, Vec<_>) = wave
                    .into_iter()
                    .partition(|e| e.parent.map_or(true, |p| !held.contains(&p)));
                for entry in orphaned {
                    debug!(entry = %entry.id, entity = %entry.key, "parent not delivered; child released");
                    self.ctx.queue.release(&entry.id)?;
                    held.insert(entry.key);
                }

                if let Some(outcome) = self.interrupted(config, cancel) {
                    self.release_all(ready.into_iter().chain(waves.by_ref().flatten()))?;
                    return Ok(Flow::Stop(outcome));
                }

                let mut paused = false;
                for (entry, result, latency) in self.push_wave(route, token, config, ready).await? {
                    let id = entry.id;
                    let key = entry.key;
                    match self.settle_push(route, entry, result, latency, config, counts)? {
                        Settled::Completed => {}
                        Settled::Held => {
                            held.insert(key);
                        }
                        Settled::Requeued => {
                            held.insert(key);
                            if second_chance.insert(id) {
                                attempted.remove(&id);
                            }
                        }
                        Settled::Unauthorized => {
                            held.insert(key);
                            paused = true;
                        }
                    }
                }
                self.publish(route.id(), counts);

                if paused {
                    self.release_all(waves.by_ref().flatten())?;
                    self.ctx.auth.on_unauthorized();
                    warn!(route = %route.id(), "route rejected credentials; sync paused");
                    return Ok(Flow::Stop(SyncOutcome::AuthRequired));
                }
            }
        }
    }

    async fn push_wave(
        &self,
        route: &Arc<dyn RouteAdapter>,
        token: &AuthToken,
        config: &SyncConfig,
        wave: Vec<SyncQueueEntry>,
    ) -> SyncResult<Vec<(SyncQueueEntry, Result<PushOutcome, RouteError>, Duration)>> {
        let mut requests = Vec::with_capacity(wave.len());
        for entry in wave {
            let meta = self
                .ctx
                .store
                .load(&entry.key)?
                .map(|e| e.meta)
                .unwrap_or_default();
            let request = PushRequest::for_entry(
                &entry,
                meta.server_id_on(route.id()).map(str::to_string),
                meta.version_on(route.id()),
            );
            requests.push((entry, request));
        }

        let timeout = config.request_timeout;
        let results: Vec<_> = futures::stream::iter(requests)
            .map(|(entry, request)| {
                let route = route.clone();
                let token = token.clone();
                async move {
                    let started = Instant::now();
                    let result = tokio::time::timeout(timeout, route.push(request, Some(token)))
                        .await
                        .unwrap_or(Err(RouteError::Timeout));
                    (entry, result, started.elapsed())
                }
            })
            .buffer_unordered(config.upload_concurrency)
            .collect()
            .await;
        Ok(results)
    }

    fn settle_push(
        &self,
        route: &Arc<dyn RouteAdapter>,
        entry: SyncQueueEntry,
        result: Result<PushOutcome, RouteError>,
        latency: Duration,
        config: &SyncConfig,
        counts: &mut SyncCounts,
    ) -> SyncResult<Settled> {
        let result = match result {
            Ok(PushOutcome::Applied(ack)) => match ack.validate() {
                Ok(()) => Ok(PushOutcome::Applied(ack)),
                Err(e) => Err(RouteError::Transient(e.to_string())),
            },
            other => other,
        };

        let _write = self.ctx.write_lock.lock();
        match result {
            Ok(PushOutcome::Applied(ack)) => {
                self.ctx.selector.record_success(route.id(), latency);
                let changed_in_flight = self
                    .ctx
                    .queue
                    .entry(&entry.id)
                    .is_some_and(|current| current.revision != entry.revision);
                if let Some(mut stored) = self.ctx.store.load(&entry.key)? {
                    stored
                        .meta
                        .record_exchange(route.id(), &ack.server_id, ack.sync_version);
                    stored.meta.last_synced_at = Some(ack.updated_at);
                    stored.meta.needs_sync = changed_in_flight;
                    self.ctx.store.apply_merged(&[stored])?;
                }
                self.ctx.queue.mark_completed(&entry.id, entry.revision)?;
                counts.pushed += 1;
                debug!(entry = %entry.id, entity = %entry.key, version = ack.sync_version, "push acknowledged");
                Ok(Settled::Completed)
            }
            Ok(PushOutcome::Conflict(change)) => {
                self.ctx.selector.record_success(route.id(), latency);
                if change.key() != entry.key {
                    let error = RouteError::Transient(format!(
                        "conflict reported for {} while pushing {}",
                        change.key(),
                        entry.key
                    ));
                    return self.settle_failure(route, entry, error, counts);
                }
                let local = self
                    .ctx
                    .store
                    .load(&entry.key)?
                    .unwrap_or_else(|| StoredEntity {
                        snapshot: entry.payload.clone(),
                        meta: EntitySyncMeta::default(),
                    });
                let requeued = self.handle_conflict(
                    route.id(),
                    Some(&entry),
                    local,
                    change,
                    config.conflict_strategy,
                    counts,
                )?;
                Ok(if requeued {
                    Settled::Requeued
                } else {
                    Settled::Held
                })
            }
            Err(error) => self.settle_failure(route, entry, error, counts),
        }
    }

    fn settle_failure(
        &self,
        route: &Arc<dyn RouteAdapter>,
        entry: SyncQueueEntry,
        error: RouteError,
        counts: &mut SyncCounts,
    ) -> SyncResult<Settled> {
        self.ctx.selector.record_failure(route.id(), &error);
        let message = error.to_string();
        match error {
            RouteError::Unauthorized => {
                self.ctx.queue.release(&entry.id)?;
                Ok(Settled::Unauthorized)
            }
            RouteError::Unavailable(_) => {
                self.ctx.queue.release(&entry.id)?;
                Ok(Settled::Held)
            }
            RouteError::Transient(_) | RouteError::Timeout => {
                let status = self.ctx.queue.mark_failed(&entry.id, &message)?;
                if status == QueueStatus::Failed {
                    counts.rejected += 1;
                    self.flag_needs_sync(&entry.key, false)?;
                } else {
                    counts.failed += 1;
                    debug!(entry = %entry.id, error = %message, "push failed; will retry");
                }
                Ok(Settled::Held)
            }
            RouteError::Validation(_) | RouteError::Fatal(_) => {
                self.ctx.queue.mark_rejected(&entry.id, &message)?;
                self.flag_needs_sync(&entry.key, false)?;
                counts.rejected += 1;
                Ok(Settled::Held)
            }
        }
    }

    async fn download(
        &self,
        route: &Arc<dyn RouteAdapter>,
        token: &AuthToken,
        config: &SyncConfig,
        cancel: &CancellationToken,
        counts: &mut SyncCounts,
    ) -> SyncResult<Flow> {
        for &entity_type in &config.tracked_types {
            let cursor = self.ctx.cursors.get(entity_type, route.id());
            let mut buffer: Vec<RemoteChange> = Vec::new();
            let mut page_token = None;

            loop {
                if let Some(outcome) = self.interrupted(config, cancel) {
                    return Ok(Flow::Stop(outcome));
                }
                let request = PullRequest {
                    entity_type,
                    since: cursor.position,
                    page_token: page_token.take(),
                    limit: config.pull_page_size,
                };
                let started = Instant::now();
                let result = tokio::time::timeout(
                    config.request_timeout,
                    route.pull(request.clone(), Some(token.clone())),
                )
                .await
                .unwrap_or(Err(RouteError::Timeout));

                let page = match result {
                    Ok(page) => page,
                    Err(RouteError::Unauthorized) => {
                        self.ctx.auth.on_unauthorized();
                        warn!(route = %route.id(), "route rejected credentials during pull");
                        return Ok(Flow::Stop(SyncOutcome::AuthRequired));
                    }
                    Err(error) => {
                        self.ctx.selector.record_failure(route.id(), &error);
                        return Err(error.into());
                    }
                };
                if let Err(e) = page.validate(&request) {
                    self.ctx
                        .selector
                        .record_failure(route.id(), &RouteError::Transient(e.to_string()));
                    return Err(e.into());
                }
                self.ctx.selector.record_success(route.id(), started.elapsed());

                debug!(%entity_type, changes = page.changes.len(), "pulled page");
                let last = page.is_last();
                page_token = page.next_page_token;
                buffer.extend(page.changes);
                if last {
                    break;
                }
            }

            counts.pulled += buffer.len();
            if buffer.is_empty() {
                continue;
            }

            self.enter(SyncState::Reconciling, &Some(route.id().clone()), counts);
            self.reconcile_batch(route.id(), &buffer, config.conflict_strategy, counts)?;

            let position = buffer.iter().map(RemoteChange::position).max();
            let version = buffer.iter().map(|c| c.sync_version).max();
            if let Some(position) = position {
                self.ctx
                    .cursors
                    .advance(entity_type, route.id(), position, version)?;
            }
            self.enter(SyncState::Downloading, &Some(route.id().clone()), counts);
        }
        Ok(Flow::Continue)
    }

    fn reconcile_batch(
        &self,
        route: &RouteId,
        changes: &[RemoteChange],
        strategy: ConflictStrategy,
        counts: &mut SyncCounts,
    ) -> SyncResult<()> {
        let _write = self.ctx.write_lock.lock();
        for change in changes {
            self.reconcile(route, change, strategy, counts)?;
        }
        Ok(())
    }

    /// Merges one pulled change. Versions are compared against what this
    /// route last acknowledged, never against another route's numbering.
    fn reconcile(
        &self,
        route: &RouteId,
        change: &RemoteChange,
        strategy: ConflictStrategy,
        counts: &mut SyncCounts,
    ) -> SyncResult<()> {
        let key = change.key();
        let entry = self.ctx.queue.entry_for(&key);
        let local = match (self.ctx.store.load(&key)?, &entry) {
            (Some(local), _) => local,
            (None, Some(entry)) => StoredEntity {
                snapshot: entry.payload.clone(),
                meta: EntitySyncMeta::default(),
            },
            (None, None) => {
                self.ctx.store.apply_merged(&[adopted(route, change, None)])?;
                counts.applied += 1;
                debug!(entity = %key, version = change.sync_version, "remote entity created locally");
                return Ok(());
            }
        };

        if change.sync_version <= local.meta.version_on(route) {
            counts.skipped += 1;
            return Ok(());
        }

        let dirty = entry.is_some() || local.modified_since_sync();
        if !dirty {
            self.ctx
                .store
                .apply_merged(&[adopted(route, change, Some(&local.meta))])?;
            counts.applied += 1;
            debug!(entity = %key, version = change.sync_version, "remote change applied");
            return Ok(());
        }

        if let Some(open) = self.ctx.conflicts.unresolved_for(&key) {
            if open.route.as_ref() == Some(route) && open.remote_version >= change.sync_version {
                counts.skipped += 1;
                return Ok(());
            }
        }

        self.handle_conflict(route, entry.as_ref(), local, change.clone(), strategy, counts)?;
        Ok(())
    }

    /// Applies a conflict resolution and keeps a record of it. Returns true
    /// if the entity's entry was put back in line. Callers hold the write
    /// lock.
    fn handle_conflict(
        &self,
        route: &RouteId,
        entry: Option<&SyncQueueEntry>,
        local: StoredEntity,
        change: RemoteChange,
        strategy: ConflictStrategy,
        counts: &mut SyncCounts,
    ) -> SyncResult<bool> {
        let key = local.snapshot.key;
        let baseline = local.meta.last_synced_at;
        let resolution = resolve(&local.snapshot, &change.payload, baseline, strategy);
        debug!(entity = %key, %route, %strategy, ?resolution, "conflict detected");
        let record = ConflictRecord::new(
            local.snapshot.clone(),
            change.payload.clone(),
            change.sync_version,
            change.server_id.clone(),
            baseline,
            strategy,
            self.ctx.clock.now(),
        )
        .on_route(route.clone());

        let requeued = match &resolution {
            Resolution::AcceptRemote => {
                self.ctx
                    .store
                    .apply_merged(&[adopted(route, &change, Some(&local.meta))])?;
                if let Some(entry) = entry {
                    self.ctx.queue.discard(&entry.id)?;
                }
                counts.applied += 1;
                false
            }
            Resolution::KeepLocal => {
                let snapshot = local.snapshot.clone();
                self.ctx
                    .store
                    .apply_merged(&[rebased(route, snapshot.clone(), &change, &local.meta)])?;
                self.push_again(entry.map(|e| e.id), snapshot, false)?;
                true
            }
            Resolution::Merged(merged) => {
                self.ctx
                    .store
                    .apply_merged(&[rebased(route, merged.clone(), &change, &local.meta)])?;
                self.push_again(entry.map(|e| e.id), merged.clone(), true)?;
                counts.applied += 1;
                true
            }
            Resolution::Deferred => {
                self.ctx.conflicts.record(record, entry.map(|e| e.id))?;
                counts.conflicts_deferred += 1;
                return Ok(false);
            }
        };

        counts.conflicts_resolved += 1;
        let outcome = ConflictOutcome::from(&resolution);
        let now = self.ctx.clock.now();
        match self.ctx.conflicts.unresolved_for(&key) {
            Some(open) => {
                self.ctx.conflicts.settle(&open.id, outcome, now)?;
            }
            None => {
                self.ctx.conflicts.record_resolved(record, outcome, now)?;
            }
        }
        Ok(requeued)
    }

    /// Puts an entity back in the queue after a conflict.
    fn push_again(
        &self,
        entry: Option<EntryId>,
        snapshot: EntitySnapshot,
        replace_payload: bool,
    ) -> SyncResult<()> {
        match entry {
            Some(id) => self
                .ctx
                .queue
                .requeue(&id, replace_payload.then_some(snapshot)),
            None => {
                let operation = if snapshot.deleted {
                    OperationKind::Delete
                } else {
                    OperationKind::Update
                };
                self.ctx.queue.enqueue(PendingMutation {
                    operation,
                    payload: snapshot,
                    priority: Priority::Normal,
                    had_server_id: true,
                })?;
                Ok(())
            }
        }
    }

    fn flag_needs_sync(&self, key: &EntityKey, needs_sync: bool) -> SyncResult<()> {
        if let Some(mut stored) = self.ctx.store.load(key)? {
            if stored.meta.needs_sync != needs_sync {
                stored.meta.needs_sync = needs_sync;
                self.ctx.store.apply_merged(&[stored])?;
            }
        }
        Ok(())
    }

    fn release_all(&self, entries: impl Iterator<Item = SyncQueueEntry>) -> SyncResult<()> {
        for entry in entries {
            self.ctx.queue.release(&entry.id)?;
        }
        Ok(())
    }

    fn interrupted(&self, config: &SyncConfig, cancel: &CancellationToken) -> Option<SyncOutcome> {
        if cancel.is_cancelled() {
            info!("sync run cancelled");
            return Some(SyncOutcome::Cancelled);
        }
        if !self.ctx.network.is_online(config.wifi_only) {
            info!("network lost during sync");
            return Some(SyncOutcome::Offline);
        }
        None
    }

    fn outcome_for(&self, error: SyncError) -> SyncOutcome {
        match error.class() {
            ErrorClass::FatalLocal => {
                let reason = error.to_string();
                error!(%reason, "fatal local error; sync halted");
                *self.halted.lock() = Some(reason.clone());
                SyncOutcome::Halted(reason)
            }
            ErrorClass::Cancelled => SyncOutcome::Cancelled,
            ErrorClass::Authentication => SyncOutcome::AuthRequired,
            _ => {
                warn!(%error, "sync run failed");
                SyncOutcome::Failed(error.to_string())
            }
        }
    }

    fn enter(&self, state: SyncState, route: &Option<RouteId>, counts: &SyncCounts) {
        self.state.send_replace(state);
        self.progress.send_replace(SyncProgress {
            state,
            route: route.clone(),
            counts: *counts,
            pending: self.ctx.queue.pending_count(),
        });
    }

    fn publish(&self, route: &RouteId, counts: &SyncCounts) {
        self.progress.send_modify(|progress| {
            progress.route = Some(route.clone());
            progress.counts = *counts;
        });
    }

    fn record_stats(&self, report: &SyncReport) {
        let mut stats = self.stats.write();
        stats.runs += 1;
        if report.outcome == SyncOutcome::Completed {
            stats.completed_runs += 1;
        }
        stats.pushed += report.counts.pushed as u64;
        stats.pulled += report.counts.pulled as u64;
        stats.conflicts +=
            (report.counts.conflicts_resolved + report.counts.conflicts_deferred) as u64;
        stats.last_run_at = Some(report.started_at);
        if let SyncOutcome::Failed(reason) | SyncOutcome::Halted(reason) = &report.outcome {
            stats.last_error = Some(reason.clone());
        }
        stats.last_outcome = Some(report.outcome.clone());
    }
}

/// The remote state as a clean local entity.
fn adopted(route: &RouteId, change: &RemoteChange, previous: Option<&EntitySyncMeta>) -> StoredEntity {
    let mut meta = previous.cloned().unwrap_or_default();
    meta.record_exchange(route, &change.server_id, change.sync_version);
    meta.needs_sync = false;
    meta.last_synced_at = Some(change.payload.updated_at);
    StoredEntity {
        snapshot: change.payload.clone(),
        meta,
    }
}

/// `snapshot` on top of the remote version, waiting to be pushed.
fn rebased(
    route: &RouteId,
    snapshot: EntitySnapshot,
    change: &RemoteChange,
    previous: &EntitySyncMeta,
) -> StoredEntity {
    let mut meta = previous.clone();
    meta.record_exchange(route, &change.server_id, change.sync_version);
    meta.needs_sync = true;
    meta.last_synced_at = Some(change.payload.updated_at);
    StoredEntity { snapshot, meta }
}

/// Splits a dequeued batch so every entry comes one wave after its parent.
fn into_waves(batch: Vec<SyncQueueEntry>) -> Vec<Vec<SyncQueueEntry>> {
    let mut depth: HashMap<EntityKey, usize> = HashMap::new();
    let mut waves: Vec<Vec<SyncQueueEntry>> = Vec::new();
    for entry in batch {
        let level = entry
            .parent
            .and_then(|parent| depth.get(&parent))
            .map_or(0, |d| d + 1);
        depth.insert(entry.key, level);
        if waves.len() <= level {
            waves.resize_with(level + 1, Vec::new);
        }
        waves[level].push(entry);
    }
    waves
}
