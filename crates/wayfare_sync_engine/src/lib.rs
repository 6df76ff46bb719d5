//! # Wayfare Sync Engine
//!
//! Offline-first synchronization of trips, memories and media between the
//! device and one of several remote routes.
//!
//! This crate provides:
//! - Change tracking that commits entity writes and queue entries together
//! - A durable offline queue with coalescing, retries and dependency order
//! - Route adapters for a GraphQL backend and a platform cloud store
//! - Health-scored route selection with cool-down and probing
//! - Conflict handling through configurable strategies
//! - The sync state machine and the scheduler that triggers it
//!
//! ## Architecture
//!
//! Every run is **push-then-pull**:
//! 1. Upload queued entries, parents before children
//! 2. Pull remote changes per entity type from the stored cursor
//! 3. Reconcile them into the local store and advance the cursor
//!
//! Queue entries, cursors and conflict records live in one append-only
//! ledger, so a crash at any point loses nothing that was acknowledged.
//!
//! ## Key Invariants
//!
//! - At most one live queue entry per entity
//! - A cursor never moves past data that was not merged
//! - A pushed entity is acknowledged at most once per revision
//! - Local writes never wait for the network

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod clock;
mod cloud;
mod config;
mod conflicts;
mod cursors;
mod engine;
mod error;
mod graphql;
mod ledger;
mod network;
mod queue;
mod route;
mod scheduler;
mod selector;
mod store;
mod tracker;

pub use auth::{AuthProvider, AuthToken, StaticAuth};
pub use clock::{Clock, ManualClock, SystemClock};
pub use cloud::{
    AccountStatus, CloudError, CloudRecord, CloudRecordClient, CloudSyncRoute, ZoneChanges,
};
pub use config::{ConfigHandle, RetryConfig, RoutePreference, SyncConfig};
pub use conflicts::ConflictLedger;
pub use cursors::CursorStore;
pub use engine::{
    SyncContext, SyncCounts, SyncEngine, SyncOutcome, SyncProgress, SyncReport, SyncState,
    SyncStats,
};
pub use error::{
    ErrorClass, RouteError, RouteResult, StoreError, StoreResult, SyncError, SyncResult,
};
pub use graphql::{
    ChangesPayload, ChangesVariables, EntityInput, EntityNode, GraphqlClient, GraphqlError,
    GraphqlErrorExtensions, GraphqlRequest, GraphqlResponse, GraphqlRoute, PageInfo,
    TransportError, UpsertPayload, UpsertVariables,
};
pub use ledger::{Ledger, LedgerRecord, LedgerStats, SharedLedger};
pub use network::{NetworkMonitor, NetworkStatus};
pub use queue::{EnqueueOutcome, PendingMutation, QueueManager, QueueUndo};
pub use route::{LocalOnlyRoute, RouteAdapter};
pub use scheduler::{Scheduler, SchedulerHandle, SyncTrigger};
pub use selector::{HealthPolicy, RouteHealth, RouteHealthReport, RouteSelector};
pub use store::{LocalStore, MemoryLocalStore};
pub use tracker::{ChangeTracker, LocalChange, LocalCommit};
