//! # Wayfare Sync Protocol
//!
//! Data model and pure sync rules for Wayfare.
//!
//! This crate provides:
//! - [`EntitySnapshot`] and [`EntitySyncMeta`] for trips, memories and media
//! - [`SyncQueueEntry`] and its coalescing rules
//! - [`SyncCursor`] high-water marks per (entity type, route)
//! - [`ConflictRecord`] and the deterministic [`resolve`] function
//! - Typed push/pull messages exchanged with route adapters
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod cursor;
mod entity;
mod error;
mod messages;
mod operation;

pub use conflict::{
    resolve, ConflictId, ConflictOutcome, ConflictRecord, ConflictStrategy, Resolution,
};
pub use cursor::{CursorPosition, RouteId, SyncCursor};
pub use entity::{
    EntityId, EntityKey, EntitySnapshot, EntitySyncMeta, EntityType, RouteVersion, StoredEntity,
};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{PullPage, PullRequest, PushAck, PushOutcome, PushRequest, RemoteChange};
pub use operation::{CoalesceOutcome, EntryId, OperationKind, Priority, QueueStatus, SyncQueueEntry};
