//! Error types for the sync engine.

use thiserror::Error;
use wayfare_journal::JournalError;
use wayfare_sync_protocol::{ConflictId, ProtocolError};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for route adapter calls.
pub type RouteResult<T> = Result<T, RouteError>;

/// Result type for local store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// How the engine reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network trouble or a timeout; retried with backoff.
    Transient,
    /// Credentials missing or rejected; sync pauses without consuming attempts.
    Authentication,
    /// The data itself is unacceptable; fails permanently and is surfaced.
    Validation,
    /// Both sides changed; handed to the conflict resolver.
    Conflict,
    /// Local persistence failed; the engine halts.
    FatalLocal,
    /// The run was cancelled.
    Cancelled,
}

/// Errors reported by route adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Network failure or a retryable server error.
    #[error("transient route failure: {0}")]
    Transient(String),

    /// The call did not finish in time.
    #[error("route call timed out")]
    Timeout,

    /// The remote rejected the credentials.
    #[error("route rejected credentials")]
    Unauthorized,

    /// The remote rejected the payload.
    #[error("route rejected payload: {0}")]
    Validation(String),

    /// The remote failed in a way retrying cannot fix.
    #[error("fatal route failure: {0}")]
    Fatal(String),

    /// The route cannot be used right now.
    #[error("route unavailable: {0}")]
    Unavailable(String),
}

impl RouteError {
    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RouteError::Transient(_) | RouteError::Timeout | RouteError::Unavailable(_) => {
                ErrorClass::Transient
            }
            RouteError::Unauthorized => ErrorClass::Authentication,
            RouteError::Validation(_) | RouteError::Fatal(_) => ErrorClass::Validation,
        }
    }

    /// Whether the error says something about the route's health.
    pub fn counts_against_route(&self) -> bool {
        matches!(
            self,
            RouteError::Transient(_)
                | RouteError::Timeout
                | RouteError::Unavailable(_)
                | RouteError::Fatal(_)
        )
    }
}

/// Errors reported by the local store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is temporarily unable to serve the call.
    #[error("local store busy: {0}")]
    Busy(String),

    /// The store failed and cannot be trusted until repaired.
    #[error("local store failure: {0}")]
    Fatal(String),
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A route call failed.
    #[error(transparent)]
    Route(#[from] RouteError),

    /// The local store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The durable ledger failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] JournalError),

    /// Data failed validation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The run was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// No credentials are available.
    #[error("authentication required")]
    AuthRequired,

    /// The engine stopped after a fatal local error.
    #[error("sync halted: {0}")]
    Halted(String),

    /// A queue entry, conflict or entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The conflict was already settled.
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(ConflictId),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Classifies the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Route(e) => e.class(),
            SyncError::Store(StoreError::Busy(_)) => ErrorClass::Transient,
            SyncError::Store(StoreError::Fatal(_)) => ErrorClass::FatalLocal,
            SyncError::Ledger(_) | SyncError::Halted(_) => ErrorClass::FatalLocal,
            SyncError::Protocol(_) | SyncError::NotFound(_) | SyncError::Config(_) => {
                ErrorClass::Validation
            }
            SyncError::AlreadyResolved(_) => ErrorClass::Conflict,
            SyncError::Cancelled => ErrorClass::Cancelled,
            SyncError::AuthRequired => ErrorClass::Authentication,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
