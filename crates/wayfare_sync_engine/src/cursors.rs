//! Durable pull cursors.

use crate::error::SyncResult;
use crate::ledger::{LedgerRecord, SharedLedger};
use tracing::debug;
use wayfare_sync_protocol::{CursorPosition, EntityType, RouteId, SyncCursor};

/// Per (entity type, route) high-water marks.
#[derive(Clone)]
pub struct CursorStore {
    ledger: SharedLedger,
}

impl CursorStore {
    /// Creates a cursor store over `ledger`.
    pub fn new(ledger: SharedLedger) -> Self {
        Self { ledger }
    }

    /// The cursor for `entity_type` on `route`; a fresh one if never stored.
    pub fn get(&self, entity_type: EntityType, route: &RouteId) -> SyncCursor {
        self.ledger
            .lock()
            .cursor(entity_type, route)
            .cloned()
            .unwrap_or_else(|| SyncCursor::new(entity_type, route.clone()))
    }

    /// Durably moves a cursor forward. Returns `false` if `position` is not
    /// beyond the stored one.
    pub fn advance(
        &self,
        entity_type: EntityType,
        route: &RouteId,
        position: CursorPosition,
        version: Option<u64>,
    ) -> SyncResult<bool> {
        let mut ledger = self.ledger.lock();
        let mut cursor = ledger
            .cursor(entity_type, route)
            .cloned()
            .unwrap_or_else(|| SyncCursor::new(entity_type, route.clone()));
        if !cursor.advance(position, version) {
            return Ok(false);
        }
        ledger.commit(vec![LedgerRecord::PutCursor(cursor)])?;
        debug!(%entity_type, %route, at = %position.updated_at, "cursor advanced");
        Ok(true)
    }

    /// All stored cursors.
    pub fn list(&self) -> Vec<SyncCursor> {
        self.ledger.lock().cursors().cloned().collect()
    }
}
