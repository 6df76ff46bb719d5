//! CLI command implementations.

pub mod compact;
pub mod config_check;
pub mod conflicts;
pub mod cursors;
pub mod dump;
pub mod inspect;
pub mod queue;
pub mod retry;

use std::path::Path;
use tracing::debug;
use wayfare_sync_engine::Ledger;

/// Opens an existing ledger file without triggering compaction.
pub fn open_ledger(path: &Path) -> Result<Ledger, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No ledger found at {:?}", path).into());
    }
    debug!(?path, "opening ledger");
    Ledger::open_file(path, usize::MAX)
        .map_err(|e| format!("Could not open ledger (is the app still running?): {e}").into())
}
