//! Retry command implementation.

use super::open_ledger;
use std::path::Path;
use std::sync::Arc;
use wayfare_sync_engine::{QueueManager, RetryConfig, SystemClock};
use wayfare_sync_protocol::{EntryId, QueueStatus};

/// Which entries to reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// One entry.
    Entry(EntryId),
    /// Every entry that gave up.
    AllFailed,
}

/// Runs the retry command.
///
/// Only the ledger is touched. The entity's `needs_sync` flag lives in the
/// app's store and is set again the next time the app starts its engine,
/// which rescans the store against the queue.
pub fn run(path: &Path, target: Target) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = open_ledger(path)?.into_shared();
    let queue = QueueManager::new(ledger, Arc::new(SystemClock), RetryConfig::default());

    match target {
        Target::Entry(id) => {
            let entry = queue
                .entry(&id)
                .ok_or_else(|| format!("No entry {id} in the ledger"))?;
            if entry.status != QueueStatus::Failed {
                println!("Entry {id} is {:?}; resetting attempts anyway", entry.status);
            }
            queue.retry(&id)?;
            println!("✓ Entry {id} reset");
        }
        Target::AllFailed => {
            let ids = queue.retry_all_failed()?;
            println!("✓ {} failed entries reset", ids.len());
        }
    }
    Ok(())
}
