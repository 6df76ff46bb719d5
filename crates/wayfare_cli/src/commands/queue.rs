//! Queue listing.

use super::open_ledger;
use serde::Serialize;
use std::path::Path;
use wayfare_sync_protocol::{QueueStatus, SyncQueueEntry};

/// One row of the queue listing.
#[derive(Debug, Serialize)]
pub struct QueueRow {
    /// Entry id.
    pub id: String,
    /// Entity key.
    pub entity: String,
    /// Parent entity, if any.
    pub parent: Option<String>,
    /// Mutation kind.
    pub operation: String,
    /// Lifecycle state.
    pub status: QueueStatus,
    /// Failed attempts.
    pub attempts: u32,
    /// Held back by a conflict.
    pub blocked: bool,
    /// Last failure.
    pub last_error: Option<String>,
    /// Queued at, RFC 3339.
    pub created_at: String,
}

impl From<&SyncQueueEntry> for QueueRow {
    fn from(entry: &SyncQueueEntry) -> Self {
        Self {
            id: entry.id.to_string(),
            entity: entry.key.to_string(),
            parent: entry.parent.map(|p| p.to_string()),
            operation: entry.operation.to_string(),
            status: entry.status,
            attempts: entry.attempts,
            blocked: entry.blocked,
            last_error: entry.last_error.clone(),
            created_at: entry.created_at.to_rfc3339(),
        }
    }
}

/// Rows for `entries`, oldest first.
pub fn rows(entries: &[SyncQueueEntry], failed_only: bool) -> Vec<QueueRow> {
    let mut rows: Vec<(&SyncQueueEntry, QueueRow)> = entries
        .iter()
        .filter(|e| !failed_only || e.status == QueueStatus::Failed)
        .map(|e| (e, QueueRow::from(e)))
        .collect();
    rows.sort_by(|a, b| a.0.created_at.cmp(&b.0.created_at).then(a.0.id.cmp(&b.0.id)));
    rows.into_iter().map(|(_, row)| row).collect()
}

/// Runs the queue command.
pub fn run(path: &Path, failed_only: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = open_ledger(path)?;
    let entries: Vec<SyncQueueEntry> = ledger.entries().cloned().collect();
    let rows = rows(&entries, failed_only);

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for row in &rows {
        let flag = if row.blocked { " [blocked]" } else { "" };
        println!(
            "{}  {:<7} {:<9} attempts={} {}{}",
            row.id,
            row.operation,
            format!("{:?}", row.status),
            row.attempts,
            row.entity,
            flag
        );
        if let Some(error) = &row.last_error {
            println!("    last error: {}", error);
        }
    }
    println!();
    println!("{} entries", rows.len());
    Ok(())
}
