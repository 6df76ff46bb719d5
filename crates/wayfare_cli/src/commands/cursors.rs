//! Cursor listing.

use super::open_ledger;
use std::path::Path;
use wayfare_sync_protocol::SyncCursor;

/// Runs the cursors command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = open_ledger(path)?;
    let mut cursors: Vec<SyncCursor> = ledger.cursors().cloned().collect();
    cursors.sort_by(|a, b| a.route.cmp(&b.route).then(a.entity_type.cmp(&b.entity_type)));

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&cursors)?);
        return Ok(());
    }

    if cursors.is_empty() {
        println!("No cursors; nothing was pulled yet");
        return Ok(());
    }
    for cursor in &cursors {
        let position = cursor
            .position
            .map(|p| format!("{} / {}", p.updated_at.to_rfc3339(), p.entity_id))
            .unwrap_or_else(|| "-".to_string());
        let version = cursor
            .last_synced_version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<7} position={} version={}",
            cursor.route, cursor.entity_type, position, version
        );
    }
    Ok(())
}
