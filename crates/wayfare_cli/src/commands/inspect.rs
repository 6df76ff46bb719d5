//! Inspect command implementation.

use super::open_ledger;
use serde::Serialize;
use std::path::Path;
use wayfare_sync_engine::LedgerStats;

/// Ledger inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Ledger path.
    pub path: String,
    /// Ledger counters.
    #[serde(flatten)]
    pub stats: LedgerStats,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = open_ledger(path)?;
    let result = InspectResult {
        path: path.display().to_string(),
        stats: ledger.stats(),
    };

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    let stats = &result.stats;
    println!("Wayfare Sync Ledger");
    println!("===================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Queue:");
    println!("  Pending:   {}", stats.pending);
    println!("  In flight: {}", stats.in_flight);
    println!("  Failed:    {}", stats.failed);
    println!("  Blocked:   {}", stats.blocked);
    println!();
    println!("Cursors:               {}", stats.cursors);
    println!("Unresolved conflicts:  {}", stats.unresolved_conflicts);
    println!();
    println!("Journal:");
    println!("  Size:    {}", format_size(stats.journal_bytes));
    println!("  Batches since compaction: {}", stats.batches_since_compaction);
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 bytes");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn missing_ledger_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(&dir.path().join("absent.ledger"), "text").unwrap_err();
        assert!(err.to_string().contains("No ledger found"));
    }
}
