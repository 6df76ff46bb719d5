//! Compact command implementation.

use super::open_ledger;
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut ledger = open_ledger(path)?;
    let before = ledger.stats();
    let replayed = ledger.dump()?.len();
    let live = before.pending
        + before.in_flight
        + before.failed
        + before.cursors
        + ledger.conflicts().count();

    println!("Compacting ledger at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();
    println!("Compaction Analysis:");
    println!("  Replayed records: {}", replayed);
    println!("  Live records:     {}", live);
    println!("  Batches since last compaction: {}", before.batches_since_compaction);
    println!("  Size before: {} bytes", before.journal_bytes);

    if dry_run {
        return Ok(());
    }
    if before.batches_since_compaction == 0 {
        println!();
        println!("No compaction needed - journal is already a snapshot");
        return Ok(());
    }

    ledger.compact()?;
    let after = ledger.stats();
    println!("  Size after:  {} bytes", after.journal_bytes);
    println!();
    println!("✓ Compaction complete");
    Ok(())
}
