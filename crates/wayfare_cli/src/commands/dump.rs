//! Dump command implementation.

use super::open_ledger;
use std::path::Path;

/// Runs the dump command, printing one JSON record per line.
pub fn run(path: &Path, limit: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = open_ledger(path)?;
    let records = ledger.dump()?;
    let total = records.len();
    let limit = limit.unwrap_or(total);

    for record in records.iter().take(limit) {
        println!("{}", serde_json::to_string(record)?);
    }
    if limit < total {
        eprintln!("... {} more records", total - limit);
    }
    Ok(())
}
