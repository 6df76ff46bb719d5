//! Config check command implementation.

use std::path::Path;
use wayfare_sync_engine::SyncConfig;

/// Parses and validates a configuration file, then prints it with every
/// default filled in.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("Could not read {:?}: {e}", path))?;
    let config = check(&json)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    eprintln!("✓ Configuration is valid");
    Ok(())
}

/// Parses and validates a configuration document.
pub fn check(json: &str) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    Ok(SyncConfig::from_json(json)?)
}
