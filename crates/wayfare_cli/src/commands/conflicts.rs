//! Conflict listing.

use super::open_ledger;
use serde::Serialize;
use std::path::Path;
use wayfare_sync_protocol::{ConflictOutcome, ConflictRecord, ConflictStrategy};

/// Summary of one conflict.
#[derive(Debug, Serialize)]
pub struct ConflictRow {
    /// Conflict id.
    pub id: String,
    /// Entity key.
    pub entity: String,
    /// Strategy in effect when it was detected.
    pub strategy: ConflictStrategy,
    /// How it ended.
    pub outcome: ConflictOutcome,
    /// Remote version it was detected against.
    pub remote_version: u64,
    /// Fields whose values differ between the two sides.
    pub differing_fields: Vec<String>,
    /// Detection time, RFC 3339.
    pub detected_at: String,
}

impl From<&ConflictRecord> for ConflictRow {
    fn from(record: &ConflictRecord) -> Self {
        let local = &record.local_snapshot.fields;
        let remote = &record.remote_snapshot.fields;
        let mut differing_fields: Vec<String> = local
            .keys()
            .chain(remote.keys())
            .filter(|name| local.get(*name) != remote.get(*name))
            .cloned()
            .collect();
        differing_fields.sort();
        differing_fields.dedup();
        Self {
            id: record.id.to_string(),
            entity: record.key.to_string(),
            strategy: record.strategy,
            outcome: record.outcome,
            remote_version: record.remote_version,
            differing_fields,
            detected_at: record.detected_at.to_rfc3339(),
        }
    }
}

/// Runs the conflicts command.
pub fn run(path: &Path, include_resolved: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = open_ledger(path)?;
    let mut records: Vec<&ConflictRecord> = ledger
        .conflicts()
        .filter(|c| include_resolved || !c.is_resolved())
        .collect();
    records.sort_by_key(|c| c.detected_at);
    let rows: Vec<ConflictRow> = records.into_iter().map(ConflictRow::from).collect();

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No conflicts");
        return Ok(());
    }
    for row in &rows {
        println!(
            "{}  {:?} ({}) {} remote v{}",
            row.id, row.outcome, row.strategy, row.entity, row.remote_version
        );
        if !row.differing_fields.is_empty() {
            println!("    differs in: {}", row.differing_fields.join(", "));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use wayfare_sync_protocol::{EntityKey, EntitySnapshot, EntityType};

    #[test]
    fn lists_differing_fields() {
        let at = Utc.timestamp_opt(100, 0).unwrap();
        let local = EntitySnapshot::new(EntityKey::generate(EntityType::Trip), at)
            .with_field("name", "Porto")
            .with_field("notes", "Bring a jacket");
        let remote = local.edited("name", "Oporto", at);
        let record = ConflictRecord::new(
            local,
            remote,
            2,
            "srv-1".into(),
            Some(at),
            ConflictStrategy::Manual,
            at,
        );

        let row = ConflictRow::from(&record);
        assert_eq!(row.differing_fields, vec!["name".to_string()]);
        assert_eq!(row.outcome, ConflictOutcome::Unresolved);
    }
}
