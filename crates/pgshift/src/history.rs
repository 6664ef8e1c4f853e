//! Comparing local migrations with the applied history.

use pgshift_core::{Error, HistoryEntry, Migration, MigrationType, Result};

/// Split local migrations against the applied history.
///
/// Only entries issued through pgshift take part: inferred DDL and baselines
/// have no local counterpart. Both sequences must agree on their common
/// prefix. Returns the local migrations not yet applied and the applied
/// entries with no local migration.
pub fn compare<'l, 'h>(
    local: &'l [Migration],
    history: &'h [HistoryEntry],
) -> Result<(&'l [Migration], Vec<&'h HistoryEntry>)> {
    let applied: Vec<&HistoryEntry> = history
        .iter()
        .filter(|entry| entry.migration_type == MigrationType::Pgshift)
        .collect();

    for (local, remote) in local.iter().zip(&applied) {
        if local.name != remote.name {
            return Err(Error::MismatchedMigration {
                local: local.name.clone(),
                remote: remote.name.clone(),
            });
        }
    }

    let common = local.len().min(applied.len());
    Ok((&local[common..], applied[common..].to_vec()))
}
