//! Backup-then-replace commit of the reconciled dataset.

use damage_assessment_report_models::{JoinResult, PipelineEvent, Reporter};
use serde::Serialize;

use crate::{
    DbError,
    snapshot::{SnapshotStore, SnapshotTable},
};

/// Row counts observed during a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    /// Rows that were in production before the commit, now in the backup.
    pub backed_up: u64,
    /// Rows now in production.
    pub committed: u64,
}

fn step(reporter: &dyn Reporter, step: u8, description: String) {
    reporter.report(PipelineEvent::SnapshotStep { step, description });
}

fn verify(store: &dyn SnapshotStore, table: SnapshotTable, expected: u64) -> Result<(), DbError> {
    let actual = store.count(table)?;
    if actual == expected {
        Ok(())
    } else {
        Err(DbError::Verification {
            table: store.table_name(table),
            expected,
            actual,
        })
    }
}

/// Replaces production with `rows`, taking a backup first.
///
/// Runs four steps in order: clear the backup, copy production into it,
/// clear production, insert `rows`. Each step is atomic, so a failure at
/// any point leaves production either unchanged or empty, and once step 2
/// has completed the backup holds the previous production contents.
///
/// # Errors
///
/// Returns [`DbError`] if any step fails or if a table does not hold the
/// expected number of rows afterwards.
pub fn commit_snapshot(
    store: &dyn SnapshotStore,
    rows: &[JoinResult],
    reporter: &dyn Reporter,
) -> Result<CommitSummary, DbError> {
    let production = store.table_name(SnapshotTable::Production);
    let backup = store.table_name(SnapshotTable::Backup);
    let previous = store.count(SnapshotTable::Production)?;

    store.clear(SnapshotTable::Backup)?;
    step(reporter, 1, format!("cleared {backup}"));

    store.copy(SnapshotTable::Production, SnapshotTable::Backup)?;
    verify(store, SnapshotTable::Backup, previous)?;
    step(reporter, 2, format!("copied {previous} rows from {production} into {backup}"));

    store.clear(SnapshotTable::Production)?;
    step(reporter, 3, format!("cleared {production}"));

    store.insert(SnapshotTable::Production, rows)?;
    let committed = rows.len() as u64;
    verify(store, SnapshotTable::Production, committed)?;
    step(reporter, 4, format!("inserted {committed} rows into {production}"));

    Ok(CommitSummary {
        backed_up: previous,
        committed,
    })
}

/// Copies the backup back into production, discarding what production
/// currently holds.
///
/// # Errors
///
/// Returns [`DbError`] if a step fails or the restored row count is wrong.
pub fn restore_from_backup(store: &dyn SnapshotStore) -> Result<u64, DbError> {
    let expected = store.count(SnapshotTable::Backup)?;
    store.clear(SnapshotTable::Production)?;
    store.copy(SnapshotTable::Backup, SnapshotTable::Production)?;
    verify(store, SnapshotTable::Production, expected)?;
    log::info!(
        "Restored {expected} rows from {} into {}",
        store.table_name(SnapshotTable::Backup),
        store.table_name(SnapshotTable::Production)
    );
    Ok(expected)
}
