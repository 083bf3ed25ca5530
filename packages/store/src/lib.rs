#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Production snapshot storage.
//!
//! The reconciled dataset is published into a `DuckDB` table `<name>`, with
//! the previous contents kept in `<name>_BAK`. [`commit::commit_snapshot`]
//! is the only irreversible mutation in a run and always takes the backup
//! first. A `_meta` table in the same database records when data was last
//! downloaded.

pub mod commit;
pub mod meta;
pub mod snapshot;

pub use commit::{CommitSummary, commit_snapshot, restore_from_backup};
pub use snapshot::{DuckDbSnapshotStore, SnapshotStore, SnapshotTable};

/// Errors that can occur during snapshot storage.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` error.
    #[error("Database error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored row JSON could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The snapshot name is not a plain identifier.
    #[error("Invalid snapshot name: {name}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// A stored row cannot be turned back into a join row.
    #[error("Corrupt row {object_id} in {table}: {message}")]
    Corrupt {
        table: String,
        object_id: i64,
        message: String,
    },

    /// A table does not hold the number of rows it should after a commit
    /// step.
    #[error("{table} holds {actual} rows, expected {expected}")]
    Verification {
        /// Table that failed verification.
        table: String,
        expected: u64,
        actual: u64,
    },
}
