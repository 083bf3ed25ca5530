//! Snapshot tables.

use std::path::Path;

use damage_assessment_report_models::{
    Attributes, DamageReport, JoinResult, ReportPoint, ResolutionTag, is_sql_identifier,
};
use duckdb::Connection;

use crate::DbError;

/// Number of rows per INSERT chunk.
const CHUNK_SIZE: usize = 2_000;

/// Suffix of the backup table.
pub const BACKUP_SUFFIX: &str = "_BAK";

/// Which of the two snapshot tables to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTable {
    Production,
    Backup,
}

/// Storage for the live snapshot and its backup.
///
/// Each operation is atomic on its own; [`commit_snapshot`] sequences them.
///
/// [`commit_snapshot`]: crate::commit_snapshot
pub trait SnapshotStore {
    /// Human-readable table name, for logs and errors.
    fn table_name(&self, table: SnapshotTable) -> String;

    /// Removes every row from `table`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    fn clear(&self, table: SnapshotTable) -> Result<(), DbError>;

    /// Appends every row of `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the statement fails.
    fn copy(&self, from: SnapshotTable, to: SnapshotTable) -> Result<(), DbError>;

    /// Appends `rows` to `table`, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if encoding or any insert fails.
    fn insert(&self, table: SnapshotTable, rows: &[JoinResult]) -> Result<(), DbError>;

    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    fn count(&self, table: SnapshotTable) -> Result<u64, DbError>;

    /// Reads `table` back in join order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row cannot be decoded.
    fn load(&self, table: SnapshotTable) -> Result<Vec<JoinResult>, DbError>;
}

/// [`SnapshotStore`] over two `DuckDB` tables, `<name>` and `<name>_BAK`.
pub struct DuckDbSnapshotStore {
    conn: Connection,
    name: String,
}

impl DuckDbSnapshotStore {
    /// Opens (or creates) the working database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the name is invalid or the database cannot be
    /// opened.
    pub fn open(path: &Path, name: &str) -> Result<Self, DbError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Self::new(Connection::open(path)?, name)
    }

    /// Wraps an open connection and ensures the schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the name is invalid or schema creation fails.
    pub fn new(conn: Connection, name: &str) -> Result<Self, DbError> {
        if !is_sql_identifier(name) {
            return Err(DbError::InvalidName {
                name: name.to_string(),
            });
        }
        let store = Self {
            conn,
            name: name.to_string(),
        };
        store.create_schema()?;
        Ok(store)
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    fn create_schema(&self) -> Result<(), DbError> {
        for table in [SnapshotTable::Production, SnapshotTable::Backup] {
            self.conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    object_id BIGINT NOT NULL,
                    report_number TEXT,
                    x DOUBLE,
                    y DOUBLE,
                    apn TEXT,
                    tag TEXT NOT NULL,
                    join_order BIGINT NOT NULL,
                    record_json TEXT NOT NULL,
                    parcel_json TEXT
                );",
                self.table_name(table)
            ))?;
        }
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn insert_chunks(&self, table: &str, rows: &[JoinResult]) -> Result<(), DbError> {
        for chunk in rows.chunks(CHUNK_SIZE) {
            let mut sql = format!(
                "INSERT INTO {table} (object_id, report_number, x, y, apn, tag, join_order, \
                 record_json, parcel_json) VALUES "
            );
            let mut values: Vec<Box<dyn duckdb::ToSql>> = Vec::with_capacity(chunk.len() * 9);
            for (i, row) in chunk.iter().enumerate() {
                if i > 0 {
                    sql.push_str(", ");
                }
                sql.push_str("(?, ?, ?, ?, ?, ?, ?, ?, ?)");

                let join_order = i64::try_from(row.join_order).unwrap_or(i64::MAX);
                let parcel_json = row
                    .parcel
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                values.push(Box::new(row.report.object_id));
                values.push(Box::new(row.report.report_number()));
                values.push(Box::new(row.report.geometry.map(|p| p.x)));
                values.push(Box::new(row.report.geometry.map(|p| p.y)));
                values.push(Box::new(row.apn()));
                values.push(Box::new(row.tag.to_string()));
                values.push(Box::new(join_order));
                values.push(Box::new(serde_json::to_string(&row.report.attributes)?));
                values.push(Box::new(parcel_json));
            }

            let params: Vec<&dyn duckdb::ToSql> = values.iter().map(AsRef::as_ref).collect();
            self.conn.execute(&sql, params.as_slice())?;
        }
        Ok(())
    }
}

impl SnapshotStore for DuckDbSnapshotStore {
    fn table_name(&self, table: SnapshotTable) -> String {
        match table {
            SnapshotTable::Production => self.name.clone(),
            SnapshotTable::Backup => format!("{}{BACKUP_SUFFIX}", self.name),
        }
    }

    fn clear(&self, table: SnapshotTable) -> Result<(), DbError> {
        self.conn
            .execute_batch(&format!("DELETE FROM {};", self.table_name(table)))?;
        Ok(())
    }

    fn copy(&self, from: SnapshotTable, to: SnapshotTable) -> Result<(), DbError> {
        self.conn.execute_batch(&format!(
            "INSERT INTO {} SELECT * FROM {};",
            self.table_name(to),
            self.table_name(from)
        ))?;
        Ok(())
    }

    fn insert(&self, table: SnapshotTable, rows: &[JoinResult]) -> Result<(), DbError> {
        let name = self.table_name(table);
        self.conn.execute_batch("BEGIN TRANSACTION;")?;
        match self.insert_chunks(&name, rows) {
            Ok(()) => {
                self.conn.execute_batch("COMMIT;")?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK;") {
                    log::error!("Rollback of {name} insert failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    fn count(&self, table: SnapshotTable) -> Result<u64, DbError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT COUNT(*) FROM {}", self.table_name(table)))?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn load(&self, table: SnapshotTable) -> Result<Vec<JoinResult>, DbError> {
        let name = self.table_name(table);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT object_id, x, y, tag, join_order, record_json, parcel_json \
             FROM {name} ORDER BY join_order, object_id"
        ))?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();

        while let Some(row) = rows.next()? {
            let object_id: i64 = row.get(0)?;
            let x: Option<f64> = row.get(1)?;
            let y: Option<f64> = row.get(2)?;
            let tag: String = row.get(3)?;
            let join_order: i64 = row.get(4)?;
            let record_json: String = row.get(5)?;
            let parcel_json: Option<String> = row.get(6)?;

            let corrupt = |message: String| DbError::Corrupt {
                table: name.clone(),
                object_id,
                message,
            };
            let tag: ResolutionTag = tag
                .parse()
                .map_err(|_| corrupt(format!("unknown resolution tag {tag:?}")))?;
            let join_order = usize::try_from(join_order)
                .map_err(|_| corrupt(format!("negative join order {join_order}")))?;

            let attributes: Attributes = serde_json::from_str(&record_json)?;
            let parcel = parcel_json
                .as_deref()
                .map(serde_json::from_str::<Attributes>)
                .transpose()?;

            out.push(JoinResult {
                report: DamageReport {
                    object_id,
                    geometry: x.zip(y).map(|(x, y)| ReportPoint::new(x, y)),
                    attributes,
                },
                parcel,
                join_order,
                tag,
            });
        }

        Ok(out)
    }
}
