//! Key/value run metadata in the `_meta` table.

use chrono::{DateTime, Local};
use duckdb::Connection;

use crate::DbError;

pub const LAST_DOWNLOADED_AT_KEY: &str = "last_downloaded_at";
pub const LAST_DOWNLOADED_DISPLAY_KEY: &str = "last_downloaded_display";

/// Format staff see for the last download time, e.g. `04 Mar, 2026 - 03:06:07 PM`.
pub const DISPLAY_FORMAT: &str = "%d %b, %Y - %I:%M:%S %p";

/// Gets a metadata value from the `_meta` table.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, DbError> {
    let mut stmt = conn.prepare("SELECT value FROM _meta WHERE key = ?")?;
    let result = stmt.query_row([key], |row| row.get(0));
    match result {
        Ok(v) => Ok(Some(v)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(DbError::DuckDb(e)),
    }
}

/// Sets a metadata value in the `_meta` table.
///
/// # Errors
///
/// Returns [`DbError`] if the upsert fails.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO _meta (key, value) VALUES (?, ?)
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        duckdb::params![key, value],
    )?;
    Ok(())
}

/// Records when the data was downloaded, both machine-readable and in the
/// display form.
///
/// # Errors
///
/// Returns [`DbError`] if either upsert fails.
pub fn record_download_time(conn: &Connection, at: DateTime<Local>) -> Result<(), DbError> {
    set_meta(conn, LAST_DOWNLOADED_AT_KEY, &at.to_rfc3339())?;
    set_meta(
        conn,
        LAST_DOWNLOADED_DISPLAY_KEY,
        &at.format(DISPLAY_FORMAT).to_string(),
    )?;
    log::info!("Data last downloaded at {}", at.format(DISPLAY_FORMAT));
    Ok(())
}

/// Reads back the last download time, if one was recorded and parses.
///
/// # Errors
///
/// Returns [`DbError`] if the query fails.
pub fn last_download_time(conn: &Connection) -> Result<Option<DateTime<Local>>, DbError> {
    Ok(get_meta(conn, LAST_DOWNLOADED_AT_KEY)?.and_then(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|dt| dt.with_timezone(&Local))
            .map_err(|e| log::warn!("Ignoring unparseable {LAST_DOWNLOADED_AT_KEY} '{v}': {e}"))
            .ok()
    }))
}
