//! Filesystem helpers for run artifacts.

use std::path::Path;

/// Ensures a directory exists, creating it and its parents if needed.
///
/// # Errors
///
/// Returns an I/O error if directory creation fails.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Deletes `path` with everything in it, then creates it empty.
///
/// # Errors
///
/// Returns an I/O error if removal or creation fails.
pub fn recreate_dir(path: &Path) -> std::io::Result<()> {
    if path.exists() {
        log::debug!("Deleting {}", path.display());
        std::fs::remove_dir_all(path)?;
    }
    std::fs::create_dir_all(path)
}
