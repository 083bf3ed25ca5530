//! Success/error marker files for the scheduler and notifier.
//!
//! Downstream jobs look for `SUCCESS_running_<tool>.txt` before they start,
//! so the marker folder is wiped at the end of every run and exactly one
//! marker is written. A JSON summary sits next to it for the notifier.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use serde::Serialize;

use damage_assessment_report_models::PipelineEvent;

use crate::{ErrorKind, Mode, PipelineError, RunScope, RunSummary, paths::recreate_dir};

pub const SUMMARY_FILE_NAME: &str = "run_summary.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

/// The JSON document written next to the marker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord<'a> {
    pub tool: &'a str,
    pub mode: Mode,
    pub scope: RunScope,
    pub status: RunStatus,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub summary: &'a RunSummary,
    /// Every event the run reported, in order.
    pub events: Vec<PipelineEvent>,
}

impl<'a> RunRecord<'a> {
    #[must_use]
    pub fn new(
        tool: &'a str,
        mode: Mode,
        scope: RunScope,
        started_at: DateTime<Local>,
        summary: &'a RunSummary,
        outcome: Result<(), &PipelineError>,
    ) -> Self {
        let (status, error_kind, error) = match outcome {
            Ok(()) => (RunStatus::Success, None, None),
            Err(e) => (RunStatus::Error, Some(e.kind()), Some(e.to_string())),
        };
        Self {
            tool,
            mode,
            scope,
            status,
            error_kind,
            error,
            started_at,
            finished_at: Local::now(),
            summary,
            events: Vec::new(),
        }
    }
}

#[must_use]
pub fn marker_file_name(tool: &str, status: RunStatus) -> String {
    match status {
        RunStatus::Success => format!("SUCCESS_running_{tool}.txt"),
        RunStatus::Error => format!("ERROR_running_{tool}.txt"),
    }
}

/// Recreates `folder` and writes the marker plus [`SUMMARY_FILE_NAME`].
/// Returns the marker path.
///
/// # Errors
///
/// Returns an I/O error if the folder or either file cannot be written.
pub fn write_markers(folder: &Path, record: &RunRecord<'_>) -> std::io::Result<PathBuf> {
    recreate_dir(folder)?;

    let marker = folder.join(marker_file_name(record.tool, record.status));
    let mut body = format!(
        "{} {} run ({}) finished {}\n",
        record.tool,
        record.scope,
        record.mode,
        record.finished_at.format("%d %b, %Y - %I:%M:%S %p")
    );
    if let (Some(kind), Some(error)) = (record.error_kind, &record.error) {
        let _ = writeln!(body, "{kind} error: {error}");
    }
    std::fs::write(&marker, body)?;

    let json = serde_json::to_string_pretty(record).map_err(std::io::Error::other)?;
    std::fs::write(folder.join(SUMMARY_FILE_NAME), json)?;

    log::info!("Wrote {}", marker.display());
    Ok(marker)
}
