//! Structured pipeline events.
//!
//! Every stage receives a `&dyn Reporter` and emits [`PipelineEvent`]s
//! through it instead of writing log lines directly. [`LogReporter`]
//! renders events through the `log` facade; [`MemoryReporter`] keeps them
//! so tests can assert on what a stage observed.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

use crate::{ResolutionTag, Severity, ValidationFinding};

/// Pipeline stage names, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    ParcelExtract,
    Join,
    Reconcile,
    Fields,
    Validate,
    Commit,
    FieldSync,
}

/// Something a stage wants the operator (or a test) to know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        stage: Stage,
    },
    StageFinished {
        stage: Stage,
        /// Number of records the stage produced.
        records: usize,
    },
    PageFetched {
        lo: i64,
        hi: i64,
        records: usize,
    },
    /// The remote dataset had no records.
    EmptyDataset,
    /// Extraction returned a different number of records than ids listed.
    CountMismatch {
        expected: usize,
        fetched: usize,
    },
    /// A stacked group was resolved to a single row.
    StackedParcel {
        report_number: String,
        apn: Option<String>,
        tag: ResolutionTag,
        candidates: usize,
    },
    /// None of the override APNs for this report number are on the
    /// report's location.
    OverrideInconsistent {
        report_number: String,
        override_apns: Vec<String>,
    },
    /// More than one override APN matched a stacked group. The first in
    /// file order was used.
    OverrideAmbiguous {
        report_number: String,
        chosen_apn: String,
        matching_apns: Vec<String>,
    },
    /// The override file lists more than one APN for a report number.
    OverrideConflict {
        report_number: String,
        apns: Vec<String>,
    },
    FieldCalculationSkipped {
        field: String,
        reason: String,
    },
    FieldSyncSkipped {
        report_number: String,
        reason: String,
    },
    FieldSyncFailed {
        object_id: i64,
        field: String,
        reason: String,
    },
    Finding(ValidationFinding),
    SnapshotStep {
        step: u8,
        description: String,
    },
}

/// Sink for [`PipelineEvent`]s.
pub trait Reporter: Send + Sync {
    fn report(&self, event: PipelineEvent);
}

/// Renders events as log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    #[allow(clippy::too_many_lines)]
    fn report(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::StageStarted { stage } => log::info!("[{stage}] started"),
            PipelineEvent::StageFinished { stage, records } => {
                log::info!("[{stage}] finished ({records} records)");
            }
            PipelineEvent::PageFetched { lo, hi, records } => {
                log::debug!("  page {lo}..={hi}: {records} records");
            }
            PipelineEvent::EmptyDataset => {
                log::warn!("Remote dataset has no records; nothing to extract");
            }
            PipelineEvent::CountMismatch { expected, fetched } => {
                log::warn!(
                    "Extracted {fetched} records but the service listed {expected} ids"
                );
            }
            PipelineEvent::StackedParcel {
                report_number,
                apn,
                tag,
                candidates,
            } => {
                log::info!(
                    "Stacked parcel for report {report_number}: {candidates} candidates, \
                     kept APN {} as {tag}",
                    apn.as_deref().unwrap_or("<none>"),
                );
            }
            PipelineEvent::OverrideInconsistent {
                report_number,
                override_apns,
            } => {
                log::warn!(
                    "Override APN inconsistent with location for report {report_number} \
                     (override APNs: {})",
                    override_apns.join(", "),
                );
            }
            PipelineEvent::OverrideAmbiguous {
                report_number,
                chosen_apn,
                matching_apns,
            } => {
                log::warn!(
                    "Report {report_number} has several matching override APNs ({}); \
                     using {chosen_apn}",
                    matching_apns.join(", "),
                );
            }
            PipelineEvent::OverrideConflict {
                report_number,
                apns,
            } => {
                log::warn!(
                    "Override file lists several APNs for report {report_number}: {}",
                    apns.join(", "),
                );
            }
            PipelineEvent::FieldCalculationSkipped { field, reason } => {
                log::info!("Field calculation for {field} skipped: {reason}");
            }
            PipelineEvent::FieldSyncSkipped {
                report_number,
                reason,
            } => {
                log::warn!("Field sync skipped for report {report_number}: {reason}");
            }
            PipelineEvent::FieldSyncFailed {
                object_id,
                field,
                reason,
            } => {
                log::warn!("Field sync of {field} failed for object {object_id}: {reason}");
            }
            PipelineEvent::Finding(finding) => match finding.severity {
                Severity::Info => log::info!(
                    "QA/QC check {} ({}): {} records",
                    finding.rule.number(),
                    finding.rule,
                    finding.affected.len(),
                ),
                Severity::Warning => log::warn!(
                    "QA/QC check {} ({}): {} records",
                    finding.rule.number(),
                    finding.rule,
                    finding.affected.len(),
                ),
            },
            PipelineEvent::SnapshotStep { step, description } => {
                log::info!("  commit step {step}: {description}");
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemoryReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every event reported so far.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Returns the reported validation findings.
    #[must_use]
    pub fn findings(&self) -> Vec<ValidationFinding> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PipelineEvent::Finding(finding) => Some(finding),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Forwards every event to two reporters.
pub struct TeeReporter<'a> {
    first: &'a dyn Reporter,
    second: &'a dyn Reporter,
}

impl<'a> TeeReporter<'a> {
    #[must_use]
    pub fn new(first: &'a dyn Reporter, second: &'a dyn Reporter) -> Self {
        Self { first, second }
    }
}

impl Reporter for TeeReporter<'_> {
    fn report(&self, event: PipelineEvent) {
        self.first.report(event.clone());
        self.second.report(event);
    }
}
