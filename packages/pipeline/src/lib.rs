#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Damage assessment pipeline orchestration.
//!
//! One run moves the field survey from the remote feature service into the
//! production snapshot:
//!
//! 1. extract every damage report (paginated, concurrent, complete)
//! 2. narrow the parcel layer to parcels under at least one report
//! 3. join reports to parcels (one row per intersecting parcel)
//! 4. collapse stacked parcels to one row per report
//! 5. add and calculate output fields from the control files
//! 6. run the QA/QC rules and write the report for staff
//! 7. back up production and replace it with the reconciled rows
//! 8. push the quantity default and replacement costs back to the service
//!
//! Any stage error aborts the run before the next stage starts. Only step 7
//! mutates the production snapshot, and it always takes a backup first.

pub mod config;
pub mod marker;
pub mod paths;

use std::path::{Path, PathBuf};

use chrono::Local;
use damage_assessment_feature_service::{
    FeatureService, FeatureServiceError,
    extract::extract_all,
    field_sync::{FieldSyncSummary, sync_fields},
    progress::ProgressCallback,
};
use damage_assessment_fields::{
    FieldCalculation, FieldDefinition, FieldsError, add_fields, calculate_fields,
    load_fields_to_add, load_fields_to_calculate,
};
use damage_assessment_reconcile::{OverrideError, OverrideTable, ReconcileSummary, reconcile};
use damage_assessment_report_models::{
    Cancelled, CancellationFlag, DamageReport, JoinResult, PipelineEvent, Reporter, Stage,
    ValidationFinding,
};
use damage_assessment_spatial::{ParcelIndex, SpatialError, spatial_join};
use damage_assessment_store::{
    CommitSummary, DbError, DuckDbSnapshotStore, commit_snapshot, meta::record_download_time,
};
use damage_assessment_validate::{ReportContext, validate, write_report};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};

pub use config::{ConfigError, Mode, PipelineConfig, RunPaths};

/// Broad failure classes, used for the exit marker and the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Bad or missing configuration, control files or credentials.
    Configuration,
    /// The feature service could not be reached or answered badly.
    Network,
    /// The snapshot commit failed. The backup is intact.
    Commit,
    Cancelled,
    /// Input data could not be processed.
    Data,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    FeatureService(#[from] FeatureServiceError),

    #[error(transparent)]
    Spatial(#[from] SpatialError),

    #[error(transparent)]
    Override(#[from] OverrideError),

    #[error(transparent)]
    Fields(#[from] FieldsError),

    /// Working store error outside the commit.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The commit itself failed.
    #[error("Commit failed: {0}")]
    Commit(#[source] DbError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl PipelineError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_)
            | Self::Override(OverrideError::Io { .. })
            | Self::Fields(FieldsError::Io { .. })
            | Self::FeatureService(FeatureServiceError::Auth { .. }) => ErrorKind::Configuration,
            Self::FeatureService(FeatureServiceError::Cancelled(_)) | Self::Cancelled(_) => {
                ErrorKind::Cancelled
            }
            Self::FeatureService(_) => ErrorKind::Network,
            Self::Commit(_) => ErrorKind::Commit,
            Self::Spatial(_) | Self::Override(_) | Self::Fields(_) | Self::Db(_) | Self::Io(_) => {
                ErrorKind::Data
            }
        }
    }
}

/// How far a run goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunScope {
    /// Download only.
    Extract,
    /// Everything up to and including the QA/QC report.
    Check,
    /// Commit and field sync as well.
    Full,
}

/// What a run did, for the notifier and the terminal.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub records_extracted: usize,
    pub parcels_in_extent: usize,
    pub join_rows: usize,
    pub reconcile: ReconcileSummary,
    pub rows_reconciled: usize,
    pub fields_added: usize,
    pub values_calculated: usize,
    pub findings: Vec<ValidationFinding>,
    pub qa_report: Option<PathBuf>,
    pub commit: Option<CommitSummary>,
    pub field_sync: Option<FieldSyncSummary>,
}

/// Everything a stage needs besides its input data.
pub struct RunContext<'a> {
    pub config: &'a PipelineConfig,
    pub paths: RunPaths,
    pub reporter: &'a dyn Reporter,
    pub progress: &'a dyn ProgressCallback,
    pub cancel: CancellationFlag,
}

/// Parsed field add and calculate control files.
#[derive(Debug, Clone, Default)]
pub struct FieldControls {
    pub add: Vec<FieldDefinition>,
    pub calculate: Vec<FieldCalculation>,
}

/// Output of the processing stages.
#[derive(Debug, Clone)]
pub struct Processed {
    pub reconciled: Vec<JoinResult>,
    pub findings: Vec<ValidationFinding>,
}

impl<'a> RunContext<'a> {
    #[must_use]
    pub fn new(
        config: &'a PipelineConfig,
        mode: Mode,
        reporter: &'a dyn Reporter,
        progress: &'a dyn ProgressCallback,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            config,
            paths: config.paths(mode),
            reporter,
            progress,
            cancel,
        }
    }

    /// Opens the working store holding the production snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Db`] if the database cannot be opened.
    pub fn open_store(&self) -> Result<DuckDbSnapshotStore, PipelineError> {
        Ok(DuckDbSnapshotStore::open(
            &self.paths.database,
            &self.config.store.snapshot_name,
        )?)
    }

    /// Loads the override table, or an empty one when none is configured.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Override`] if the configured file cannot be
    /// read.
    pub fn load_overrides(&self) -> Result<OverrideTable, PipelineError> {
        match &self.paths.override_csv {
            Some(path) => Ok(OverrideTable::from_path(
                path,
                self.config.control_files.override_header_rows,
            )?),
            None => {
                log::warn!("No override CSV configured; stacked parcels fall back to nullify");
                Ok(OverrideTable::default())
            }
        }
    }

    /// Loads whichever field control files are configured.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Fields`] if a configured file cannot be read
    /// or holds an unsupported row.
    pub fn load_field_controls(&self) -> Result<FieldControls, PipelineError> {
        let mut controls = FieldControls::default();
        if let Some(path) = &self.paths.fields_to_add {
            controls.add = load_fields_to_add(path)?;
        }
        if let Some(path) = &self.paths.fields_to_calculate {
            controls.calculate = load_fields_to_calculate(path)?;
        }
        Ok(controls)
    }

    /// Loads every reference parcel into an index.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the parcel database does not
    /// exist and [`PipelineError::Spatial`] if it cannot be read.
    pub fn load_parcels(&self) -> Result<ParcelIndex, PipelineError> {
        let path = &self.paths.parcel_database;
        if !path.is_file() {
            return Err(ConfigError::Io {
                path: path.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "parcel database not found",
                ),
            }
            .into());
        }
        let conn = open_read_only(path).map_err(SpatialError::from)?;
        Ok(ParcelIndex::load(&conn, &self.config.store.parcel_table)?)
    }
}

fn open_read_only(path: &Path) -> Result<duckdb::Connection, duckdb::Error> {
    let config = duckdb::Config::default().access_mode(duckdb::AccessMode::ReadOnly)?;
    duckdb::Connection::open_with_flags(path, config)
}

/// Downloads every damage report and records the download time.
///
/// # Errors
///
/// Returns [`PipelineError`] if extraction fails or is cancelled, or the
/// download time cannot be stored.
pub async fn extract_stage(
    ctx: &RunContext<'_>,
    service: &dyn FeatureService,
    store: &DuckDbSnapshotStore,
) -> Result<Vec<DamageReport>, PipelineError> {
    let options = ctx.config.extract_options();
    let reports = extract_all(service, &options, ctx.reporter, ctx.progress, &ctx.cancel).await?;
    record_download_time(store.connection(), Local::now())?;
    Ok(reports)
}

/// Parcel extract, join, reconcile, fields and validation.
///
/// `parcels` is the full reference layer. The QA/QC report is written to
/// the run's QA folder.
///
/// # Errors
///
/// Returns [`PipelineError`] if a control file cannot be read, the report
/// cannot be written, or the run is cancelled between stages.
pub fn process_stage(
    ctx: &RunContext<'_>,
    reports: &[DamageReport],
    parcels: &ParcelIndex,
    overrides: &OverrideTable,
    controls: &FieldControls,
    summary: &mut RunSummary,
) -> Result<Processed, PipelineError> {
    let reporter = ctx.reporter;

    ctx.cancel.check()?;
    reporter.report(PipelineEvent::StageStarted {
        stage: Stage::ParcelExtract,
    });
    let extent = parcels.extract_intersecting(reports);
    summary.parcels_in_extent = extent.len();
    reporter.report(PipelineEvent::StageFinished {
        stage: Stage::ParcelExtract,
        records: extent.len(),
    });

    ctx.cancel.check()?;
    reporter.report(PipelineEvent::StageStarted { stage: Stage::Join });
    let joined = spatial_join(reports, &extent);
    summary.join_rows = joined.len();
    reporter.report(PipelineEvent::StageFinished {
        stage: Stage::Join,
        records: joined.len(),
    });

    ctx.cancel.check()?;
    let (mut reconciled, reconcile_summary) = reconcile(joined, overrides, reporter);
    summary.reconcile = reconcile_summary;
    summary.rows_reconciled = reconciled.len();

    ctx.cancel.check()?;
    apply_field_controls(controls, &mut reconciled, reporter, summary);

    ctx.cancel.check()?;
    let findings = validate(reports, &reconciled, &extent, reporter);
    let context = ReportContext {
        generated_at: Local::now(),
        override_file: ctx.paths.override_csv.clone(),
        records_checked: reports.len(),
    };
    summary.qa_report = Some(write_report(&ctx.paths.qa_folder, &findings, &context)?);
    summary.findings.clone_from(&findings);

    Ok(Processed {
        reconciled,
        findings,
    })
}

fn apply_field_controls(
    controls: &FieldControls,
    rows: &mut [JoinResult],
    reporter: &dyn Reporter,
    summary: &mut RunSummary,
) {
    if !controls.add.is_empty() {
        summary.fields_added = add_fields(rows, &controls.add);
    }
    if !controls.calculate.is_empty() {
        summary.values_calculated =
            calculate_fields(rows, &controls.calculate, &controls.add, reporter);
    }
}

/// Replaces the production snapshot with `rows`.
///
/// # Errors
///
/// Returns [`PipelineError::Commit`] if any commit step fails, or
/// [`PipelineError::Cancelled`] if the run was cancelled beforehand.
pub fn commit_stage(
    ctx: &RunContext<'_>,
    store: &DuckDbSnapshotStore,
    rows: &[JoinResult],
) -> Result<CommitSummary, PipelineError> {
    ctx.cancel.check()?;
    ctx.reporter.report(PipelineEvent::StageStarted {
        stage: Stage::Commit,
    });
    let summary = commit_snapshot(store, rows, ctx.reporter).map_err(PipelineError::Commit)?;
    ctx.reporter.report(PipelineEvent::StageFinished {
        stage: Stage::Commit,
        records: rows.len(),
    });
    Ok(summary)
}

/// Runs the pipeline up to `scope`.
///
/// `confirm_commit` is asked once, right before the commit, and a `false`
/// answer ends the run as cancelled with production untouched. The
/// summary is returned alongside the outcome so partial progress is still
/// reported on failure.
pub async fn run(
    ctx: &RunContext<'_>,
    service: &dyn FeatureService,
    scope: RunScope,
    confirm_commit: &mut dyn FnMut(&RunSummary) -> bool,
) -> (RunSummary, Result<(), PipelineError>) {
    let mut summary = RunSummary::default();
    let result = run_inner(ctx, service, scope, confirm_commit, &mut summary).await;
    if let Err(e) = &result {
        log::error!("Run failed ({}): {e}", e.kind());
    }
    (summary, result)
}

async fn run_inner(
    ctx: &RunContext<'_>,
    service: &dyn FeatureService,
    scope: RunScope,
    confirm_commit: &mut dyn FnMut(&RunSummary) -> bool,
    summary: &mut RunSummary,
) -> Result<(), PipelineError> {
    // Everything that can fail on configuration is loaded up front.
    let store = ctx.open_store()?;
    let inputs = if scope == RunScope::Extract {
        None
    } else {
        Some((
            ctx.load_overrides()?,
            ctx.load_field_controls()?,
            ctx.load_parcels()?,
        ))
    };

    let reports = extract_stage(ctx, service, &store).await?;
    summary.records_extracted = reports.len();
    let Some((overrides, controls, parcels)) = inputs else {
        return Ok(());
    };

    let processed = process_stage(ctx, &reports, &parcels, &overrides, &controls, summary)?;
    if scope == RunScope::Check {
        return Ok(());
    }

    ctx.cancel.check()?;
    if !confirm_commit(summary) {
        log::warn!("Commit declined; production snapshot left unchanged");
        return Err(Cancelled.into());
    }
    summary.commit = Some(commit_stage(ctx, &store, &processed.reconciled)?);

    if ctx.config.field_sync.enabled {
        ctx.cancel.check()?;
        summary.field_sync =
            Some(sync_fields(service, &processed.reconciled, ctx.reporter, &ctx.cancel).await?);
    } else {
        log::info!("Field sync disabled");
    }

    Ok(())
}
