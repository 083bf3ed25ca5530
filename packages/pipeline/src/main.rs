#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the damage assessment pipeline.

use std::path::PathBuf;

use chrono::Local;
use clap::{Parser, Subcommand};
use damage_assessment_cli_utils::{IndicatifProgress, StageProgress};
use damage_assessment_feature_service::arcgis::ArcGisFeatureService;
use damage_assessment_pipeline::{
    Mode, PipelineConfig, PipelineError, RunContext, RunScope, RunSummary,
    marker::{RunRecord, write_markers},
};
use damage_assessment_report_models::{
    CancellationFlag, LogReporter, MemoryReporter, TeeReporter,
};
use damage_assessment_store::restore_from_backup;
use dialoguer::Confirm;

/// Name used for the marker files.
const TOOL_NAME: &str = "damage_assessment";

#[derive(Parser)]
#[command(
    name = "damage_assessment",
    about = "Download, reconcile, check and publish damage assessment reports"
)]
struct Cli {
    /// Path to the TOML run configuration
    #[arg(long, global = true, default_value = "damage_assessment.toml")]
    config: PathBuf,

    /// Who started the run; selects the filesystem root
    #[arg(long, global = true, value_enum, default_value_t = Mode::Manual)]
    mode: Mode,

    /// Commit without asking (manual mode only)
    #[arg(long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline (default)
    Run,
    /// Download the damage reports and print the record count
    Extract,
    /// Run everything up to and including the QA/QC report, without
    /// committing or syncing fields
    Check,
    /// Copy the backup snapshot back into production
    Restore,
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Records downloaded:  {}", summary.records_extracted);
    println!("  Parcels in extent:   {}", summary.parcels_in_extent);
    println!("  Join rows:           {}", summary.join_rows);
    println!(
        "  Reconciled rows:     {} ({} stacked, {} by override, {} nullified)",
        summary.rows_reconciled,
        summary.reconcile.stacked,
        summary.reconcile.resolved_by_override,
        summary.reconcile.nullified
    );
    println!("  QA/QC findings:      {}", summary.findings.len());
    if let Some(path) = &summary.qa_report {
        println!("  QA/QC report:        {}", path.display());
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = damage_assessment_cli_utils::init_logger();
    let cli = Cli::parse();

    let config = PipelineConfig::from_path(&cli.config)?;
    let scope = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => RunScope::Full,
        Commands::Extract => RunScope::Extract,
        Commands::Check => RunScope::Check,
        Commands::Restore => return restore(&config, cli.mode, cli.yes),
    };

    let cancel = CancellationFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupt received; stopping after the current step");
                cancel.cancel();
            }
        });
    }

    let log_reporter = LogReporter;
    let recorded = MemoryReporter::new();
    let stages = StageProgress::new(&multi);
    let logged = TeeReporter::new(&log_reporter, &recorded);
    let reporter = TeeReporter::new(&logged, &stages);
    let progress = IndicatifProgress::pages_bar(&multi, "Downloading damage reports");
    let ctx = RunContext::new(&config, cli.mode, &reporter, progress.as_ref(), cancel);
    let started_at = Local::now();

    let service = config
        .credentials()
        .map_err(PipelineError::from)
        .and_then(|credentials| {
            ArcGisFeatureService::new(config.arcgis_config(), credentials)
                .map_err(PipelineError::from)
        });

    let (summary, result) = match service {
        Ok(service) => {
            let ask = cli.mode == Mode::Manual && !cli.yes;
            let mut confirm = |summary: &RunSummary| {
                if !ask {
                    return true;
                }
                multi.suspend(|| {
                    print_summary(summary);
                    Confirm::new()
                        .with_prompt(format!(
                            "Replace {} with {} reconciled rows?",
                            config.store.snapshot_name, summary.rows_reconciled
                        ))
                        .default(false)
                        .interact()
                        .unwrap_or(false)
                })
            };
            damage_assessment_pipeline::run(&ctx, &service, scope, &mut confirm).await
        }
        Err(e) => (RunSummary::default(), Err(e)),
    };
    stages.finish();

    let record = RunRecord {
        events: recorded.events(),
        ..RunRecord::new(
            TOOL_NAME,
            cli.mode,
            scope,
            started_at,
            &summary,
            result.as_ref().map(|_| ()),
        )
    };
    write_markers(&ctx.paths.marker_folder, &record)?;

    match result {
        Ok(()) => {
            if scope == RunScope::Extract {
                println!("Downloaded {} records", summary.records_extracted);
            } else {
                print_summary(&summary);
            }
            log::info!("SUCCESSFULLY ran {TOOL_NAME} ({scope})");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn restore(
    config: &PipelineConfig,
    mode: Mode,
    yes: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let paths = config.paths(mode);
    let name = &config.store.snapshot_name;

    if mode == Mode::Manual
        && !yes
        && !Confirm::new()
            .with_prompt(format!("Overwrite {name} with the contents of {name}_BAK?"))
            .default(false)
            .interact()?
    {
        println!("Restore cancelled");
        return Ok(());
    }

    let store = damage_assessment_store::DuckDbSnapshotStore::open(&paths.database, name)?;
    let restored = restore_from_backup(&store)?;
    println!("Restored {restored} rows into {name}");
    Ok(())
}
