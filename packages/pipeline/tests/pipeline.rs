//! End-to-end runs against an in-memory feature service and a temp folder.

use std::path::{Path, PathBuf};

use damage_assessment_feature_service::{memory::MemoryFeatureService, progress::NullProgress};
use damage_assessment_pipeline::{
    ErrorKind, Mode, PipelineConfig, RunContext, RunScope, RunSummary, run,
};
use damage_assessment_report_models::{
    Attributes, CancellationFlag, DamageReport, MemoryReporter, Parcel, PipelineEvent,
    ReportPoint, RuleId,
};
use damage_assessment_store::{DuckDbSnapshotStore, SnapshotStore, SnapshotTable, meta};
use geo::{Rect, coord};

fn report(id: i64, report_number: &str, x: f64, y: f64) -> DamageReport {
    let mut attributes = Attributes::new();
    attributes.insert("OBJECTID".to_string(), serde_json::json!(id));
    attributes.insert("ReportNumber".to_string(), serde_json::json!(report_number));
    attributes.insert("IncidentName".to_string(), serde_json::json!("Valley Fire"));
    DamageReport {
        object_id: id,
        geometry: Some(ReportPoint::new(x, y)),
        attributes,
    }
}

fn parcel(apn: &str, min: f64, max: f64) -> Parcel {
    let mut attributes = Attributes::new();
    attributes.insert("APN".to_string(), serde_json::json!(apn));
    attributes.insert("OWN_NAME1".to_string(), serde_json::json!(format!("Owner {apn}")));
    Parcel {
        attributes,
        boundary: Rect::new(coord! { x: min, y: min }, coord! { x: max, y: max })
            .to_polygon()
            .into(),
    }
}

/// Writes the parcel database and control files under a fresh root.
fn fixture(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("damage_assessment_e2e_{name}"));
    if root.exists() {
        std::fs::remove_dir_all(&root).unwrap();
    }
    std::fs::create_dir_all(root.join("control")).unwrap();

    let conn = duckdb::Connection::open(root.join("parcels.duckdb")).unwrap();
    damage_assessment_spatial::write_parcels(
        &conn,
        "parcels",
        &[
            parcel("100", 0.0, 10.0),
            parcel("200", 0.0, 10.0),
            parcel("300", 20.0, 30.0),
        ],
    )
    .unwrap();
    drop(conn);

    let header: String = (1..=8).map(|i| format!("instruction {i},\n")).collect();
    std::fs::write(
        root.join("control/Match_Report_to_APN.csv"),
        format!("{header}DA-100,200\n"),
    )
    .unwrap();
    std::fs::write(
        root.join("control/Fields_To_Add.csv"),
        "Field Name,Type,Length\nexample,TEXT,10\nNotes,TEXT,255\nEstimatedReplacementCost,DOUBLE,\n",
    )
    .unwrap();
    std::fs::write(
        root.join("control/Fields_To_Calculate.csv"),
        "Selection,,Field,,Calculation\nexample,,,,\n\
         1=1,,Status,,Reviewed\n\
         ReportNumber = 'DA-300',,EstimatedReplacementCost,,125000\n",
    )
    .unwrap();

    root
}

fn config(root: &Path) -> PipelineConfig {
    PipelineConfig::from_toml_str(&format!(
        r#"
        [feature_service]
        service_url = "https://example.invalid/arcgis/rest/services/DA_Fire/FeatureServer"
        page_size = 2

        [paths]
        manual_root = "{root}"
        scheduled_root = "{root}"

        [store]
        snapshot_name = "DA_Fire"
        parcel_database = "parcels.duckdb"

        [control_files]
        override_csv = "control/Match_Report_to_APN.csv"
        fields_to_add = "control/Fields_To_Add.csv"
        fields_to_calculate = "control/Fields_To_Calculate.csv"
        "#,
        root = root.display()
    ))
    .unwrap()
}

fn service() -> MemoryFeatureService {
    MemoryFeatureService::new(
        vec![
            report(1, "DA-100", 5.0, 5.0),
            report(2, "DA-200", 5.0, 5.0),
            report(3, "DA-300", 25.0, 25.0),
            report(4, "DA-400", 50.0, 50.0),
        ],
        1_000,
    )
}

async fn run_scope(
    config: &PipelineConfig,
    service: &MemoryFeatureService,
    scope: RunScope,
    approve: bool,
) -> (RunSummary, Result<(), damage_assessment_pipeline::PipelineError>, MemoryReporter) {
    let reporter = MemoryReporter::new();
    let ctx = RunContext::new(
        config,
        Mode::Manual,
        &reporter,
        &NullProgress,
        CancellationFlag::new(),
    );
    let mut confirm = |_: &RunSummary| approve;
    let (summary, result) = run(&ctx, service, scope, &mut confirm).await;
    (summary, result, reporter)
}

#[tokio::test]
async fn full_run_publishes_reconciled_snapshot() {
    let root = fixture("full");
    let config = config(&root);
    let service = service();

    let (summary, result, reporter) = run_scope(&config, &service, RunScope::Full, true).await;
    result.unwrap();

    assert_eq!(summary.records_extracted, 4);
    assert_eq!(summary.parcels_in_extent, 3);
    assert_eq!(summary.join_rows, 6);
    assert_eq!(summary.rows_reconciled, 4);
    assert_eq!(summary.reconcile.resolved_by_override, 1);
    assert_eq!(summary.reconcile.nullified, 1);

    let store = DuckDbSnapshotStore::open(&root.join("damage_assessment.duckdb"), "DA_Fire").unwrap();
    let rows = store.load(SnapshotTable::Production).unwrap();
    assert_eq!(rows.len(), 4);
    let apn_of = |rn: &str| {
        rows.iter()
            .find(|r| r.report.report_number().as_deref() == Some(rn))
            .and_then(damage_assessment_report_models::JoinResult::apn)
    };
    assert_eq!(apn_of("DA-100").as_deref(), Some("200"));
    assert_eq!(apn_of("DA-200"), None);
    assert_eq!(apn_of("DA-300").as_deref(), Some("300"));
    assert_eq!(apn_of("DA-400"), None);
    assert!(rows.iter().all(|r| r.report.attributes["Status"] == "Reviewed"));
    assert!(rows.iter().all(|r| r.report.attributes.contains_key("Notes")));

    let rules: Vec<RuleId> = summary.findings.iter().map(|f| f.rule).collect();
    assert_eq!(
        rules,
        vec![RuleId::NotOnParcel, RuleId::StackedParcelUnresolved]
    );
    assert!(summary.qa_report.as_ref().unwrap().is_file());

    let sync = summary.field_sync.unwrap();
    assert_eq!(sync.quantity_defaulted, 4);
    assert_eq!(sync.cost_updated, 1);
    assert_eq!(service.record(1).unwrap().attributes["Quantity"], 1);
    assert_eq!(
        service.record(3).unwrap().attributes["EstimatedReplacementCost"],
        125_000
    );

    assert!(meta::last_download_time(store.connection()).unwrap().is_some());
    assert!(reporter.events().iter().any(|e| matches!(
        e,
        PipelineEvent::SnapshotStep { step: 4, .. }
    )));
    std::fs::remove_dir_all(root).unwrap();
}

#[tokio::test]
async fn second_run_keeps_previous_snapshot_as_backup() {
    let root = fixture("rerun");
    let config = config(&root);
    let service = service();

    run_scope(&config, &service, RunScope::Full, true).await.1.unwrap();
    let (summary, result, _) = run_scope(&config, &service, RunScope::Full, true).await;
    result.unwrap();
    assert_eq!(summary.commit.unwrap().backed_up, 4);

    let store = DuckDbSnapshotStore::open(&root.join("damage_assessment.duckdb"), "DA_Fire").unwrap();
    assert_eq!(store.count(SnapshotTable::Production).unwrap(), 4);
    assert_eq!(store.count(SnapshotTable::Backup).unwrap(), 4);
    std::fs::remove_dir_all(root).unwrap();
}

#[tokio::test]
async fn check_scope_never_commits() {
    let root = fixture("check");
    let config = config(&root);
    let service = service();

    let (summary, result, _) = run_scope(&config, &service, RunScope::Check, true).await;
    result.unwrap();
    assert!(summary.commit.is_none());
    assert!(summary.field_sync.is_none());
    assert!(summary.qa_report.is_some());

    let store = DuckDbSnapshotStore::open(&root.join("damage_assessment.duckdb"), "DA_Fire").unwrap();
    assert_eq!(store.count(SnapshotTable::Production).unwrap(), 0);
    assert!(service.record(1).unwrap().attributes.get("Quantity").is_none());
    std::fs::remove_dir_all(root).unwrap();
}

#[tokio::test]
async fn declined_commit_is_cancelled() {
    let root = fixture("declined");
    let config = config(&root);
    let service = service();

    let (summary, result, _) = run_scope(&config, &service, RunScope::Full, false).await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(summary.commit.is_none());
    std::fs::remove_dir_all(root).unwrap();
}

#[tokio::test]
async fn missing_parcel_database_fails_before_download() {
    let root = fixture("no_parcels");
    std::fs::remove_file(root.join("parcels.duckdb")).unwrap();
    let config = config(&root);
    let service = service();

    let (summary, result, reporter) = run_scope(&config, &service, RunScope::Full, true).await;
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Configuration);
    assert_eq!(summary.records_extracted, 0);
    assert!(reporter.events().is_empty());
    std::fs::remove_dir_all(root).unwrap();
}
