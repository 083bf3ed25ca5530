#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! QA/QC checks.
//!
//! A fixed battery of data-quality rules run over the extracted records and
//! the reconciled rows. Every rule is always evaluated; findings are
//! advisory and nothing here mutates its input. [`render_report`] formats
//! the findings for the staff-facing QA/QC log.

pub mod report;

use std::collections::BTreeMap;

use damage_assessment_report_models::{
    AffectedRecord, DamageReport, JoinResult, PipelineEvent, Reporter, ResolutionTag, RuleId,
    Severity, Stage, ValidationFinding,
};
use damage_assessment_spatial::ParcelIndex;

pub use report::{FILE_TIMESTAMP_FORMAT, ReportContext, render_report, write_report};

/// Who fixes a rule's findings, and how.
#[must_use]
pub const fn remediation(rule: RuleId) -> &'static str {
    match rule {
        RuleId::NotOnParcel => {
            "ANY DAMAGE ASSESSMENT STAFF, to fix please open the survey web map \
             and move the features with the above Report Numbers to the correct parcel."
        }
        RuleId::MissingParcelAttribution => {
            "LUEG-GIS, these reports are on a parcel but the parcel carries no APN. \
             Check the parcel data for the above Report Numbers."
        }
        RuleId::StackedParcelUnresolved => {
            "These reports are on stacked parcels and the override list does not say \
             which APN each should be associated with. ANY DAMAGE ASSESSMENT STAFF, to fix \
             please add the above reports and the APNs you wish associated to the override CSV."
        }
        RuleId::DuplicateReportNumber => {
            "LUEG-GIS, please find out why there are duplicate Report Numbers. The survey \
             form should create a unique Report Number for every report."
        }
        RuleId::MissingReportNumber => {
            "LUEG-GIS, please find out why there is no Report Number for these features. \
             Report numbers are generated by the survey form, so a record without one was \
             probably created outside the normal workflow and must be investigated."
        }
        RuleId::MissingIncidentName => {
            "LUEG-GIS, please fill out an Incident Name for these features. If there is more \
             than one current incident this should be done now; otherwise it can be done \
             when convenient."
        }
    }
}

const fn severity(rule: RuleId) -> Severity {
    match rule {
        RuleId::StackedParcelUnresolved | RuleId::MissingIncidentName => Severity::Info,
        _ => Severity::Warning,
    }
}

fn finding(rule: RuleId, mut affected: Vec<AffectedRecord>) -> Option<ValidationFinding> {
    if affected.is_empty() {
        return None;
    }
    affected.sort();
    affected.dedup();
    Some(ValidationFinding {
        rule,
        severity: severity(rule),
        affected,
        remediation: remediation(rule).to_string(),
    })
}

fn affected_row(row: &JoinResult) -> AffectedRecord {
    AffectedRecord::from(&row.report)
}

/// R1: records whose location intersects no parcel. Records without
/// geometry count as off-parcel.
#[must_use]
pub fn check_not_on_parcel(
    reports: &[DamageReport],
    parcels: &ParcelIndex,
) -> Option<ValidationFinding> {
    finding(
        RuleId::NotOnParcel,
        reports
            .iter()
            .filter(|r| !r.geometry.is_some_and(|p| parcels.intersects_any(p)))
            .map(AffectedRecord::from)
            .collect(),
    )
}

/// R2: reconciled rows that are on a parcel but carry no parcel
/// attribution. Rows cleared by stacked-parcel reconciliation are split out
/// as an informational finding.
#[must_use]
pub fn check_parcel_attribution(
    reconciled: &[JoinResult],
    parcels: &ParcelIndex,
) -> (Option<ValidationFinding>, Option<ValidationFinding>) {
    let unattributed_on_parcel = reconciled.iter().filter(|row| {
        !row.is_attributed()
            && row
                .report
                .geometry
                .is_some_and(|p| parcels.intersects_any(p))
    });

    let (nullified, missing): (Vec<&JoinResult>, Vec<&JoinResult>) =
        unattributed_on_parcel.partition(|row| row.tag == ResolutionTag::Nullify);

    (
        finding(
            RuleId::MissingParcelAttribution,
            missing.into_iter().map(affected_row).collect(),
        ),
        finding(
            RuleId::StackedParcelUnresolved,
            nullified.into_iter().map(affected_row).collect(),
        ),
    )
}

/// R3: report numbers held by more than one extracted record.
#[must_use]
pub fn check_duplicate_report_numbers(reports: &[DamageReport]) -> Option<ValidationFinding> {
    let mut by_number: BTreeMap<String, Vec<&DamageReport>> = BTreeMap::new();
    for report in reports {
        if let Some(number) = report.report_number() {
            by_number.entry(number).or_default().push(report);
        }
    }
    finding(
        RuleId::DuplicateReportNumber,
        by_number
            .into_values()
            .filter(|group| group.len() > 1)
            .flatten()
            .map(AffectedRecord::from)
            .collect(),
    )
}

/// R4: records with no report number.
#[must_use]
pub fn check_missing_report_numbers(reports: &[DamageReport]) -> Option<ValidationFinding> {
    finding(
        RuleId::MissingReportNumber,
        reports
            .iter()
            .filter(|r| r.report_number().is_none())
            .map(AffectedRecord::from)
            .collect(),
    )
}

/// R5: records with no incident name.
#[must_use]
pub fn check_missing_incident_names(reports: &[DamageReport]) -> Option<ValidationFinding> {
    finding(
        RuleId::MissingIncidentName,
        reports
            .iter()
            .filter(|r| r.incident_name().is_none())
            .map(AffectedRecord::from)
            .collect(),
    )
}

/// Runs every rule. `reports` is the extracted (pre-join) record set and
/// `reconciled` the reconciler's output. Returns the non-empty findings in
/// rule order and reports each one.
#[must_use]
pub fn validate(
    reports: &[DamageReport],
    reconciled: &[JoinResult],
    parcels: &ParcelIndex,
    reporter: &dyn Reporter,
) -> Vec<ValidationFinding> {
    reporter.report(PipelineEvent::StageStarted {
        stage: Stage::Validate,
    });

    let (missing_attribution, stacked_unresolved) = check_parcel_attribution(reconciled, parcels);
    let findings: Vec<ValidationFinding> = [
        check_not_on_parcel(reports, parcels),
        missing_attribution,
        stacked_unresolved,
        check_duplicate_report_numbers(reports),
        check_missing_report_numbers(reports),
        check_missing_incident_names(reports),
    ]
    .into_iter()
    .flatten()
    .collect();

    for finding in &findings {
        reporter.report(PipelineEvent::Finding(finding.clone()));
    }
    reporter.report(PipelineEvent::StageFinished {
        stage: Stage::Validate,
        records: findings.iter().map(|f| f.affected.len()).sum(),
    });
    findings
}

#[cfg(test)]
mod tests {
    use damage_assessment_report_models::{
        APN_FIELD, Attributes, INCIDENT_NAME_FIELD, MemoryReporter, Parcel, REPORT_NUMBER_FIELD,
        ReportPoint,
    };
    use geo::{MultiPolygon, polygon};

    use super::*;

    fn parcels() -> ParcelIndex {
        let mut attributes = Attributes::new();
        attributes.insert(APN_FIELD.to_string(), serde_json::json!("100"));
        ParcelIndex::new(vec![Parcel {
            attributes,
            boundary: MultiPolygon(vec![polygon![
                (x: 0.0, y: 0.0),
                (x: 10.0, y: 0.0),
                (x: 10.0, y: 10.0),
                (x: 0.0, y: 10.0),
                (x: 0.0, y: 0.0),
            ]]),
        }])
    }

    fn report(id: i64, number: Option<&str>, incident: Option<&str>, at: (f64, f64)) -> DamageReport {
        let mut attributes = Attributes::new();
        if let Some(n) = number {
            attributes.insert(REPORT_NUMBER_FIELD.to_string(), serde_json::json!(n));
        }
        attributes.insert(
            INCIDENT_NAME_FIELD.to_string(),
            incident.map_or(serde_json::Value::Null, |i| serde_json::json!(i)),
        );
        DamageReport {
            object_id: id,
            geometry: Some(ReportPoint::new(at.0, at.1)),
            attributes,
        }
    }

    fn joined(report: &DamageReport, apn: Option<&str>, tag: ResolutionTag) -> JoinResult {
        JoinResult {
            report: report.clone(),
            parcel: apn.map(|a| {
                let mut attrs = Attributes::new();
                attrs.insert(APN_FIELD.to_string(), serde_json::json!(a));
                attrs
            }),
            join_order: 0,
            tag,
        }
    }

    fn rules(findings: &[ValidationFinding]) -> Vec<RuleId> {
        findings.iter().map(|f| f.rule).collect()
    }

    #[test]
    fn clean_data_has_no_findings() {
        let r = report(1, Some("DA-1"), Some("Valley Fire"), (5.0, 5.0));
        let rows = vec![joined(&r, Some("100"), ResolutionTag::Keep)];
        let findings = validate(&[r], &rows, &parcels(), &MemoryReporter::new());
        assert!(findings.is_empty());
    }

    #[test]
    fn flags_off_parcel_records() {
        let on = report(1, Some("DA-1"), Some("Fire"), (5.0, 5.0));
        let off = report(2, Some("DA-2"), Some("Fire"), (50.0, 50.0));
        let finding = check_not_on_parcel(&[on, off], &parcels()).unwrap();
        assert_eq!(finding.severity, Severity::Warning);
        assert_eq!(
            finding.affected,
            vec![AffectedRecord {
                object_id: 2,
                report_number: Some("DA-2".to_string()),
            }]
        );
    }

    #[test]
    fn nullified_rows_are_informational_not_missing() {
        let stacked = report(1, Some("DA-200"), Some("Fire"), (5.0, 5.0));
        let bad_parcel = report(2, Some("DA-201"), Some("Fire"), (6.0, 6.0));
        let off = report(3, Some("DA-202"), Some("Fire"), (50.0, 50.0));
        let rows = vec![
            joined(&stacked, None, ResolutionTag::Nullify),
            joined(&bad_parcel, None, ResolutionTag::Keep),
            joined(&off, None, ResolutionTag::Keep),
        ];
        let (missing, info) = check_parcel_attribution(&rows, &parcels());

        let missing = missing.unwrap();
        assert_eq!(missing.severity, Severity::Warning);
        assert_eq!(missing.affected[0].object_id, 2);
        assert_eq!(missing.affected.len(), 1);

        let info = info.unwrap();
        assert_eq!(info.severity, Severity::Info);
        assert_eq!(info.affected[0].object_id, 1);
    }

    #[test]
    fn duplicates_are_checked_before_join() {
        let reports = vec![
            report(1, Some("DA-1"), Some("Fire"), (5.0, 5.0)),
            report(2, Some("DA-1"), Some("Fire"), (6.0, 6.0)),
            report(3, Some("DA-3"), Some("Fire"), (7.0, 7.0)),
        ];
        let finding = check_duplicate_report_numbers(&reports).unwrap();
        let ids: Vec<i64> = finding.affected.iter().map(|a| a.object_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn every_rule_is_evaluated_and_reported() {
        let reports = vec![
            report(1, None, None, (50.0, 50.0)),
            report(2, Some("DA-2"), Some(" "), (5.0, 5.0)),
            report(3, Some("DA-2"), Some("Fire"), (5.0, 5.0)),
        ];
        let rows: Vec<JoinResult> = reports
            .iter()
            .map(|r| joined(r, None, ResolutionTag::Nullify))
            .collect();
        let reporter = MemoryReporter::new();
        let findings = validate(&reports, &rows, &parcels(), &reporter);

        assert_eq!(
            rules(&findings),
            vec![
                RuleId::NotOnParcel,
                RuleId::StackedParcelUnresolved,
                RuleId::DuplicateReportNumber,
                RuleId::MissingReportNumber,
                RuleId::MissingIncidentName,
            ]
        );
        assert_eq!(reporter.findings(), findings);
    }

    #[test]
    fn validation_does_not_mutate_inputs() {
        let reports = vec![report(1, None, None, (5.0, 5.0))];
        let rows = vec![joined(&reports[0], None, ResolutionTag::Nullify)];
        let (reports_before, rows_before) = (reports.clone(), rows.clone());
        let first = validate(&reports, &rows, &parcels(), &MemoryReporter::new());
        let second = validate(&reports, &rows, &parcels(), &MemoryReporter::new());
        assert!(!first.is_empty());
        assert_eq!(first, second);
        assert_eq!(reports, reports_before);
        assert_eq!(rows, rows_before);
    }
}
