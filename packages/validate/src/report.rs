//! The staff-facing QA/QC log.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use damage_assessment_report_models::{AffectedRecord, RuleId, Severity, ValidationFinding};

/// Timestamp suffix used in generated file names.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y_%m_%d__%H_%M_%S";

const BANNER: &str = "++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++++";
const RULE: &str = "------------------------------------------------------------------";

/// Details printed in the report header.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub generated_at: DateTime<Local>,
    /// Location of the override CSV, so staff know where to add entries.
    pub override_file: Option<PathBuf>,
    pub records_checked: usize,
}

fn heading(number: u8) -> &'static str {
    match number {
        1 => "Checking for features that are not on a parcel...",
        2 => "Checking for features that are on a parcel but have no APN info...",
        3 => "Checking for features with duplicate Report Numbers...",
        4 => "Checking for features with no Report Number...",
        _ => "Checking for features with no Incident Name...",
    }
}

fn ok_line(number: u8) -> &'static str {
    match number {
        1 => "OK! There were no features not on a parcel.",
        2 => "OK! There were no features on a parcel w/o APN info.",
        3 => "OK! There were no duplicate Report Numbers.",
        4 => "OK! There were no features without a Report Number.",
        _ => "OK! There were no features without an Incident Name.",
    }
}

fn summary_line(finding: &ValidationFinding) -> String {
    let n = finding.affected.len();
    let label = match finding.severity {
        Severity::Warning => "WARNING!",
        Severity::Info => "INFO:",
    };
    let text = match finding.rule {
        RuleId::NotOnParcel => format!("There were \"{n}\" features not on a parcel"),
        RuleId::MissingParcelAttribution => {
            format!("There were \"{n}\" Reports on a parcel but have no APN info")
        }
        RuleId::StackedParcelUnresolved => format!(
            "There were \"{n}\" Reports on stacked parcels with no APN selected in the override list"
        ),
        RuleId::DuplicateReportNumber => format!("There were \"{n}\" features sharing a Report Number"),
        RuleId::MissingReportNumber => format!(
            "There were \"{n}\" features without a Report Number at the time the data was downloaded."
        ),
        RuleId::MissingIncidentName => format!(
            "There were \"{n}\" features without an Incident Name at the time the data was downloaded."
        ),
    };
    format!("{label} {text}")
}

fn record_label(record: &AffectedRecord) -> String {
    record.report_number.as_ref().map_or_else(
        || format!("<no Report Number> (OBJECTID {})", record.object_id),
        Clone::clone,
    )
}

/// Renders the QA/QC log: a header, one section per numbered check
/// (`OK!` when nothing was found), and a footer.
#[must_use]
pub fn render_report(findings: &[ValidationFinding], context: &ReportContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{BANNER}");
    let _ = writeln!(out, "                   Start Damage Assessment QA/QC Log");
    let _ = writeln!(
        out,
        "QA/QC checks performed on {} downloaded damage assessment records",
        context.records_checked
    );
    let _ = writeln!(
        out,
        "Generated: {}",
        context.generated_at.format("%d %b, %Y - %I:%M:%S %p")
    );
    let _ = writeln!(out, "{BANNER}");

    for number in 1..=5u8 {
        let _ = writeln!(out, "\n{RULE}");
        let _ = writeln!(out, "{number}) {}", heading(number));

        let section: Vec<&ValidationFinding> = findings
            .iter()
            .filter(|f| f.rule.number() == number)
            .collect();
        if section.is_empty() {
            let _ = writeln!(out, "  {}", ok_line(number));
            continue;
        }

        for finding in section {
            let _ = writeln!(out, "  {}", summary_line(finding));
            let _ = writeln!(out, "  Report Number:");
            for record in &finding.affected {
                let _ = writeln!(out, "    {}", record_label(record));
            }
            let _ = writeln!(out, "\n  {}", finding.remediation);
            if finding.rule == RuleId::StackedParcelUnresolved
                && let Some(path) = &context.override_file
            {
                let _ = writeln!(out, "  Override CSV:\n    {}", path.display());
            }
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "{BANNER}");
    let _ = writeln!(out, "                      End Damage Assessment QA/QC");
    let _ = writeln!(out, "{BANNER}");
    out
}

/// Writes the rendered report to
/// `<folder>/DA_QA_QC_<YYYY_MM_DD__HH_MM_SS>.log` and returns the path.
///
/// # Errors
///
/// Returns an I/O error if the folder cannot be created or the file cannot
/// be written.
pub fn write_report(
    folder: &Path,
    findings: &[ValidationFinding],
    context: &ReportContext,
) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(folder)?;
    let path = folder.join(format!(
        "DA_QA_QC_{}.log",
        context.generated_at.format(FILE_TIMESTAMP_FORMAT)
    ));
    std::fs::write(&path, render_report(findings, context))?;
    log::info!("QA/QC report written to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;
    use crate::remediation;

    fn context() -> ReportContext {
        ReportContext {
            generated_at: Local.with_ymd_and_hms(2026, 3, 4, 15, 6, 7).unwrap(),
            override_file: Some(PathBuf::from("control/Match_Report_to_APN.csv")),
            records_checked: 3,
        }
    }

    fn finding(rule: RuleId, severity: Severity, affected: Vec<AffectedRecord>) -> ValidationFinding {
        ValidationFinding {
            rule,
            severity,
            affected,
            remediation: remediation(rule).to_string(),
        }
    }

    #[test]
    fn empty_findings_render_all_ok() {
        let text = render_report(&[], &context());
        assert!(text.contains("1) Checking for features that are not on a parcel..."));
        assert!(text.contains("OK! There were no features without an Incident Name."));
        assert_eq!(text.matches("OK!").count(), 5);
        assert!(text.contains("04 Mar, 2026 - 03:06:07 PM"));
    }

    #[test]
    fn findings_list_report_numbers_and_remediation() {
        let findings = vec![
            finding(
                RuleId::NotOnParcel,
                Severity::Warning,
                vec![AffectedRecord {
                    object_id: 9,
                    report_number: Some("DA-9".to_string()),
                }],
            ),
            finding(
                RuleId::StackedParcelUnresolved,
                Severity::Info,
                vec![AffectedRecord {
                    object_id: 4,
                    report_number: None,
                }],
            ),
        ];
        let text = render_report(&findings, &context());
        assert!(text.contains("WARNING! There were \"1\" features not on a parcel"));
        assert!(text.contains("    DA-9"));
        assert!(text.contains("INFO: There were \"1\" Reports on stacked parcels"));
        assert!(text.contains("<no Report Number> (OBJECTID 4)"));
        assert!(text.contains("control/Match_Report_to_APN.csv"));
        assert_eq!(text.matches("OK!").count(), 3);
    }

    #[test]
    fn report_file_name_carries_timestamp() {
        let folder = std::env::temp_dir().join("damage_assessment_qa_report_test");
        let path = write_report(&folder, &[], &context()).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "DA_QA_QC_2026_03_04__15_06_07.log"
        );
        assert!(std::fs::read_to_string(&path).unwrap().contains("End Damage Assessment QA/QC"));
        std::fs::remove_file(path).unwrap();
    }
}
