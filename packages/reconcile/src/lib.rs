#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Stacked-parcel reconciliation.
//!
//! The spatial join emits one row per intersecting (report, parcel) pair.
//! Where a report sits on several overlapping parcels the rows form a
//! "stacked" group that must collapse to a single row:
//!
//! * If the override table lists APNs for the report number, the first
//!   listed APN (file order) that is present in the group wins and that row
//!   is kept with full parcel attribution. If several rows carry that APN
//!   the earliest join row wins.
//! * Otherwise, or when none of the override APNs are under the report, the
//!   row with the lowest APN (rows without an APN last, then join order) is
//!   kept with its parcel attributes cleared.
//!
//! All other rows of the group are dropped. Reports without a report number
//! are never grouped with each other.

pub mod overrides;

use std::collections::BTreeMap;

use damage_assessment_report_models::{
    JoinResult, PipelineEvent, Reporter, ResolutionTag, Stage,
};
use serde::{Deserialize, Serialize};

pub use overrides::{DEFAULT_HEADER_ROWS, OverrideError, OverrideTable};

/// Counts describing one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    /// Distinct report groups (one per output row).
    pub groups: usize,
    /// Groups with more than one row.
    pub stacked: usize,
    pub resolved_by_override: usize,
    pub nullified: usize,
    /// Rows removed.
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Report(String),
    Orphan(i64),
}

impl GroupKey {
    fn of(row: &JoinResult) -> Self {
        row.report
            .report_number()
            .map_or(Self::Orphan(row.report.object_id), Self::Report)
    }

    fn label(&self) -> String {
        match self {
            Self::Report(number) => number.clone(),
            Self::Orphan(object_id) => format!("<object {object_id}>"),
        }
    }
}

/// Tags every row of the group. Returns the tag given to the surviving
/// row.
fn resolve_group(
    key: &GroupKey,
    rows: &mut [&mut JoinResult],
    overrides: &OverrideTable,
    reporter: &dyn Reporter,
) -> ResolutionTag {
    if let [row] = rows {
        row.tag = ResolutionTag::Keep;
        return ResolutionTag::Keep;
    }

    let override_apns = match key {
        GroupKey::Report(number) => overrides.apns_for(number),
        GroupKey::Orphan(_) => Vec::new(),
    };

    let row_apns: Vec<Option<String>> = rows.iter().map(|r| r.apn()).collect();
    let matching: Vec<&str> = override_apns
        .iter()
        .copied()
        .filter(|apn| row_apns.iter().any(|a| a.as_deref() == Some(*apn)))
        .collect();

    let (winner, tag) = if let Some(&chosen) = matching.first() {
        if matching.len() > 1 {
            reporter.report(PipelineEvent::OverrideAmbiguous {
                report_number: key.label(),
                chosen_apn: chosen.to_string(),
                matching_apns: matching.iter().map(ToString::to_string).collect(),
            });
        }
        let winner = (0..rows.len())
            .filter(|&i| row_apns[i].as_deref() == Some(chosen))
            .min_by_key(|&i| rows[i].join_order);
        (winner, ResolutionTag::Keep)
    } else {
        if !override_apns.is_empty() {
            reporter.report(PipelineEvent::OverrideInconsistent {
                report_number: key.label(),
                override_apns: override_apns.iter().map(ToString::to_string).collect(),
            });
        }
        let winner = (0..rows.len()).min_by(|&a, &b| {
            fallback_rank(row_apns[a].as_deref(), rows[a].join_order)
                .cmp(&fallback_rank(row_apns[b].as_deref(), rows[b].join_order))
        });
        (winner, ResolutionTag::Nullify)
    };

    for (i, row) in rows.iter_mut().enumerate() {
        row.tag = if Some(i) == winner {
            tag
        } else {
            ResolutionTag::Delete
        };
    }

    reporter.report(PipelineEvent::StackedParcel {
        report_number: key.label(),
        apn: winner.and_then(|i| row_apns[i].clone()),
        tag,
        candidates: rows.len(),
    });
    tag
}

/// Lowest APN first, rows without an APN last, then join order.
fn fallback_rank(apn: Option<&str>, join_order: usize) -> (bool, Option<&str>, usize) {
    (apn.is_none(), apn, join_order)
}

/// Collapses the join output to exactly one row per report.
///
/// Returns the surviving rows in join order: `keep` rows untouched,
/// `nullify` rows with their parcel attributes cleared. `delete` rows are
/// removed.
#[must_use]
pub fn reconcile(
    mut rows: Vec<JoinResult>,
    overrides: &OverrideTable,
    reporter: &dyn Reporter,
) -> (Vec<JoinResult>, ReconcileSummary) {
    reporter.report(PipelineEvent::StageStarted {
        stage: Stage::Reconcile,
    });

    for (report_number, apns) in overrides.conflicts() {
        reporter.report(PipelineEvent::OverrideConflict {
            report_number: report_number.to_string(),
            apns: apns.into_iter().map(ToString::to_string).collect(),
        });
    }

    let mut groups: BTreeMap<GroupKey, Vec<&mut JoinResult>> = BTreeMap::new();
    for row in &mut rows {
        groups.entry(GroupKey::of(row)).or_default().push(row);
    }

    let mut summary = ReconcileSummary {
        groups: groups.len(),
        ..ReconcileSummary::default()
    };
    for (key, mut group) in groups {
        if group.len() > 1 {
            summary.stacked += 1;
        }
        match resolve_group(&key, &mut group, overrides, reporter) {
            ResolutionTag::Keep if group.len() > 1 => summary.resolved_by_override += 1,
            ResolutionTag::Nullify => summary.nullified += 1,
            _ => {}
        }
    }

    let before = rows.len();
    rows.retain(|row| row.tag != ResolutionTag::Delete);
    summary.deleted = before - rows.len();
    for row in &mut rows {
        if row.tag == ResolutionTag::Nullify {
            row.nullify_parcel();
        }
    }
    rows.sort_by_key(|row| row.join_order);

    log::info!(
        "Reconciled {} groups: {} stacked, {} by override, {} nullified, {} rows removed",
        summary.groups,
        summary.stacked,
        summary.resolved_by_override,
        summary.nullified,
        summary.deleted,
    );
    reporter.report(PipelineEvent::StageFinished {
        stage: Stage::Reconcile,
        records: rows.len(),
    });

    (rows, summary)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use damage_assessment_report_models::{
        APN_FIELD, Attributes, DamageReport, MemoryReporter, OverridePair, ReportPoint,
    };

    use super::*;

    fn report(id: i64, report_number: Option<&str>) -> DamageReport {
        let mut attributes = Attributes::new();
        attributes.insert("OBJECTID".to_string(), serde_json::json!(id));
        if let Some(number) = report_number {
            attributes.insert("ReportNumber".to_string(), serde_json::json!(number));
        }
        attributes.insert("IncidentName".to_string(), serde_json::json!("Valley Fire"));
        DamageReport {
            object_id: id,
            geometry: Some(ReportPoint::new(1.0, 1.0)),
            attributes,
        }
    }

    fn parcel(apn: Option<&str>) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert(
            APN_FIELD.to_string(),
            apn.map_or(serde_json::Value::Null, |a| serde_json::json!(a)),
        );
        attributes.insert("OWN_NAME1".to_string(), serde_json::json!("OWNER"));
        attributes.insert("Shape_Area".to_string(), serde_json::json!(1200.0));
        attributes
    }

    /// Builds join rows from (object id, report number, APN) triples.
    fn rows(layout: &[(i64, Option<&str>, Option<&str>)]) -> Vec<JoinResult> {
        layout.iter()
            .enumerate()
            .map(|(i, (id, number, apn))| JoinResult {
                report: report(*id, *number),
                parcel: Some(parcel(*apn)),
                join_order: i,
                tag: ResolutionTag::Unresolved,
            })
            .collect()
    }

    fn overrides(pairs: &[(&str, &str)]) -> OverrideTable {
        OverrideTable::new(
            pairs
                .iter()
                .map(|(rn, apn)| OverridePair {
                    report_number: (*rn).to_string(),
                    apn: (*apn).to_string(),
                })
                .collect(),
        )
    }

    #[test]
    fn override_selects_listed_apn() {
        let input = rows(&[
            (1, Some("DA-100"), Some("1")),
            (1, Some("DA-100"), Some("2")),
            (1, Some("DA-100"), Some("3")),
        ]);
        let reporter = MemoryReporter::new();
        let (out, summary) = reconcile(input, &overrides(&[("DA-100", "2")]), &reporter);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].apn().as_deref(), Some("2"));
        assert_eq!(out[0].tag, ResolutionTag::Keep);
        assert_eq!(out[0].parcel.as_ref().unwrap()["OWN_NAME1"], "OWNER");
        assert_eq!(summary.resolved_by_override, 1);
        assert_eq!(summary.deleted, 2);
    }

    #[test]
    fn no_override_nullifies_single_row() {
        let input = rows(&[(2, Some("DA-200"), Some("5")), (2, Some("DA-200"), Some("4"))]);
        let (out, summary) = reconcile(input, &OverrideTable::default(), &MemoryReporter::new());

        assert_eq!(out.len(), 1);
        let row = &out[0];
        assert_eq!(row.tag, ResolutionTag::Nullify);
        // Lowest APN was chosen, then cleared.
        assert_eq!(row.join_order, 1);
        let parcel = row.parcel.as_ref().unwrap();
        assert!(parcel[APN_FIELD].is_null());
        assert!(parcel["OWN_NAME1"].is_null());
        assert_eq!(parcel["Shape_Area"], 1200.0);
        assert_eq!(row.report.report_number().as_deref(), Some("DA-200"));
        assert_eq!(row.report.attributes["IncidentName"], "Valley Fire");
        assert_eq!(summary.nullified, 1);
    }

    #[test]
    fn inconsistent_override_falls_back_with_warning() {
        let input = rows(&[(3, Some("DA-300"), Some("8")), (3, Some("DA-300"), Some("9"))]);
        let reporter = MemoryReporter::new();
        let (out, _) = reconcile(input, &overrides(&[("DA-300", "7")]), &reporter);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tag, ResolutionTag::Nullify);
        assert!(reporter.events().contains(&PipelineEvent::OverrideInconsistent {
            report_number: "DA-300".to_string(),
            override_apns: vec!["7".to_string()],
        }));
    }

    #[test]
    fn first_override_in_file_order_wins() {
        let input = rows(&[(4, Some("DA-400"), Some("1")), (4, Some("DA-400"), Some("2"))]);
        let reporter = MemoryReporter::new();
        let table = overrides(&[("DA-400", "2"), ("DA-400", "1")]);
        let (out, _) = reconcile(input, &table, &reporter);

        assert_eq!(out[0].apn().as_deref(), Some("2"));
        let events = reporter.events();
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::OverrideAmbiguous { chosen_apn, .. } if chosen_apn == "2"
        )));
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::OverrideConflict { .. })));
    }

    #[test]
    fn rows_without_apn_rank_last_in_fallback() {
        let input = rows(&[(5, Some("DA-500"), None), (5, Some("DA-500"), Some("9"))]);
        let (out, _) = reconcile(input, &OverrideTable::default(), &MemoryReporter::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].join_order, 1);
    }

    #[test]
    fn single_rows_and_unjoined_reports_are_kept() {
        let mut input = rows(&[(6, Some("DA-600"), Some("1"))]);
        input.push(JoinResult {
            report: report(7, Some("DA-700")),
            parcel: None,
            join_order: 1,
            tag: ResolutionTag::Unresolved,
        });
        let (out, summary) = reconcile(input, &OverrideTable::default(), &MemoryReporter::new());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.tag == ResolutionTag::Keep));
        assert_eq!(out[0].apn().as_deref(), Some("1"));
        assert_eq!(summary.stacked, 0);
    }

    #[test]
    fn reports_without_number_are_not_merged() {
        let input = rows(&[(8, None, Some("1")), (9, None, Some("2"))]);
        let (out, summary) = reconcile(input, &OverrideTable::default(), &MemoryReporter::new());
        assert_eq!(out.len(), 2);
        assert_eq!(summary.groups, 2);
        assert!(out.iter().all(|r| r.tag == ResolutionTag::Keep));
    }

    #[test]
    fn every_report_number_appears_exactly_once() {
        let input = rows(&[
            (10, Some("A"), Some("1")),
            (10, Some("A"), Some("2")),
            (11, Some("B"), Some("3")),
            (12, Some("C"), Some("4")),
            (12, Some("C"), Some("5")),
            (12, Some("C"), Some("6")),
            (13, None, Some("7")),
            (13, None, Some("8")),
        ]);
        let numbers_in: BTreeSet<_> = input.iter().filter_map(|r| r.report.report_number()).collect();
        let (out, _) = reconcile(input, &overrides(&[("C", "6")]), &MemoryReporter::new());

        let numbers_out: Vec<_> = out.iter().filter_map(|r| r.report.report_number()).collect();
        assert_eq!(numbers_out.len(), numbers_in.len());
        assert_eq!(numbers_out.iter().cloned().collect::<BTreeSet<_>>(), numbers_in);
        assert_eq!(out.iter().filter(|r| r.report.object_id == 13).count(), 1);
        assert!(out
            .iter()
            .all(|r| matches!(r.tag, ResolutionTag::Keep | ResolutionTag::Nullify)));
    }
}
