#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared types for the damage-assessment pipeline.
//!
//! A [`DamageReport`] is one survey record pulled from the remote feature
//! service. Joining it against the reference [`Parcel`]s produces one
//! [`JoinResult`] per intersecting parcel; reconciliation then tags and
//! prunes those rows until every report number is represented exactly once.

pub mod cancel;
pub mod reporter;

use std::collections::BTreeMap;

use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use cancel::{Cancelled, CancellationFlag};
pub use reporter::{LogReporter, MemoryReporter, PipelineEvent, Reporter, Stage, TeeReporter};

/// Attribute bag keyed by field name. `Null` values are kept so that the
/// field list (schema) of a row survives nullification.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Business-level report identifier field on survey records.
pub const REPORT_NUMBER_FIELD: &str = "ReportNumber";

/// Descriptive incident label field on survey records.
pub const INCIDENT_NAME_FIELD: &str = "IncidentName";

/// Assessor's parcel number field on parcel records.
pub const APN_FIELD: &str = "APN";

/// Damaged-unit count field on survey records.
pub const QUANTITY_FIELD: &str = "Quantity";

/// Estimated replacement cost field on survey records.
pub const ESTIMATED_REPLACEMENT_COST_FIELD: &str = "EstimatedReplacementCost";

/// Fields that describe identity or geometry rather than parcel attributes.
/// They belong to the output row and are never nullified.
pub const STRUCTURAL_FIELDS: &[&str] = &[
    "OBJECTID",
    "Shape",
    "Shape.area",
    "Shape.len",
    "Shape_Area",
    "Shape_Length",
];

/// Returns `true` if `field` is one of the [`STRUCTURAL_FIELDS`].
#[must_use]
pub fn is_structural_field(field: &str) -> bool {
    STRUCTURAL_FIELDS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(field))
}

/// Returns `true` if `name` can be spliced into SQL as a table name:
/// non-empty ASCII letters, digits and underscores, not starting with a
/// digit.
#[must_use]
pub fn is_sql_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Renders an attribute value as trimmed text. Returns `None` for nulls,
/// empty strings, and nested values.
#[must_use]
pub fn attribute_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Null | serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            None
        }
    }
}

/// A point location in the service's spatial reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportPoint {
    /// Easting / longitude.
    pub x: f64,
    /// Northing / latitude.
    pub y: f64,
}

impl ReportPoint {
    /// Creates a new point.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One damage-assessment survey record as extracted from the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DamageReport {
    /// Server-assigned object id. Unique and monotonic within a dataset but
    /// not contiguous.
    pub object_id: i64,
    /// Survey location. `None` when the feature has no geometry.
    pub geometry: Option<ReportPoint>,
    /// Every attribute returned by the service, including the object id
    /// field.
    pub attributes: Attributes,
}

impl DamageReport {
    /// The business report number, if present and non-empty.
    #[must_use]
    pub fn report_number(&self) -> Option<String> {
        self.attributes
            .get(REPORT_NUMBER_FIELD)
            .and_then(attribute_text)
    }

    /// The incident label, if present and non-empty.
    #[must_use]
    pub fn incident_name(&self) -> Option<String> {
        self.attributes
            .get(INCIDENT_NAME_FIELD)
            .and_then(attribute_text)
    }
}

/// A reference parcel polygon. Read-only for the duration of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Parcel {
    /// Parcel attributes, including [`APN_FIELD`].
    pub attributes: Attributes,
    /// Parcel footprint.
    pub boundary: MultiPolygon<f64>,
}

impl Parcel {
    /// The assessor's parcel number, if present.
    #[must_use]
    pub fn apn(&self) -> Option<String> {
        self.attributes.get(APN_FIELD).and_then(attribute_text)
    }
}

/// How a join row is handled by stacked-parcel reconciliation.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionTag {
    /// Not yet looked at by the reconciler.
    #[default]
    Unresolved,
    /// Retained with full parcel attribution.
    Keep,
    /// Retained, but every parcel-origin attribute is cleared.
    Nullify,
    /// Removed from the output.
    Delete,
}

/// One (report, parcel) row of the one-to-many spatial join.
///
/// Record-origin and parcel-origin attributes are kept apart so that
/// nullification can clear exactly the parcel side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResult {
    /// The survey record, unchanged from extraction (plus any derived
    /// output fields added after reconciliation).
    pub report: DamageReport,
    /// Attributes copied from the intersecting parcel. `None` when the
    /// report intersects no parcel.
    pub parcel: Option<Attributes>,
    /// Position of this row in the join output. Stable for a given input.
    pub join_order: usize,
    /// Reconciliation outcome.
    pub tag: ResolutionTag,
}

impl JoinResult {
    /// The APN of the joined parcel, if any.
    #[must_use]
    pub fn apn(&self) -> Option<String> {
        self.parcel
            .as_ref()
            .and_then(|p| p.get(APN_FIELD))
            .and_then(attribute_text)
    }

    /// Looks up a field on the row, record attributes first, then parcel
    /// attributes.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.report.attributes.get(name).or_else(|| {
            self.parcel
                .as_ref()
                .and_then(|parcel| parcel.get(name))
        })
    }

    /// Returns `true` if the row carries a non-null value for `name`.
    #[must_use]
    pub fn has_value(&self, name: &str) -> bool {
        self.field(name).is_some_and(|v| !v.is_null())
    }

    /// Returns `true` if the row has parcel attribution with a usable APN.
    #[must_use]
    pub fn is_attributed(&self) -> bool {
        self.apn().is_some()
    }

    /// Clears every parcel-origin attribute except the structural fields.
    /// Field names are kept so the row's schema does not change.
    pub fn nullify_parcel(&mut self) {
        if let Some(parcel) = self.parcel.as_mut() {
            for (name, value) in parcel.iter_mut() {
                if !is_structural_field(name) {
                    *value = serde_json::Value::Null;
                }
            }
        }
    }
}

/// An operator-maintained (report number, APN) preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverridePair {
    /// Report number the override applies to.
    pub report_number: String,
    /// APN the report should be attributed to.
    pub apn: String,
}

/// The QA/QC rule a finding was raised by.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleId {
    /// R1: the record's location intersects no reference parcel.
    NotOnParcel,
    /// R2: the record is on a parcel but carries no parcel attribution.
    MissingParcelAttribution,
    /// R2 (informational): stacked parcel nullified because no override
    /// entry resolved it.
    StackedParcelUnresolved,
    /// R3: two or more records share a report number.
    DuplicateReportNumber,
    /// R4: the record has no report number.
    MissingReportNumber,
    /// R5: the record has no incident label.
    MissingIncidentName,
}

impl RuleId {
    /// All rules, in report order.
    pub const ALL: &[Self] = &[
        Self::NotOnParcel,
        Self::MissingParcelAttribution,
        Self::StackedParcelUnresolved,
        Self::DuplicateReportNumber,
        Self::MissingReportNumber,
        Self::MissingIncidentName,
    ];

    /// The numbered check this rule belongs to (1 through 5).
    #[must_use]
    pub const fn number(self) -> u8 {
        match self {
            Self::NotOnParcel => 1,
            Self::MissingParcelAttribution | Self::StackedParcelUnresolved => 2,
            Self::DuplicateReportNumber => 3,
            Self::MissingReportNumber => 4,
            Self::MissingIncidentName => 5,
        }
    }
}

/// How serious a finding is. Findings never block the pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Expected condition that staff should tidy up when convenient.
    Info,
    /// Data-quality problem that needs correcting.
    Warning,
}

/// A record affected by a finding.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedRecord {
    /// Remote object id.
    pub object_id: i64,
    /// Report number, when the record has one.
    pub report_number: Option<String>,
}

impl From<&DamageReport> for AffectedRecord {
    fn from(report: &DamageReport) -> Self {
        Self {
            object_id: report.object_id,
            report_number: report.report_number(),
        }
    }
}

/// Advisory output of one QA/QC rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFinding {
    /// The rule that raised this finding.
    pub rule: RuleId,
    /// Finding severity.
    pub severity: Severity,
    /// Records that violate the rule, ordered by object id.
    pub affected: Vec<AffectedRecord>,
    /// Who should fix it and how.
    pub remediation: String,
}
