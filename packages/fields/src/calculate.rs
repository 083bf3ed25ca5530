//! Field calculations.
//!
//! Each row of the fields-to-calculate file holds a selection predicate
//! (column 0), a target field (column 2) and a calculation (column 4).
//!
//! Predicates: `1=1`, `F IS NULL`, `F IS NOT NULL`, `F = 'text'` and
//! `F = number`.
//!
//! Calculations, in order of precedence:
//!
//! * Target `SiteFullAddress`, `OwnerName` or `OwnerFullAddress`: a fixed
//!   concatenation of parcel address or owner fields.
//! * `!Field!`: copy the value of another field.
//! * Anything else: the text itself.

use std::{io::Read, path::Path};

use damage_assessment_report_models::{JoinResult, PipelineEvent, Reporter, Stage};
use serde::{Deserialize, Serialize};

use crate::{FieldDefinition, FieldType, FieldsError, body_records, open, parse_number};

const SITUS_FIELDS: [&str; 6] = [
    "SITUS_ADDRESS",
    "SITUS_PRE_DIR",
    "SITUS_STREET",
    "SITUS_SUFFIX",
    "SITUS_POST_DIR",
    "SITUS_SUITE",
];
const OWNER_NAME_FIELDS: [&str; 3] = ["OWN_NAME1", "OWN_NAME2", "OWN_NAME3"];
const OWNER_ADDRESS_FIELDS: [&str; 4] = ["OWN_ADDR1", "OWN_ADDR2", "OWN_ADDR3", "OWN_ADDR4"];

/// Which rows a calculation applies to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selector {
    All,
    IsNull(String),
    IsNotNull(String),
    Equals(String, serde_json::Value),
}

impl Selector {
    /// Parses a predicate. Returns `None` if it is outside the supported
    /// dialect.
    #[must_use]
    pub fn parse(predicate: &str) -> Option<Self> {
        let predicate = predicate.trim();
        if predicate.replace(' ', "") == "1=1" {
            return Some(Self::All);
        }

        let upper = predicate.to_ascii_uppercase();
        if upper.ends_with(" IS NOT NULL") {
            let field = predicate[..predicate.len() - " IS NOT NULL".len()].trim();
            return is_field_name(field).then(|| Self::IsNotNull(field.to_string()));
        }
        if upper.ends_with(" IS NULL") {
            let field = predicate[..predicate.len() - " IS NULL".len()].trim();
            return is_field_name(field).then(|| Self::IsNull(field.to_string()));
        }

        let (field, raw) = predicate.split_once('=')?;
        let field = field.trim();
        let raw = raw.trim();
        if !is_field_name(field) {
            return None;
        }
        let value = if let Some(text) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')) {
            serde_json::Value::String(text.replace("''", "'"))
        } else {
            serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .filter(serde_json::Value::is_number)?
        };
        Some(Self::Equals(field.to_string(), value))
    }

    #[must_use]
    pub fn matches(&self, row: &JoinResult) -> bool {
        match self {
            Self::All => true,
            Self::IsNull(field) => !row.has_value(field),
            Self::IsNotNull(field) => row.has_value(field),
            Self::Equals(field, expected) => row.field(field).is_some_and(|actual| {
                match (actual.as_f64(), expected.as_f64()) {
                    (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                    _ => actual == expected,
                }
            }),
        }
    }
}

fn is_field_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// How the target value is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Calculation {
    /// Situs address parts joined by single spaces; a missing house number
    /// renders as `0`.
    SiteFullAddress,
    /// Three owner names joined by four spaces.
    OwnerName,
    /// Four owner address lines joined by three spaces.
    OwnerFullAddress,
    CopyField(String),
    Literal(String),
}

impl Calculation {
    /// Picks the calculation for `target` from the expression text.
    #[must_use]
    pub fn for_target(target: &str, expression: &str) -> Self {
        match target {
            "SiteFullAddress" => Self::SiteFullAddress,
            "OwnerName" => Self::OwnerName,
            "OwnerFullAddress" => Self::OwnerFullAddress,
            _ => {
                let expression = expression.trim();
                if expression.starts_with('!') || expression.ends_with('!') {
                    Self::CopyField(expression.trim_matches('!').to_string())
                } else {
                    Self::Literal(expression.to_string())
                }
            }
        }
    }

    fn evaluate(&self, row: &JoinResult) -> serde_json::Value {
        let text = |field: &str| row.field(field).map(display_text).unwrap_or_default();
        let joined = |fields: &[&str], sep: &str| {
            fields.iter().map(|f| text(f)).collect::<Vec<_>>().join(sep)
        };

        match self {
            Self::SiteFullAddress => {
                let house = row
                    .field(SITUS_FIELDS[0])
                    .filter(|v| !v.is_null())
                    .map_or_else(|| "0".to_string(), display_text);
                let rest = joined(&SITUS_FIELDS[1..], " ");
                serde_json::Value::String(format!("{house} {rest}"))
            }
            Self::OwnerName => serde_json::Value::String(joined(&OWNER_NAME_FIELDS, "    ")),
            Self::OwnerFullAddress => {
                serde_json::Value::String(joined(&OWNER_ADDRESS_FIELDS, "   "))
            }
            Self::CopyField(field) => row.field(field).cloned().unwrap_or_default(),
            Self::Literal(text) => serde_json::Value::String(text.clone()),
        }
    }
}

/// Renders a value the way it appears in a concatenation. Nulls are empty.
fn display_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One row of the fields-to-calculate file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldCalculation {
    /// The predicate as written, for reporting.
    pub predicate: String,
    pub selector: Selector,
    pub field: String,
    pub calculation: Calculation,
}

/// Loads the fields-to-calculate file.
///
/// # Errors
///
/// Returns [`FieldsError`] if the file cannot be read, a row is short, or a
/// predicate is unsupported.
pub fn load_fields_to_calculate(path: &Path) -> Result<Vec<FieldCalculation>, FieldsError> {
    let calculations = parse_fields_to_calculate(open(path)?)?;
    log::info!(
        "Loaded {} field calculations from {}",
        calculations.len(),
        path.display()
    );
    Ok(calculations)
}

/// Parses fields-to-calculate rows. Rows with a blank target are skipped.
///
/// # Errors
///
/// Returns [`FieldsError`] on malformed CSV, a short row, or an unsupported
/// predicate.
pub fn parse_fields_to_calculate(reader: impl Read) -> Result<Vec<FieldCalculation>, FieldsError> {
    let mut calculations = Vec::new();
    for (row, record) in body_records(reader)? {
        let field = record.get(2).map(str::trim).unwrap_or_default();
        if field.is_empty() {
            continue;
        }
        let predicate = record
            .get(0)
            .map(str::trim)
            .ok_or(FieldsError::MissingColumn { row, column: 0 })?;
        let expression = record
            .get(4)
            .ok_or(FieldsError::MissingColumn { row, column: 4 })?;
        let selector =
            Selector::parse(predicate).ok_or_else(|| FieldsError::UnsupportedPredicate {
                row,
                predicate: predicate.to_string(),
            })?;

        calculations.push(FieldCalculation {
            predicate: predicate.to_string(),
            selector,
            field: field.to_string(),
            calculation: Calculation::for_target(field, expression),
        });
    }
    Ok(calculations)
}

/// A literal takes the type of its target: the type listed in `fields`
/// when there is one, otherwise a number if the row already holds a number
/// there.
fn literal_value(
    text: &str,
    field_type: Option<FieldType>,
    current: Option<&serde_json::Value>,
) -> serde_json::Value {
    match field_type {
        Some(field_type) => field_type.coerce_text(text),
        None if current.is_some_and(serde_json::Value::is_number) => parse_number(text)
            .unwrap_or_else(|| serde_json::Value::String(text.to_string())),
        None => serde_json::Value::String(text.to_string()),
    }
}

/// Runs every calculation in order against the rows it selects, writing
/// the result into the row's record attributes. Literals are typed by the
/// matching entry of `fields`. A calculation selecting no rows is reported
/// and skipped. Returns the number of values written.
pub fn calculate_fields(
    rows: &mut [JoinResult],
    calculations: &[FieldCalculation],
    fields: &[FieldDefinition],
    reporter: &dyn Reporter,
) -> usize {
    reporter.report(PipelineEvent::StageStarted {
        stage: Stage::Fields,
    });

    let mut written = 0;
    for calc in calculations {
        let field_type = fields
            .iter()
            .find(|f| f.name == calc.field)
            .map(|f| f.field_type);
        let mut selected = 0;
        for row in rows.iter_mut().filter(|row| calc.selector.matches(row)) {
            let value = match &calc.calculation {
                Calculation::Literal(text) => {
                    literal_value(text, field_type, row.field(&calc.field))
                }
                other => other.evaluate(row),
            };
            row.report.attributes.insert(calc.field.clone(), value);
            selected += 1;
        }
        if selected == 0 {
            reporter.report(PipelineEvent::FieldCalculationSkipped {
                field: calc.field.clone(),
                reason: format!("no records where {}", calc.predicate),
            });
        } else {
            log::debug!("  {}: {selected} records where {}", calc.field, calc.predicate);
        }
        written += selected;
    }

    reporter.report(PipelineEvent::StageFinished {
        stage: Stage::Fields,
        records: written,
    });
    written
}
