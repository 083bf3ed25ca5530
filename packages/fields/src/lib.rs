#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Output field control files.
//!
//! Two operator-maintained CSV files shape the reconciled dataset before it
//! is committed: one lists fields to add (name, type, length), the other
//! lists calculations to run over selected rows. See [`calculate`] for the
//! calculation dialect.

pub mod calculate;

use std::{io::Read, path::Path};

use damage_assessment_report_models::JoinResult;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

pub use calculate::{
    Calculation, FieldCalculation, Selector, calculate_fields, load_fields_to_calculate,
};

/// Instruction rows at the top of both control files.
pub const CONTROL_HEADER_ROWS: usize = 2;

/// Errors that can occur while reading control files.
#[derive(Debug, thiserror::Error)]
pub enum FieldsError {
    /// The file could not be read.
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// CSV parsing failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A selection predicate is outside the supported dialect. `row` is
    /// the file line.
    #[error("Unsupported selection predicate on line {row}: {predicate}")]
    UnsupportedPredicate { row: usize, predicate: String },

    /// A field type is not one of the known types.
    #[error("Unknown type {value:?} for field {field}")]
    UnknownFieldType { field: String, value: String },

    /// A required column is missing.
    #[error("Line {row} has no column {column}")]
    MissingColumn { row: usize, column: usize },
}

/// Storage type of an added field.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Text,
    Short,
    Long,
    Float,
    Double,
    Date,
}

impl FieldType {
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Short | Self::Long | Self::Float | Self::Double)
    }

    /// Converts literal text to a value of this type. Numeric text for a
    /// numeric type becomes a JSON number; anything else stays text.
    #[must_use]
    pub fn coerce_text(self, text: &str) -> serde_json::Value {
        if self.is_numeric()
            && let Some(number) = parse_number(text)
        {
            return number;
        }
        if self.is_numeric() {
            log::warn!("{text:?} is not a {self} value; writing it as text");
        }
        serde_json::Value::String(text.to_string())
    }
}

/// Parses an integer or a finite float.
#[must_use]
pub fn parse_number(text: &str) -> Option<serde_json::Value> {
    let text = text.trim();
    text.parse::<i64>().map(serde_json::Value::from).ok().or_else(|| {
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
    })
}

/// One row of the fields-to-add file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    /// Maximum length for text fields.
    pub length: Option<u32>,
}

fn open(path: &Path) -> Result<std::fs::File, FieldsError> {
    std::fs::File::open(path).map_err(|source| FieldsError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Reads every record below the [`CONTROL_HEADER_ROWS`] instruction lines,
/// paired with its 1-based line number. Blank lines count toward the
/// instruction block even though they yield no record.
fn body_records(reader: impl Read) -> Result<Vec<(usize, csv::StringRecord)>, FieldsError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut records = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        let line = record
            .position()
            .and_then(|p| usize::try_from(p.line()).ok())
            .unwrap_or(usize::MAX);
        if line > CONTROL_HEADER_ROWS {
            records.push((line, record));
        }
    }
    Ok(records)
}

/// Loads the fields-to-add file.
///
/// # Errors
///
/// Returns [`FieldsError`] if the file cannot be read or a row names an
/// unknown type.
pub fn load_fields_to_add(path: &Path) -> Result<Vec<FieldDefinition>, FieldsError> {
    let fields = parse_fields_to_add(open(path)?)?;
    log::info!("Loaded {} fields to add from {}", fields.len(), path.display());
    Ok(fields)
}

/// Parses fields-to-add rows: `name, type, length`, after
/// [`CONTROL_HEADER_ROWS`] instruction rows. Blank names are skipped.
///
/// # Errors
///
/// Returns [`FieldsError`] on malformed CSV or an unknown type.
pub fn parse_fields_to_add(reader: impl Read) -> Result<Vec<FieldDefinition>, FieldsError> {
    let mut fields = Vec::new();
    for (line, record) in body_records(reader)? {
        let name = record.get(0).map(str::trim).unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        let type_text = record.get(1).map(str::trim).ok_or(FieldsError::MissingColumn {
            row: line,
            column: 1,
        })?;
        let field_type =
            type_text
                .parse::<FieldType>()
                .map_err(|_| FieldsError::UnknownFieldType {
                    field: name.to_string(),
                    value: type_text.to_string(),
                })?;
        let length = record
            .get(2)
            .map(str::trim)
            .and_then(|l| l.parse::<u32>().ok());

        fields.push(FieldDefinition {
            name: name.to_string(),
            field_type,
            length,
        });
    }
    Ok(fields)
}

/// Adds each field, as null, to every row that does not already carry it.
/// Returns the number of (row, field) insertions.
pub fn add_fields(rows: &mut [JoinResult], fields: &[FieldDefinition]) -> usize {
    let mut added = 0;
    for row in rows.iter_mut() {
        for field in fields {
            if row.field(&field.name).is_none() {
                row.report
                    .attributes
                    .insert(field.name.clone(), serde_json::Value::Null);
                added += 1;
            }
        }
    }
    log::info!("Added {} fields ({added} values initialised)", fields.len());
    added
}

#[cfg(test)]
mod tests {
    use damage_assessment_report_models::{Attributes, DamageReport, ResolutionTag};

    use super::*;

    const ADD_FILE: &str = "\
Fields to add to the processed data,,
Name,Type,Length
SiteFullAddress,TEXT,200
OwnerName,text,
Damage_Pct,Double,
,,
";

    #[test]
    fn parses_definitions_after_instruction_rows() {
        let fields = parse_fields_to_add(ADD_FILE.as_bytes()).unwrap();
        assert_eq!(
            fields,
            vec![
                FieldDefinition {
                    name: "SiteFullAddress".to_string(),
                    field_type: FieldType::Text,
                    length: Some(200),
                },
                FieldDefinition {
                    name: "OwnerName".to_string(),
                    field_type: FieldType::Text,
                    length: None,
                },
                FieldDefinition {
                    name: "Damage_Pct".to_string(),
                    field_type: FieldType::Double,
                    length: None,
                },
            ]
        );
    }

    #[test]
    fn blank_instruction_lines_count_toward_header() {
        let file = "Fields to add to the processed data,,\n\nNotes,TEXT,255\n";
        let fields = parse_fields_to_add(file.as_bytes()).unwrap();
        assert_eq!(
            fields,
            vec![FieldDefinition {
                name: "Notes".to_string(),
                field_type: FieldType::Text,
                length: Some(255),
            }]
        );
    }

    #[test]
    fn unknown_types_are_rejected() {
        let file = "a,,\nb,,\nColour,BLOB,\n";
        assert!(matches!(
            parse_fields_to_add(file.as_bytes()),
            Err(FieldsError::UnknownFieldType { .. })
        ));
    }

    #[test]
    fn numeric_types_coerce_literals() {
        assert_eq!(FieldType::Double.coerce_text("125000"), serde_json::json!(125_000));
        assert_eq!(FieldType::Float.coerce_text(" 12.5 "), serde_json::json!(12.5));
        assert_eq!(FieldType::Long.coerce_text("n/a"), serde_json::json!("n/a"));
        assert_eq!(FieldType::Text.coerce_text("92101"), serde_json::json!("92101"));
    }

    #[test]
    fn add_fields_only_fills_missing() {
        let mut attributes = Attributes::new();
        attributes.insert("OwnerName".to_string(), serde_json::json!("SMITH"));
        let mut rows = vec![JoinResult {
            report: DamageReport {
                object_id: 1,
                geometry: None,
                attributes,
            },
            parcel: None,
            join_order: 0,
            tag: ResolutionTag::Keep,
        }];
        let fields = parse_fields_to_add(ADD_FILE.as_bytes()).unwrap();

        assert_eq!(add_fields(&mut rows, &fields), 2);
        assert_eq!(rows[0].report.attributes["OwnerName"], "SMITH");
        assert!(rows[0].report.attributes["SiteFullAddress"].is_null());
    }
}
