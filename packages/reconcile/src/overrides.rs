//! Operator override table.
//!
//! A CSV file maintained by damage-assessment staff: a fixed block of
//! instruction rows at the top, then `report number, APN` rows naming the
//! parcel a stacked report should be attributed to.

use std::{io::Read, path::Path};

use damage_assessment_report_models::OverridePair;

/// Instruction rows at the top of the stock override file.
pub const DEFAULT_HEADER_ROWS: usize = 8;

/// Errors that can occur while loading the override table.
#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
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
}

/// Override pairs in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideTable {
    pairs: Vec<OverridePair>,
}

impl OverrideTable {
    #[must_use]
    pub const fn new(pairs: Vec<OverridePair>) -> Self {
        Self { pairs }
    }

    /// Loads the table from a CSV file, skipping the first `header_rows`
    /// rows.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError`] if the file cannot be opened or parsed.
    pub fn from_path(path: &Path, header_rows: usize) -> Result<Self, OverrideError> {
        let file = std::fs::File::open(path).map_err(|source| OverrideError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::from_reader(file, header_rows)?;
        log::info!(
            "Loaded {} override pairs from {}",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    /// Parses override rows from any reader. The first `header_rows`
    /// physical lines are skipped, blank ones included. Rows missing either
    /// value are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::Csv`] if the input is not valid CSV.
    pub fn from_reader(reader: impl Read, header_rows: usize) -> Result<Self, OverrideError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut pairs = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            if record
                .position()
                .is_some_and(|p| p.line() <= header_rows as u64)
            {
                continue;
            }
            let report_number = record.get(0).map(str::trim).unwrap_or_default();
            let apn = record.get(1).map(str::trim).unwrap_or_default();
            if report_number.is_empty() || apn.is_empty() {
                log::trace!("  skipping incomplete override row: {record:?}");
                continue;
            }
            pairs.push(OverridePair {
                report_number: report_number.to_string(),
                apn: apn.to_string(),
            });
        }

        Ok(Self { pairs })
    }

    #[must_use]
    pub fn pairs(&self) -> &[OverridePair] {
        &self.pairs
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Distinct APNs listed for `report_number`, in file order.
    #[must_use]
    pub fn apns_for(&self, report_number: &str) -> Vec<&str> {
        let mut apns: Vec<&str> = Vec::new();
        for pair in self.pairs.iter().filter(|p| p.report_number == report_number) {
            if !apns.contains(&pair.apn.as_str()) {
                apns.push(&pair.apn);
            }
        }
        apns
    }

    /// Report numbers listed with more than one distinct APN, each with its
    /// APNs in file order.
    #[must_use]
    pub fn conflicts(&self) -> Vec<(&str, Vec<&str>)> {
        let mut seen: Vec<&str> = Vec::new();
        let mut conflicts = Vec::new();
        for pair in &self.pairs {
            if seen.contains(&pair.report_number.as_str()) {
                continue;
            }
            seen.push(&pair.report_number);
            let apns = self.apns_for(&pair.report_number);
            if apns.len() > 1 {
                conflicts.push((pair.report_number.as_str(), apns));
            }
        }
        conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "\
Stacked parcel override list,,
Add one row per report number,,
,,
Do not edit rows 1-8,,
,,
,,
,,
ReportNumber,APN,Notes
DA-100, 2 ,condo unit
DA-300,7,
,9,
DA-100,1,
";

    #[test]
    fn skips_header_block_and_trims() {
        let table = OverrideTable::from_reader(FILE.as_bytes(), DEFAULT_HEADER_ROWS).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.pairs()[0],
            OverridePair {
                report_number: "DA-100".to_string(),
                apn: "2".to_string(),
            }
        );
    }

    #[test]
    fn blank_instruction_lines_count_toward_header() {
        let file = "Stacked parcel override list,\nAdd one row per report number,\n\n\
                    Do not edit rows 1-8,\n\n\n\nReportNumber,APN\nDA-100,2\nDA-300,7\n";
        let table = OverrideTable::from_reader(file.as_bytes(), DEFAULT_HEADER_ROWS).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.apns_for("DA-100"), vec!["2"]);
        assert_eq!(table.apns_for("DA-300"), vec!["7"]);
    }

    #[test]
    fn apns_keep_file_order() {
        let table = OverrideTable::from_reader(FILE.as_bytes(), DEFAULT_HEADER_ROWS).unwrap();
        assert_eq!(table.apns_for("DA-100"), vec!["2", "1"]);
        assert!(table.apns_for("DA-999").is_empty());
    }

    #[test]
    fn reports_conflicting_report_numbers() {
        let table = OverrideTable::from_reader(FILE.as_bytes(), DEFAULT_HEADER_ROWS).unwrap();
        assert_eq!(table.conflicts(), vec![("DA-100", vec!["2", "1"])]);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let path = std::env::temp_dir().join("damage_assessment_missing_overrides.csv");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(
            OverrideTable::from_path(&path, DEFAULT_HEADER_ROWS),
            Err(OverrideError::Io { .. })
        ));
    }
}
