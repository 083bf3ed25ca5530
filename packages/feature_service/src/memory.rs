//! In-process [`FeatureService`].
//!
//! Holds records in a `BTreeMap` and answers the small predicate dialect
//! the pipeline issues (`1=1`, comparisons, `IS NULL`, `IS NOT NULL`,
//! joined by `AND`). Queries return at most `max_record_count` records,
//! like a real server.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use async_trait::async_trait;
use damage_assessment_report_models::DamageReport;

use crate::{FeatureService, FeatureServiceError};

/// A layer held in memory.
#[derive(Debug)]
pub struct MemoryFeatureService {
    object_id_field: String,
    max_record_count: u64,
    records: Mutex<BTreeMap<i64, DamageReport>>,
    rejected_updates: BTreeSet<i64>,
}

impl MemoryFeatureService {
    #[must_use]
    pub fn new(records: Vec<DamageReport>, max_record_count: u64) -> Self {
        Self {
            object_id_field: "OBJECTID".to_string(),
            max_record_count,
            records: Mutex::new(records.into_iter().map(|r| (r.object_id, r)).collect()),
            rejected_updates: BTreeSet::new(),
        }
    }

    /// Makes updates to these object ids report failure.
    #[must_use]
    pub fn rejecting_updates(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.rejected_updates.extend(ids);
        self
    }

    /// Returns a copy of the record with this id.
    #[must_use]
    pub fn record(&self, object_id: i64) -> Option<DamageReport> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(&object_id).cloned())
    }

    fn matching(&self, where_clause: &str) -> Result<Vec<DamageReport>, FeatureServiceError> {
        let predicate = Predicate::parse(where_clause)?;
        let records = self.records.lock().map_err(|_| FeatureServiceError::Protocol {
            message: "record store poisoned".to_string(),
        })?;
        Ok(records
            .values()
            .filter(|r| predicate.matches(r, &self.object_id_field))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FeatureService for MemoryFeatureService {
    fn object_id_field(&self) -> &str {
        &self.object_id_field
    }

    async fn list_ids(&self, where_clause: &str) -> Result<Vec<i64>, FeatureServiceError> {
        Ok(self
            .matching(where_clause)?
            .iter()
            .map(|r| r.object_id)
            .collect())
    }

    async fn page_size(&self) -> Result<u64, FeatureServiceError> {
        Ok(self.max_record_count)
    }

    async fn query(
        &self,
        where_clause: &str,
        _out_fields: &str,
    ) -> Result<Vec<DamageReport>, FeatureServiceError> {
        let cap = usize::try_from(self.max_record_count).unwrap_or(usize::MAX);
        let mut records = self.matching(where_clause)?;
        records.truncate(cap);
        Ok(records)
    }

    async fn update(
        &self,
        object_id: i64,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<bool, FeatureServiceError> {
        if self.rejected_updates.contains(&object_id) {
            return Ok(false);
        }
        let mut records = self.records.lock().map_err(|_| FeatureServiceError::Protocol {
            message: "record store poisoned".to_string(),
        })?;
        let Some(record) = records.get_mut(&object_id) else {
            return Ok(false);
        };
        record.attributes.insert(field.to_string(), value.clone());
        drop(records);
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    All,
    IsNull(String),
    IsNotNull(String),
    Compare {
        field: String,
        op: Op,
        value: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ge,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
struct Predicate(Vec<Clause>);

impl Predicate {
    fn parse(where_clause: &str) -> Result<Self, FeatureServiceError> {
        where_clause
            .split(" AND ")
            .map(|part| parse_clause(part.trim()))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    fn matches(&self, record: &DamageReport, object_id_field: &str) -> bool {
        self.0.iter().all(|clause| {
            let lookup = |field: &str| {
                if field == object_id_field {
                    Some(serde_json::Value::from(record.object_id))
                } else {
                    record.attributes.get(field).cloned()
                }
            };
            match clause {
                Clause::All => true,
                Clause::IsNull(field) => lookup(field).is_none_or(|v| v.is_null()),
                Clause::IsNotNull(field) => lookup(field).is_some_and(|v| !v.is_null()),
                Clause::Compare { field, op, value } => {
                    lookup(field).is_some_and(|actual| compare(&actual, *op, value))
                }
            }
        })
    }
}

fn parse_clause(part: &str) -> Result<Clause, FeatureServiceError> {
    let unsupported = || FeatureServiceError::Service {
        code: Some(400),
        message: format!("unsupported where clause: {part}"),
    };

    if part.replace(' ', "") == "1=1" {
        return Ok(Clause::All);
    }
    if let Some(field) = part.strip_suffix(" IS NOT NULL") {
        return Ok(Clause::IsNotNull(field.trim().to_string()));
    }
    if let Some(field) = part.strip_suffix(" IS NULL") {
        return Ok(Clause::IsNull(field.trim().to_string()));
    }

    for (token, op) in [(">=", Op::Ge), ("<=", Op::Le), ("=", Op::Eq)] {
        if let Some((field, raw)) = part.split_once(token) {
            let raw = raw.trim();
            let value = if let Some(text) = raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\''))
            {
                serde_json::Value::String(text.replace("''", "'"))
            } else {
                serde_json::from_str::<serde_json::Value>(raw)
                    .ok()
                    .filter(serde_json::Value::is_number)
                    .ok_or_else(unsupported)?
            };
            return Ok(Clause::Compare {
                field: field.trim().to_string(),
                op,
                value,
            });
        }
    }

    Err(unsupported())
}

fn compare(actual: &serde_json::Value, op: Op, expected: &serde_json::Value) -> bool {
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return match op {
            Op::Eq => (a - b).abs() < f64::EPSILON,
            Op::Ge => a >= b,
            Op::Le => a <= b,
        };
    }
    match (actual.as_str(), expected.as_str()) {
        (Some(a), Some(b)) => match op {
            Op::Eq => a == b,
            Op::Ge => a >= b,
            Op::Le => a <= b,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: i64, attrs: serde_json::Value) -> DamageReport {
        DamageReport {
            object_id: id,
            geometry: None,
            attributes: attrs
                .as_object()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn service() -> MemoryFeatureService {
        MemoryFeatureService::new(
            vec![
                report(1, serde_json::json!({ "ReportNumber": "DA-1", "Quantity": null })),
                report(2, serde_json::json!({ "ReportNumber": "O'NEIL", "Quantity": 2 })),
                report(5, serde_json::json!({ "ReportNumber": "DA-5" })),
            ],
            2,
        )
    }

    #[tokio::test]
    async fn evaluates_pipeline_predicates() {
        let service = service();
        assert_eq!(service.list_ids("1=1").await.unwrap(), vec![1, 2, 5]);
        assert_eq!(
            service.list_ids("OBJECTID >= 2 AND OBJECTID <= 5").await.unwrap(),
            vec![2, 5]
        );
        assert_eq!(service.list_ids("Quantity IS NULL").await.unwrap(), vec![1, 5]);
        assert_eq!(
            service.list_ids("ReportNumber = 'O''NEIL'").await.unwrap(),
            vec![2]
        );
    }

    #[tokio::test]
    async fn query_is_capped_at_max_record_count() {
        assert_eq!(service().query("1=1", "*").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_predicates_are_service_errors() {
        let err = service().list_ids("Quantity LIKE '%'").await.unwrap_err();
        assert!(matches!(err, FeatureServiceError::Service { .. }));
    }

    #[tokio::test]
    async fn update_writes_attribute() {
        let service = service().rejecting_updates([5]);
        assert!(service.update(1, "Quantity", &serde_json::json!(1)).await.unwrap());
        assert_eq!(service.record(1).unwrap().attributes["Quantity"], 1);
        assert!(!service.update(5, "Quantity", &serde_json::json!(1)).await.unwrap());
        assert!(!service.update(99, "Quantity", &serde_json::json!(1)).await.unwrap());
    }
}
