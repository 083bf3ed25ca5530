//! Complete retrieval of a remote layer.
//!
//! Servers cap how many records one query returns, and offset paging is
//! unreliable on layers that change while being read. Instead the extractor
//! lists every object id, then walks the id space from the smallest to the
//! largest id in windows one page wide, so no window can hold more records
//! than the server will return. Gaps in the id space just produce empty
//! windows.
//!
//! Windows are fetched concurrently (bounded by
//! [`ExtractOptions::workers`]) and merged by a single writer keyed on
//! object id, so the output is sorted by id and never holds a record twice.

use std::collections::BTreeMap;

use damage_assessment_report_models::{
    CancellationFlag, DamageReport, PipelineEvent, Reporter, Stage,
};
use futures::{StreamExt as _, stream};

use crate::{ALL_RECORDS, FeatureService, FeatureServiceError, progress::ProgressCallback};

/// Tuning for [`extract_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Maximum number of page queries in flight.
    pub workers: usize,
    /// Use this page size instead of asking the service.
    pub page_size_override: Option<u64>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            page_size_override: None,
        }
    }
}

/// Splits `min..=max` into consecutive inclusive windows of `page_size`
/// ids. The last window may extend past `max`. Windows are produced on
/// demand, so a sparse id space costs nothing up front.
pub fn id_ranges(min: i64, max: i64, page_size: u64) -> impl Iterator<Item = (i64, i64)> {
    let width = i64::try_from(page_size.max(1)).unwrap_or(i64::MAX);
    let window = move |lo: i64| (lo, lo.saturating_add(width - 1));
    std::iter::successors((min <= max).then(|| window(min)), move |&(_, hi)| {
        (hi < max).then(|| window(hi + 1))
    })
}

/// Number of windows [`id_ranges`] yields for the same arguments.
#[must_use]
pub fn id_range_count(min: i64, max: i64, page_size: u64) -> u64 {
    if min > max {
        return 0;
    }
    let span = i128::from(max) - i128::from(min);
    u64::try_from(span / i128::from(page_size.max(1)) + 1).unwrap_or(u64::MAX)
}

/// Fetches every record of the layer exactly once.
///
/// An empty layer is reported as [`PipelineEvent::EmptyDataset`] and
/// yields an empty vector. If the merged record count differs from the
/// number of listed ids (records deleted mid-run, or a server capping below
/// the page size) a [`PipelineEvent::CountMismatch`] is reported.
///
/// # Errors
///
/// Returns [`FeatureServiceError`] if the id list or page size cannot be
/// read, a page fails after retries, or `cancel` is raised between pages.
pub async fn extract_all(
    service: &dyn FeatureService,
    options: &ExtractOptions,
    reporter: &dyn Reporter,
    progress: &dyn ProgressCallback,
    cancel: &CancellationFlag,
) -> Result<Vec<DamageReport>, FeatureServiceError> {
    reporter.report(PipelineEvent::StageStarted {
        stage: Stage::Extract,
    });
    cancel.check()?;

    let mut ids = service.list_ids(ALL_RECORDS).await?;
    ids.sort_unstable();
    ids.dedup();

    let (Some(&min), Some(&max)) = (ids.first(), ids.last()) else {
        reporter.report(PipelineEvent::EmptyDataset);
        reporter.report(PipelineEvent::StageFinished {
            stage: Stage::Extract,
            records: 0,
        });
        return Ok(Vec::new());
    };

    let page_size = match options.page_size_override {
        Some(size) => size,
        None => service.page_size().await?,
    }
    .max(1);

    let page_count = id_range_count(min, max, page_size);
    log::info!(
        "Extracting {} records (ids {min}..={max}) in {page_count} pages of {page_size}",
        ids.len(),
    );
    progress.set_total(page_count);
    progress.set_message("downloading".to_string());

    let id_field = service.object_id_field().to_string();
    let mut pages = stream::iter(id_ranges(min, max, page_size))
        .map(|(lo, hi)| {
            let id_field = id_field.as_str();
            async move {
                cancel.check()?;
                let where_clause = format!("{id_field} >= {lo} AND {id_field} <= {hi}");
                let records = service.query(&where_clause, "*").await?;
                Ok::<_, FeatureServiceError>((lo, hi, records))
            }
        })
        .buffer_unordered(options.workers.max(1));

    let mut by_id: BTreeMap<i64, DamageReport> = BTreeMap::new();
    while let Some(page) = pages.next().await {
        let (lo, hi, records) = page?;
        reporter.report(PipelineEvent::PageFetched {
            lo,
            hi,
            records: records.len(),
        });
        for record in records {
            if (lo..=hi).contains(&record.object_id) {
                by_id.entry(record.object_id).or_insert(record);
            } else {
                log::debug!(
                    "Dropping record {} returned outside window {lo}..={hi}",
                    record.object_id
                );
            }
        }
        progress.inc(1);
    }
    drop(pages);

    if by_id.len() != ids.len() {
        reporter.report(PipelineEvent::CountMismatch {
            expected: ids.len(),
            fetched: by_id.len(),
        });
    }
    progress.finish(format!("{} records", by_id.len()));
    reporter.report(PipelineEvent::StageFinished {
        stage: Stage::Extract,
        records: by_id.len(),
    });

    Ok(by_id.into_values().collect())
}

#[cfg(test)]
mod tests {
    use damage_assessment_report_models::{MemoryReporter, REPORT_NUMBER_FIELD, ReportPoint};

    use super::*;
    use crate::{memory::MemoryFeatureService, progress::NullProgress};

    const PAGE: u64 = 5;

    fn records(ids: impl IntoIterator<Item = i64>) -> Vec<DamageReport> {
        ids.into_iter()
            .map(|id| DamageReport {
                object_id: id,
                geometry: Some(ReportPoint::new(0.0, 0.0)),
                attributes: [
                    ("OBJECTID".to_string(), serde_json::json!(id)),
                    (
                        REPORT_NUMBER_FIELD.to_string(),
                        serde_json::json!(format!("DA-{id}")),
                    ),
                ]
                .into_iter()
                .collect(),
            })
            .collect()
    }

    async fn extract(service: &MemoryFeatureService, reporter: &MemoryReporter) -> Vec<i64> {
        extract_all(
            service,
            &ExtractOptions::default(),
            reporter,
            &NullProgress,
            &CancellationFlag::new(),
        )
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.object_id)
        .collect()
    }

    #[test]
    fn id_ranges_cover_min_to_max() {
        let windows = |min, max, size| id_ranges(min, max, size).collect::<Vec<_>>();
        assert_eq!(windows(1, 10, 5), vec![(1, 5), (6, 10)]);
        assert_eq!(windows(1, 11, 5), vec![(1, 5), (6, 10), (11, 15)]);
        assert_eq!(windows(7, 7, 1000), vec![(7, 1006)]);
        assert_eq!(windows(9, 3, 5), vec![]);
        for (min, max, size) in [(1, 10, 5), (1, 11, 5), (7, 7, 1000), (9, 3, 5)] {
            assert_eq!(id_range_count(min, max, size), windows(min, max, size).len() as u64);
        }
    }

    #[test]
    fn sparse_id_space_is_windowed_lazily() {
        let mut windows = id_ranges(1, i64::MAX, 1000);
        assert_eq!(windows.next(), Some((1, 1000)));
        assert_eq!(windows.next(), Some((1001, 2000)));
        assert_eq!(id_range_count(1, i64::MAX, 1000), 9_223_372_036_854_776);
        assert_eq!(id_ranges(i64::MAX - 1, i64::MAX, 1000).last(), Some((i64::MAX - 1, i64::MAX)));
    }

    #[tokio::test]
    async fn retrieves_every_record_for_boundary_counts() {
        let p = i64::try_from(PAGE).unwrap();
        for n in [1, p - 1, p, p + 1, 10 * p + 3] {
            let service = MemoryFeatureService::new(records(1..=n), PAGE);
            let reporter = MemoryReporter::new();
            let ids = extract(&service, &reporter).await;
            assert_eq!(ids, (1..=n).collect::<Vec<_>>(), "n = {n}");
            assert!(
                !reporter
                    .events()
                    .iter()
                    .any(|e| matches!(e, PipelineEvent::CountMismatch { .. })),
                "n = {n}"
            );
        }
    }

    #[tokio::test]
    async fn empty_layer_is_not_an_error() {
        let service = MemoryFeatureService::new(Vec::new(), PAGE);
        let reporter = MemoryReporter::new();
        let ids = extract(&service, &reporter).await;
        assert!(ids.is_empty());
        assert!(reporter.events().contains(&PipelineEvent::EmptyDataset));
    }

    #[tokio::test]
    async fn sparse_ids_are_retrieved() {
        let sparse: Vec<i64> = vec![3, 4, 40, 41, 42, 43, 44, 45, 46, 400, 9_000];
        let service = MemoryFeatureService::new(records(sparse.clone()), PAGE);
        let reporter = MemoryReporter::new();
        assert_eq!(extract(&service, &reporter).await, sparse);
    }

    #[tokio::test]
    async fn extraction_is_idempotent() {
        let service = MemoryFeatureService::new(records((1..=23).map(|i| i * 3)), PAGE);
        let first = extract_all(
            &service,
            &ExtractOptions::default(),
            &MemoryReporter::new(),
            &NullProgress,
            &CancellationFlag::new(),
        )
        .await
        .unwrap();
        let second = extract_all(
            &service,
            &ExtractOptions {
                workers: 1,
                page_size_override: None,
            },
            &MemoryReporter::new(),
            &NullProgress,
            &CancellationFlag::new(),
        )
        .await
        .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn oversized_page_override_is_detected_as_count_mismatch() {
        let service = MemoryFeatureService::new(records(1..=12), PAGE);
        let reporter = MemoryReporter::new();
        let fetched = extract_all(
            &service,
            &ExtractOptions {
                workers: 2,
                page_size_override: Some(100),
            },
            &reporter,
            &NullProgress,
            &CancellationFlag::new(),
        )
        .await
        .unwrap();
        assert_eq!(fetched.len(), 5);
        assert!(reporter.events().contains(&PipelineEvent::CountMismatch {
            expected: 12,
            fetched: 5,
        }));
    }

    #[tokio::test]
    async fn cancelled_extraction_stops() {
        let service = MemoryFeatureService::new(records(1..=20), PAGE);
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let result = extract_all(
            &service,
            &ExtractOptions::default(),
            &MemoryReporter::new(),
            &NullProgress,
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(FeatureServiceError::Cancelled(_))));
    }
}
