//! Write-back of derived values to the remote layer.
//!
//! Two corrections are pushed after a successful commit:
//!
//! 1. Every remote record whose `Quantity` is null gets `Quantity = 1`.
//! 2. Every reconciled row with an `EstimatedReplacementCost` pushes that
//!    value to the remote record with the same report number, provided
//!    exactly one remote record carries that number.
//!
//! Individual update failures are counted and reported; they do not fail
//! the run.

use damage_assessment_report_models::{
    CancellationFlag, ESTIMATED_REPLACEMENT_COST_FIELD, JoinResult, PipelineEvent,
    QUANTITY_FIELD, REPORT_NUMBER_FIELD, Reporter, Stage,
};
use serde::{Deserialize, Serialize};

use crate::{FeatureService, FeatureServiceError, quote_literal};

/// Outcome counts of [`sync_fields`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSyncSummary {
    pub quantity_defaulted: usize,
    pub cost_updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Pushes the quantity default and replacement costs back to the service.
///
/// # Errors
///
/// Returns [`FeatureServiceError`] if the null-quantity id list cannot be
/// read or the run is cancelled. Per-record failures are only counted.
pub async fn sync_fields(
    service: &dyn FeatureService,
    reconciled: &[JoinResult],
    reporter: &dyn Reporter,
    cancel: &CancellationFlag,
) -> Result<FieldSyncSummary, FeatureServiceError> {
    reporter.report(PipelineEvent::StageStarted {
        stage: Stage::FieldSync,
    });
    let mut summary = FieldSyncSummary::default();

    let null_quantity = service
        .list_ids(&format!("{QUANTITY_FIELD} IS NULL"))
        .await?;
    let one = serde_json::Value::from(1);
    for object_id in null_quantity {
        cancel.check()?;
        if push(service, object_id, QUANTITY_FIELD, &one, reporter).await? {
            summary.quantity_defaulted += 1;
        } else {
            summary.failed += 1;
        }
    }

    for row in reconciled {
        cancel.check()?;
        let Some(cost) = row
            .report
            .attributes
            .get(ESTIMATED_REPLACEMENT_COST_FIELD)
            .filter(|v| !v.is_null())
        else {
            continue;
        };
        let Some(report_number) = row.report.report_number() else {
            continue;
        };

        let where_clause = format!("{REPORT_NUMBER_FIELD} = {}", quote_literal(&report_number));
        let ids = match service.list_ids(&where_clause).await {
            Ok(ids) => ids,
            Err(FeatureServiceError::Cancelled(c)) => return Err(c.into()),
            Err(e) => {
                reporter.report(PipelineEvent::FieldSyncSkipped {
                    report_number,
                    reason: format!("lookup failed: {e}"),
                });
                summary.failed += 1;
                continue;
            }
        };

        let [object_id] = ids[..] else {
            reporter.report(PipelineEvent::FieldSyncSkipped {
                report_number,
                reason: format!("{} remote records match", ids.len()),
            });
            summary.skipped += 1;
            continue;
        };

        if push(
            service,
            object_id,
            ESTIMATED_REPLACEMENT_COST_FIELD,
            cost,
            reporter,
        )
        .await?
        {
            summary.cost_updated += 1;
        } else {
            summary.failed += 1;
        }
    }

    log::info!(
        "Field sync: {} quantities defaulted, {} costs updated, {} skipped, {} failed",
        summary.quantity_defaulted,
        summary.cost_updated,
        summary.skipped,
        summary.failed,
    );
    reporter.report(PipelineEvent::StageFinished {
        stage: Stage::FieldSync,
        records: summary.quantity_defaulted + summary.cost_updated,
    });
    Ok(summary)
}

/// Sends one update. Returns `Ok(false)` for a reported failure; only
/// cancellation is propagated.
async fn push(
    service: &dyn FeatureService,
    object_id: i64,
    field: &str,
    value: &serde_json::Value,
    reporter: &dyn Reporter,
) -> Result<bool, FeatureServiceError> {
    let reason = match service.update(object_id, field, value).await {
        Ok(true) => return Ok(true),
        Ok(false) => "service reported failure".to_string(),
        Err(FeatureServiceError::Cancelled(c)) => return Err(c.into()),
        Err(e) => e.to_string(),
    };
    reporter.report(PipelineEvent::FieldSyncFailed {
        object_id,
        field: field.to_string(),
        reason,
    });
    Ok(false)
}
