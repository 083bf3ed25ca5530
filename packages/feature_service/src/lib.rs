#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Remote feature-service access.
//!
//! The [`FeatureService`] trait is the narrow query protocol the pipeline
//! needs from the hosted survey layer: list ids, discover the page size,
//! query by predicate, and update a single attribute. [`arcgis`] implements
//! it against an `ArcGIS` REST `FeatureServer`; [`memory`] implements it
//! in-process for tests and dry runs.
//!
//! On top of the trait sit [`extract::extract_all`], which pulls every
//! record regardless of the server's per-request cap, and
//! [`field_sync::sync_fields`], which pushes derived values back.

pub mod arcgis;
pub mod extract;
pub mod field_sync;
pub mod memory;
pub mod progress;
pub mod retry;
pub mod token;

use async_trait::async_trait;
use damage_assessment_report_models::{Cancelled, DamageReport};

/// Predicate selecting every record.
pub const ALL_RECORDS: &str = "1=1";

/// `ArcGIS` error code for an invalid token.
pub const INVALID_TOKEN_CODE: i64 = 498;

/// `ArcGIS` error code for a missing or expired token.
pub const TOKEN_REQUIRED_CODE: i64 = 499;

/// Errors that can occur while talking to the feature service.
#[derive(Debug, thiserror::Error)]
pub enum FeatureServiceError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// The service answered with an error payload.
    #[error("Feature service error (code {code:?}): {message}")]
    Service {
        /// `ArcGIS` error code, when present.
        code: Option<i64>,
        /// Server message plus any details.
        message: String,
    },

    /// Token acquisition failed.
    #[error("Authentication failed: {message}")]
    Auth {
        /// Description of what went wrong.
        message: String,
    },

    /// The response did not have the expected shape, or the request was
    /// rejected outright.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of what went wrong.
        message: String,
    },

    /// The run was cancelled.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl FeatureServiceError {
    /// Returns `true` for token errors that a fresh token may fix.
    #[must_use]
    pub const fn is_token_error(&self) -> bool {
        matches!(
            self,
            Self::Service {
                code: Some(INVALID_TOKEN_CODE | TOKEN_REQUIRED_CODE),
                ..
            }
        )
    }

    /// Returns `true` for `ArcGIS` error bodies reporting a server-side
    /// failure that may clear on its own.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Service {
                code: Some(500 | 502 | 503 | 504),
                ..
            }
        )
    }
}

/// The remote query protocol.
///
/// Implementations must be safe to call concurrently; the extractor issues
/// several [`query`](FeatureService::query) calls at once.
#[async_trait]
pub trait FeatureService: Send + Sync {
    /// Name of the stable integer id field (usually `"OBJECTID"`).
    fn object_id_field(&self) -> &str;

    /// Lists the ids of every record matching `where_clause`, in no
    /// particular order.
    ///
    /// # Errors
    ///
    /// Returns [`FeatureServiceError`] if the id list is unavailable.
    async fn list_ids(&self, where_clause: &str) -> Result<Vec<i64>, FeatureServiceError>;

    /// Maximum number of records the server returns per query.
    ///
    /// # Errors
    ///
    /// Returns [`FeatureServiceError`] if the service metadata cannot be
    /// read.
    async fn page_size(&self) -> Result<u64, FeatureServiceError>;

    /// Returns the records matching `where_clause`, with `out_fields`
    /// (`"*"` for all).
    ///
    /// # Errors
    ///
    /// Returns [`FeatureServiceError`] if the query fails.
    async fn query(
        &self,
        where_clause: &str,
        out_fields: &str,
    ) -> Result<Vec<DamageReport>, FeatureServiceError>;

    /// Sets `field` to `value` on one record. Returns the server's success
    /// flag.
    ///
    /// # Errors
    ///
    /// Returns [`FeatureServiceError`] if the request itself fails.
    async fn update(
        &self,
        object_id: i64,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<bool, FeatureServiceError>;
}

/// Quotes a string literal for use in a `where` clause.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Converts an `{"error": {...}}` response body into
/// [`FeatureServiceError::Service`].
///
/// `ArcGIS` reports most failures with HTTP 200 and an error object in the
/// body.
///
/// # Errors
///
/// Returns [`FeatureServiceError::Service`] if the body carries an error.
pub fn check_service_error(body: &serde_json::Value) -> Result<(), FeatureServiceError> {
    let Some(error) = body.get("error") else {
        return Ok(());
    };

    let code = error.get("code").and_then(serde_json::Value::as_i64);
    let mut message = error
        .get("message")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown error")
        .to_string();

    let details: Vec<&str> = error
        .get("details")
        .and_then(serde_json::Value::as_array)
        .map(|d| d.iter().filter_map(serde_json::Value::as_str).collect())
        .unwrap_or_default();
    if !details.is_empty() {
        message = format!("{message} ({})", details.join("; "));
    }

    Err(FeatureServiceError::Service { code, message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_literal_escapes_single_quotes() {
        assert_eq!(quote_literal("O'NEIL"), "'O''NEIL'");
    }

    #[test]
    fn check_service_error_reads_code_message_and_details() {
        let body = serde_json::json!({
            "error": {
                "code": 400,
                "message": "Invalid URL",
                "details": ["Invalid URL"]
            }
        });
        let err = check_service_error(&body).unwrap_err();
        match err {
            FeatureServiceError::Service { code, message } => {
                assert_eq!(code, Some(400));
                assert_eq!(message, "Invalid URL (Invalid URL)");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn check_service_error_passes_normal_bodies() {
        let body = serde_json::json!({ "objectIds": [1, 2, 3] });
        assert!(check_service_error(&body).is_ok());
    }

    #[test]
    fn token_errors_are_recognised() {
        let err = FeatureServiceError::Service {
            code: Some(498),
            message: "Invalid token.".to_string(),
        };
        assert!(err.is_token_error());
        let err = FeatureServiceError::Service {
            code: Some(400),
            message: "Bad".to_string(),
        };
        assert!(!err.is_token_error());
    }

    #[test]
    fn server_failures_in_body_are_transient() {
        let err = FeatureServiceError::Service {
            code: Some(503),
            message: "Service unavailable.".to_string(),
        };
        assert!(err.is_transient());
        assert!(!err.is_token_error());
        let err = FeatureServiceError::Service {
            code: Some(400),
            message: "Unable to complete operation.".to_string(),
        };
        assert!(!err.is_transient());
        let err = FeatureServiceError::Service {
            code: None,
            message: "Error".to_string(),
        };
        assert!(!err.is_transient());
    }
}
