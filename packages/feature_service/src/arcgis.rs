//! `ArcGIS` REST `FeatureServer` client.
//!
//! Queries go to `{service_url}/{layer}/query`, edits to
//! `{service_url}/{layer}/updateFeatures`, and the page size comes from the
//! service root's `maxRecordCount`. When credentials are configured every
//! request carries a token from a [`Session`] that is refreshed on expiry
//! or when the server answers 498/499.

use std::time::Duration;

use async_trait::async_trait;
use damage_assessment_report_models::{Attributes, DamageReport, ReportPoint};

use crate::{
    FeatureService, FeatureServiceError, check_service_error,
    retry::{self, RetryPolicy},
    token::{self, Credentials, Session, TokenRequest},
};

/// Connection settings for one feature layer.
#[derive(Debug, Clone)]
pub struct ArcGisConfig {
    /// `FeatureServer` URL, e.g.
    /// `https://services.arcgis.com/abc/arcgis/rest/services/DA_Fire/FeatureServer`.
    pub service_url: String,
    /// Layer index within the service.
    pub layer: u32,
    pub object_id_field: String,
    /// Portal `generateToken` endpoint.
    pub token_url: String,
    pub referer: String,
    pub token_expiration_minutes: u32,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy)]
enum Verb {
    Get,
    Post,
}

/// [`FeatureService`] over the `ArcGIS` REST API.
pub struct ArcGisFeatureService {
    client: reqwest::Client,
    config: ArcGisConfig,
    credentials: Option<Credentials>,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl ArcGisFeatureService {
    /// Creates a client. Without `credentials` requests are sent without a
    /// token.
    ///
    /// # Errors
    ///
    /// Returns [`FeatureServiceError::Http`] if the HTTP client cannot be
    /// built.
    pub fn new(
        config: ArcGisConfig,
        credentials: Option<Credentials>,
    ) -> Result<Self, FeatureServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            credentials,
            session: tokio::sync::Mutex::new(None),
        })
    }

    fn layer_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.service_url.trim_end_matches('/'),
            self.config.layer
        )
    }

    /// Returns a valid token, requesting a new one if there is none or the
    /// current one is about to expire.
    async fn token(&self) -> Result<Option<String>, FeatureServiceError> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };

        let mut session = self.session.lock().await;
        let now = chrono::Utc::now();
        if let Some(current) = session.as_ref()
            && !current.is_expired_at(now)
        {
            return Ok(Some(current.token.clone()));
        }

        let request = TokenRequest {
            token_url: &self.config.token_url,
            referer: &self.config.referer,
            expiration_minutes: self.config.token_expiration_minutes,
        };
        let fresh =
            token::generate_token(&self.client, &request, credentials, &self.config.retry).await?;
        log::debug!("Token valid until {}", fresh.expires_at);
        let value = fresh.token.clone();
        *session = Some(fresh);
        drop(session);
        Ok(Some(value))
    }

    async fn invalidate_session(&self) {
        *self.session.lock().await = None;
    }

    /// Sends a request and checks the body for an `ArcGIS` error. A rejected
    /// token is retried once with a fresh token. Transient error bodies are
    /// retried under the configured [`RetryPolicy`].
    async fn call(
        &self,
        verb: Verb,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, FeatureServiceError> {
        let mut refreshed = false;
        let mut service_attempt = 0;
        loop {
            let mut form: Vec<(&str, String)> = params.to_vec();
            form.push(("f", "json".to_string()));
            if let Some(token) = self.token().await? {
                form.push(("token", token));
            }

            let referer = self.config.referer.as_str();
            let body = match verb {
                Verb::Get => {
                    retry::send_json(&self.config.retry, || {
                        self.client
                            .get(url)
                            .header(reqwest::header::REFERER, referer)
                            .query(&form)
                    })
                    .await?
                }
                Verb::Post => {
                    retry::send_json(&self.config.retry, || {
                        self.client
                            .post(url)
                            .header(reqwest::header::REFERER, referer)
                            .form(&form)
                    })
                    .await?
                }
            };

            match check_service_error(&body) {
                Ok(()) => return Ok(body),
                Err(e) if e.is_token_error() && self.credentials.is_some() && !refreshed => {
                    log::warn!("Token rejected ({e}); requesting a new one");
                    self.invalidate_session().await;
                    refreshed = true;
                }
                Err(e) => {
                    service_attempt += 1;
                    let Some(delay) = service_retry_delay(&self.config.retry, &e, service_attempt)
                    else {
                        return Err(e);
                    };
                    log::warn!(
                        "{url} answered {e}; retry {service_attempt}/{} in {delay:?}...",
                        self.config.retry.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl FeatureService for ArcGisFeatureService {
    fn object_id_field(&self) -> &str {
        &self.config.object_id_field
    }

    async fn list_ids(&self, where_clause: &str) -> Result<Vec<i64>, FeatureServiceError> {
        let url = format!("{}/query", self.layer_url());
        let params = [
            ("where", where_clause.to_string()),
            ("returnIdsOnly", "true".to_string()),
        ];
        let body = self
            .call(Verb::Get, &url, &params)
            .await
            .map_err(|e| match e {
                FeatureServiceError::Service { code, message } => FeatureServiceError::Service {
                    code,
                    message: format!(
                        "{message} (could not list ids at {url}; is the feature service name correct?)"
                    ),
                },
                other => other,
            })?;
        parse_object_ids(&body, &url)
    }

    async fn page_size(&self) -> Result<u64, FeatureServiceError> {
        let body = self.call(Verb::Get, &self.config.service_url, &[]).await?;
        body.get("maxRecordCount")
            .and_then(serde_json::Value::as_u64)
            .filter(|n| *n > 0)
            .ok_or_else(|| FeatureServiceError::Protocol {
                message: format!(
                    "service metadata at {} has no maxRecordCount",
                    self.config.service_url
                ),
            })
    }

    async fn query(
        &self,
        where_clause: &str,
        out_fields: &str,
    ) -> Result<Vec<DamageReport>, FeatureServiceError> {
        let url = format!("{}/query", self.layer_url());
        let params = [
            ("where", where_clause.to_string()),
            ("outFields", out_fields.to_string()),
            ("returnGeometry", "true".to_string()),
        ];
        let body = self.call(Verb::Get, &url, &params).await?;
        let features = body
            .get("features")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| FeatureServiceError::Protocol {
                message: format!("query response from {url} has no features array"),
            })?;

        features
            .iter()
            .map(|f| parse_feature(f, &self.config.object_id_field))
            .collect()
    }

    async fn update(
        &self,
        object_id: i64,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<bool, FeatureServiceError> {
        let url = format!("{}/updateFeatures", self.layer_url());
        let mut attributes = serde_json::Map::new();
        attributes.insert(
            self.config.object_id_field.clone(),
            serde_json::Value::from(object_id),
        );
        attributes.insert(field.to_string(), value.clone());
        let features = serde_json::json!([{ "attributes": attributes }]);

        let params = [("features", serde_json::to_string(&features)?)];
        let body = self.call(Verb::Post, &url, &params).await?;
        Ok(update_succeeded(&body))
    }
}

/// Reads the `objectIds` array of a `returnIdsOnly` response.
///
/// `ArcGIS` sends `"objectIds": null` for an empty layer; a response with
/// no `objectIds` key at all means the request did not reach a layer.
///
/// # Errors
///
/// Returns [`FeatureServiceError::Protocol`] if the key is missing or holds
/// a non-integer.
pub fn parse_object_ids(
    body: &serde_json::Value,
    url: &str,
) -> Result<Vec<i64>, FeatureServiceError> {
    match body.get("objectIds") {
        Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(ids)) => ids
            .iter()
            .map(|id| {
                id.as_i64().ok_or_else(|| FeatureServiceError::Protocol {
                    message: format!("non-integer object id {id} from {url}"),
                })
            })
            .collect(),
        _ => Err(FeatureServiceError::Protocol {
            message: format!(
                "no objectIds in response from {url}; is the feature service name correct?"
            ),
        }),
    }
}

/// Converts one `{ "attributes": {...}, "geometry": {...} }` feature.
///
/// # Errors
///
/// Returns [`FeatureServiceError::Protocol`] if the feature has no
/// attributes or no integer object id.
pub fn parse_feature(
    feature: &serde_json::Value,
    object_id_field: &str,
) -> Result<DamageReport, FeatureServiceError> {
    let attributes: Attributes = feature
        .get("attributes")
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| FeatureServiceError::Protocol {
            message: "feature has no attributes".to_string(),
        })?
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let object_id = attributes
        .get(object_id_field)
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| FeatureServiceError::Protocol {
            message: format!("feature has no integer {object_id_field}"),
        })?;

    let geometry = feature.get("geometry").and_then(|g| {
        let x = g.get("x")?.as_f64()?;
        let y = g.get("y")?.as_f64()?;
        Some(ReportPoint::new(x, y))
    });

    Ok(DamageReport {
        object_id,
        geometry,
        attributes,
    })
}

/// Returns `true` if every entry of `updateResults` reports success.
#[must_use]
pub fn update_succeeded(body: &serde_json::Value) -> bool {
    body.get("updateResults")
        .and_then(serde_json::Value::as_array)
        .is_some_and(|results| {
            !results.is_empty()
                && results.iter().all(|r| {
                    r.get("success")
                        .and_then(serde_json::Value::as_bool)
                        .unwrap_or(false)
                })
        })
}

/// Delay before re-sending a request whose body carried `error`, or `None`
/// when the error is permanent or retry `attempt` (1-based) exceeds the
/// policy.
fn service_retry_delay(
    policy: &RetryPolicy,
    error: &FeatureServiceError,
    attempt: u32,
) -> Option<Duration> {
    (error.is_transient() && attempt <= policy.max_retries).then(|| policy.delay_for(attempt))
}
