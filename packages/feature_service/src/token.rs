//! Token acquisition for secured feature services.
//!
//! A [`Session`] is an explicit value with an expiry. It is obtained once
//! per run from the portal's `generateToken` endpoint and refreshed when it
//! gets close to expiring; it is never written to disk.

use chrono::{DateTime, Duration, Utc};

use crate::{FeatureServiceError, check_service_error, retry};

/// Tokens this close to expiry are treated as expired.
pub const REFRESH_MARGIN_SECS: i64 = 60;

/// Portal username and password.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A bearer token and the instant it stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Returns `true` if the token expires within [`REFRESH_MARGIN_SECS`]
    /// of `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(REFRESH_MARGIN_SECS) >= self.expires_at
    }
}

/// Token request parameters.
#[derive(Debug, Clone)]
pub struct TokenRequest<'a> {
    pub token_url: &'a str,
    pub referer: &'a str,
    pub expiration_minutes: u32,
}

/// Requests a new token.
///
/// # Errors
///
/// Returns [`FeatureServiceError::Auth`] if the portal rejects the
/// credentials, or another [`FeatureServiceError`] if the request fails.
pub async fn generate_token(
    client: &reqwest::Client,
    request: &TokenRequest<'_>,
    credentials: &Credentials,
    policy: &retry::RetryPolicy,
) -> Result<Session, FeatureServiceError> {
    let expiration = request.expiration_minutes.to_string();
    let form = [
        ("username", credentials.username.as_str()),
        ("password", credentials.password.as_str()),
        ("client", "referer"),
        ("referer", request.referer),
        ("expiration", expiration.as_str()),
        ("f", "json"),
    ];

    log::info!("Requesting token for {}", credentials.username);
    let body = retry::send_json(policy, || client.post(request.token_url).form(&form)).await?;
    parse_token_response(&body)
}

/// Reads `token` and `expires` (epoch milliseconds) from a
/// `generateToken` response.
///
/// # Errors
///
/// Returns [`FeatureServiceError::Auth`] if the body is an error or lacks
/// either field.
pub fn parse_token_response(body: &serde_json::Value) -> Result<Session, FeatureServiceError> {
    check_service_error(body).map_err(|e| FeatureServiceError::Auth {
        message: e.to_string(),
    })?;

    let token = body
        .get("token")
        .and_then(serde_json::Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| FeatureServiceError::Auth {
            message: "token response has no token".to_string(),
        })?;

    let expires_at = body
        .get("expires")
        .and_then(serde_json::Value::as_i64)
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| FeatureServiceError::Auth {
            message: "token response has no valid expiry".to_string(),
        })?;

    Ok(Session {
        token: token.to_string(),
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_token_and_expiry() {
        let body = serde_json::json!({
            "token": "abc123",
            "expires": 1_700_000_000_000_i64,
            "ssl": true
        });
        let session = parse_token_response(&body).unwrap();
        assert_eq!(session.token, "abc123");
        assert_eq!(session.expires_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn rejected_credentials_become_auth_errors() {
        let body = serde_json::json!({
            "error": { "code": 400, "message": "Unable to generate token.",
                       "details": ["Invalid username or password."] }
        });
        let err = parse_token_response(&body).unwrap_err();
        assert!(matches!(err, FeatureServiceError::Auth { .. }));
        assert!(err.to_string().contains("Invalid username or password."));
    }

    #[test]
    fn session_expires_inside_refresh_margin() {
        let now = Utc::now();
        let session = Session {
            token: "t".to_string(),
            expires_at: now + Duration::seconds(30),
        };
        assert!(session.is_expired_at(now));

        let session = Session {
            token: "t".to_string(),
            expires_at: now + Duration::minutes(10),
        };
        assert!(!session.is_expired_at(now));
    }

    #[test]
    fn debug_output_hides_password() {
        let credentials = Credentials {
            username: "gis_user".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("gis_user"));
        assert!(!rendered.contains("hunter2"));
    }
}
