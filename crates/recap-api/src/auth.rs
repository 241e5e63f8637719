//! Request authentication extractors
//!
//! User reads are authenticated by three headers:
//!
//! - `timestamp`: RFC 3339 time of the request, within the allowed skew
//! - `user_id`: the numeric id whose recap is requested
//! - `sign`: base64 of `timestamp + secret + user_id` (or of
//!   `timestamp + user_id` when no secret is configured)
//!
//! Admin routes require the configured token in `x-admin-token`.

use actix_web::{dev::Payload, http::header::HeaderMap, web, FromRequest, HttpRequest};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use futures::future::{ready, Ready};
use recap_core::config::AuthConfig;
use recap_core::models::RecapKey;
use recap_core::{AppError, AppResult};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

pub const TIMESTAMP_HEADER: &str = "timestamp";
pub const USER_ID_HEADER: &str = "user_id";
pub const SIGN_HEADER: &str = "sign";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Verifies signed user-data requests
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
    max_skew: Duration,
}

impl SignatureVerifier {
    pub fn new(secret: Option<String>, max_skew_minutes: i64) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            max_skew: Duration::minutes(max_skew_minutes),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.signature_secret.clone(), config.max_skew_minutes)
    }

    /// Signature a client must send for this timestamp and user id
    pub fn sign(&self, timestamp: &str, user_id: &str) -> String {
        let payload = match &self.secret {
            Some(secret) => format!("{}{}{}", timestamp, secret, user_id),
            None => format!("{}{}", timestamp, user_id),
        };
        STANDARD.encode(payload)
    }

    /// Authenticate a request's headers at the current time
    pub fn verify(&self, headers: &HeaderMap) -> AppResult<RecapKey> {
        self.verify_at(headers, Utc::now())
    }

    /// Authenticate a request's headers as of `now`
    pub fn verify_at(&self, headers: &HeaderMap, now: DateTime<Utc>) -> AppResult<RecapKey> {
        let timestamp = header_value(headers, TIMESTAMP_HEADER)?;
        let user_id = header_value(headers, USER_ID_HEADER)?;
        let sign = header_value(headers, SIGN_HEADER)?;

        let key: RecapKey = user_id
            .parse()
            .map_err(|_| AppError::Unauthorized("Invalid user_id".to_string()))?;

        let sent_at: DateTime<Utc> = timestamp
            .parse()
            .map_err(|_| AppError::Unauthorized("Invalid timestamp format".to_string()))?;

        let skew = now.signed_duration_since(sent_at).num_minutes().abs();
        if skew > self.max_skew.num_minutes() {
            return Err(AppError::Unauthorized(format!(
                "Timestamp expired or too far in future (max {} minutes)",
                self.max_skew.num_minutes()
            )));
        }

        if !constant_time_eq(&self.sign(timestamp, user_id), sign) {
            return Err(AppError::Unauthorized("Invalid signature".to_string()));
        }

        Ok(key)
    }
}

fn constant_time_eq(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> AppResult<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized(format!("Missing header: {}", name)))
}

/// A request whose signature checked out
///
/// Use this as an extractor in handlers that serve one user's data.
#[derive(Debug, Clone, Copy)]
pub struct SignedUser {
    pub key: RecapKey,
}

impl FromRequest for SignedUser {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let verifier = match req.app_data::<web::Data<SignatureVerifier>>() {
            Some(verifier) => verifier,
            None => {
                warn!("SignatureVerifier not found in app data");
                return ready(Err(AppError::Internal(
                    "Request signing not configured".to_string(),
                )
                .into()));
            }
        };

        match verifier.verify(req.headers()) {
            Ok(key) => {
                debug!(user_id = %key, "Request signature verified");
                ready(Ok(SignedUser { key }))
            }
            Err(e) => {
                warn!(
                    error = %e,
                    user_id = ?req.headers().get(USER_ID_HEADER),
                    "Authentication failed"
                );
                ready(Err(e.into()))
            }
        }
    }
}

/// Token guarding the admin routes; `None` disables them
#[derive(Debug, Clone, Default)]
pub struct AdminToken(pub Option<String>);

impl AdminToken {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self(config.admin_token.clone().filter(|t| !t.is_empty()))
    }
}

/// Marker extractor for requests carrying the admin token
#[derive(Debug, Clone, Copy)]
pub struct AdminAccess;

impl FromRequest for AdminAccess {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let expected = match req
            .app_data::<web::Data<AdminToken>>()
            .and_then(|token| token.0.clone())
        {
            Some(token) => token,
            None => {
                warn!("Admin route called but no admin token is configured");
                return ready(Err(AppError::Forbidden(
                    "Admin routes are disabled".to_string(),
                )
                .into()));
            }
        };

        let provided = req
            .headers()
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());

        match provided {
            Some(token) if constant_time_eq(&expected, token) => ready(Ok(AdminAccess)),
            Some(_) => {
                warn!("Admin access denied: wrong token");
                ready(Err(AppError::Forbidden("Invalid admin token".to_string()).into()))
            }
            None => ready(Err(AppError::Unauthorized(format!(
                "Missing header: {}",
                ADMIN_TOKEN_HEADER
            ))
            .into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::{HeaderName, HeaderValue};

    fn headers(timestamp: &str, user_id: &str, sign: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in [
            (TIMESTAMP_HEADER, timestamp),
            (USER_ID_HEADER, user_id),
            (SIGN_HEADER, sign),
        ] {
            map.insert(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn now() -> DateTime<Utc> {
        "2025-01-15T10:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("token", "token"));
        assert!(!constant_time_eq("token", "tokem"));
        assert!(!constant_time_eq("token", "token-longer"));
        assert!(!constant_time_eq("token", ""));
    }

    #[test]
    fn test_sign_without_secret() {
        let verifier = SignatureVerifier::new(None, 10);
        assert_eq!(
            verifier.sign("2025-01-15T10:00:00Z", "42"),
            STANDARD.encode("2025-01-15T10:00:00Z42")
        );
    }

    #[test]
    fn test_empty_secret_counts_as_none() {
        let verifier = SignatureVerifier::new(Some(String::new()), 10);
        assert_eq!(
            verifier.sign("t", "1"),
            SignatureVerifier::new(None, 10).sign("t", "1")
        );
    }

    #[test]
    fn test_valid_signature_yields_key() {
        let verifier = SignatureVerifier::new(Some("s3cret".to_string()), 10);
        let ts = "2025-01-15T10:05:00Z";
        let sign = STANDARD.encode(format!("{}s3cret42", ts));

        let key = verifier.verify_at(&headers(ts, "42", &sign), now()).unwrap();
        assert_eq!(key, RecapKey(42));
    }

    #[test]
    fn test_wrong_signature_is_rejected() {
        let verifier = SignatureVerifier::new(Some("s3cret".to_string()), 10);
        let ts = "2025-01-15T10:00:00Z";
        let forged = verifier.sign(ts, "43");

        let err = verifier.verify_at(&headers(ts, "42", &forged), now()).unwrap_err();
        assert_eq!(err, AppError::Unauthorized("Invalid signature".to_string()));
    }

    #[test]
    fn test_stale_timestamp_is_rejected() {
        let verifier = SignatureVerifier::new(None, 10);
        let ts = "2025-01-15T09:49:00Z";
        let sign = verifier.sign(ts, "42");

        let err = verifier.verify_at(&headers(ts, "42", &sign), now()).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(msg) if msg.contains("max 10 minutes")));
    }

    #[test]
    fn test_malformed_headers_are_rejected() {
        let verifier = SignatureVerifier::new(None, 10);

        let err = verifier
            .verify_at(&headers("yesterday", "42", "x"), now())
            .unwrap_err();
        assert_eq!(err, AppError::Unauthorized("Invalid timestamp format".to_string()));

        let err = verifier
            .verify_at(&headers("2025-01-15T10:00:00Z", "abc", "x"), now())
            .unwrap_err();
        assert_eq!(err, AppError::Unauthorized("Invalid user_id".to_string()));

        let err = verifier.verify_at(&HeaderMap::new(), now()).unwrap_err();
        assert_eq!(err, AppError::Unauthorized("Missing header: timestamp".to_string()));
    }
}
