//! Manage json web tokens.

use std::time::Duration;

use axum::http::{HeaderMap, header};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde_json::{Map, Value};
use tonic::metadata::MetadataMap;

use crate::errno;
use crate::error::Result;

pub const DEFAULT_KEY: &str = "Rtg8BPKNEf2mB4mgvKONGPZZQSaJWNLijxR42qRgq0iBb5";
pub const DEFAULT_IDENTITY_KEY: &str = "identityKey";
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(2 * 60 * 60); // 2 hours.

const BEARER: &str = "Bearer ";

/// Anything that can carry an `Authorization` header.
pub trait BearerSource {
    fn authorization(&self) -> Option<&str>;
}

impl BearerSource for HeaderMap {
    fn authorization(&self) -> Option<&str> {
        self.get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
    }
}

impl BearerSource for MetadataMap {
    fn authorization(&self) -> Option<&str> {
        self.get("authorization")
            .and_then(|value| value.to_str().ok())
    }
}

/// Manage JWT tokens.
#[derive(Clone)]
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    identity_key: String,
    expiration: Duration,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("identity_key", &self.identity_key)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new(DEFAULT_KEY, DEFAULT_IDENTITY_KEY, DEFAULT_EXPIRATION)
    }
}

impl TokenManager {
    /// Create a new [`TokenManager`] instance.
    pub fn new(key: &str, identity_key: &str, expiration: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(key.as_bytes()),
            decoding_key: DecodingKey::from_secret(key.as_bytes()),
            identity_key: identity_key.to_owned(),
            expiration,
        }
    }

    /// Sign a new token for `subject`. Returns the token and its expiry.
    pub fn sign(&self, subject: &str) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expire_at = chrono::Duration::from_std(self.expiration)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or(errno::ERR_SIGN_TOKEN)?;

        let mut claims = Map::new();
        claims.insert(self.identity_key.clone(), Value::from(subject));
        claims.insert("nbf".into(), Value::from(now.timestamp()));
        claims.insert("iat".into(), Value::from(now.timestamp()));
        claims.insert("exp".into(), Value::from(expire_at.timestamp()));

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|err| {
                tracing::error!(error = %err, "failed to sign token");
                errno::ERR_SIGN_TOKEN
            })?;

        Ok((token, expire_at))
    }

    /// Decode and check a token, returning its subject.
    pub fn parse(&self, token: &str) -> Result<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        validation.leeway = 0;

        let data = decode::<Map<String, Value>>(token, &self.decoding_key, &validation)
            .map_err(|err| errno::ERR_TOKEN_INVALID.with_message(err.to_string()))?;

        match data.claims.get(&self.identity_key) {
            Some(Value::String(subject)) if !subject.is_empty() => Ok(subject.clone()),
            _ => Err(errno::ERR_TOKEN_INVALID
                .with_message(format!("missing `{}` claim", self.identity_key))),
        }
    }

    /// Extract the raw bearer token from headers or metadata.
    pub fn bearer<'a, S: BearerSource>(&self, source: &'a S) -> Result<&'a str> {
        let value = source.authorization().ok_or_else(|| {
            errno::ERR_UNAUTHENTICATED.with_message("missing 'Authorization' header")
        })?;

        match value.strip_prefix(BEARER) {
            Some(token) if !token.trim().is_empty() => Ok(token.trim()),
            _ => Err(errno::ERR_TOKEN_INVALID.with_message("invalid 'Authorization' header")),
        }
    }

    /// Parse the subject out of a request.
    pub fn parse_request<S: BearerSource>(&self, source: &S) -> Result<String> {
        self.parse(self.bearer(source)?)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_sign_then_parse() {
        let manager = TokenManager::default();
        let (token, expire_at) = manager.sign("user-abc123").unwrap();
        assert!(expire_at > Utc::now());
        assert_eq!(manager.parse(&token).unwrap(), "user-abc123");
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let (token, _) = TokenManager::default().sign("user-abc123").unwrap();
        let other = TokenManager::new("another-key", DEFAULT_IDENTITY_KEY, DEFAULT_EXPIRATION);
        let err = other.parse(&token).unwrap_err();
        assert!(err.is(&errno::ERR_TOKEN_INVALID));
    }

    #[test]
    fn test_tampered_token_is_rejected() {
        let manager = TokenManager::default();
        let (token, _) = manager.sign("user-abc123").unwrap();

        let mut bytes = token.into_bytes();
        let middle = bytes.len() / 2;
        bytes[middle] = if bytes[middle] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(manager.parse(&tampered).is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let manager = TokenManager::default();
        let past = Utc::now().timestamp() - 3600;
        let claims = serde_json::json!({
            DEFAULT_IDENTITY_KEY: "user-abc123",
            "nbf": past - 60,
            "iat": past - 60,
            "exp": past,
        });
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(DEFAULT_KEY.as_bytes()),
        )
        .unwrap();

        let err = manager.parse(&token).unwrap_err();
        assert!(err.is(&errno::ERR_TOKEN_INVALID));
    }

    #[test]
    fn test_missing_identity_claim() {
        let manager = TokenManager::new(DEFAULT_KEY, "sub", DEFAULT_EXPIRATION);
        let (token, _) = TokenManager::default().sign("user-abc123").unwrap();
        assert!(manager.parse(&token).unwrap_err().is(&errno::ERR_TOKEN_INVALID));
    }

    #[test]
    fn test_parse_request() {
        let manager = TokenManager::default();
        let (token, _) = manager.sign("user-abc123").unwrap();

        let mut headers = HeaderMap::new();
        assert!(
            manager
                .parse_request(&headers)
                .unwrap_err()
                .is(&errno::ERR_UNAUTHENTICATED)
        );

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        assert_eq!(manager.parse_request(&headers).unwrap(), "user-abc123");

        let mut metadata = MetadataMap::new();
        metadata.insert("authorization", format!("Bearer {token}").parse().unwrap());
        assert_eq!(manager.parse_request(&metadata).unwrap(), "user-abc123");
    }
}
