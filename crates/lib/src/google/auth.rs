//! OAuth access tokens for Google APIs.
//!
//! Two sources: a service-account key (signed JWT exchanged for a token, used for Vision)
//! and an OAuth client with a refresh token (used for Drive and Docs). Tokens are cached
//! until shortly before they expire.

use crate::error::ServiceError;
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

const SERVICE: &str = "google-oauth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// Assertion lifetime; Google caps it at one hour.
const ASSERTION_TTL_SECS: u64 = 3600;
/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN_SECS: u64 = 60;

pub const SCOPE_CLOUD_VISION: &str = "https://www.googleapis.com/auth/cloud-vision";

/// Source of bearer tokens for Google API calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, ServiceError>;
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Last issued token, reused until it is about to expire.
#[derive(Default)]
pub struct TokenCache {
    inner: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<String, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TokenResponse, ServiceError>>,
    {
        let mut cached = self.inner.lock().await;
        if let Some(c) = cached.as_ref() {
            if c.expires_at > Instant::now() {
                return Ok(c.token.clone());
            }
        }
        let res = fetch().await?;
        let ttl = res
            .expires_in
            .unwrap_or(ASSERTION_TTL_SECS)
            .saturating_sub(EXPIRY_MARGIN_SECS);
        *cached = Some(CachedToken {
            token: res.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        Ok(res.access_token)
    }
}

/// POST a form to the token endpoint and parse the token. Non-success is an auth failure.
async fn request_token(
    client: &reqwest::Client,
    token_uri: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse, ServiceError> {
    let res = client
        .post(token_uri)
        .form(form)
        .send()
        .await
        .map_err(|e| ServiceError::request(SERVICE, e))?;
    if !res.status().is_success() {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        return Err(ServiceError::auth(
            SERVICE,
            format!("token endpoint returned {} {}", status, body),
        ));
    }
    res.json()
        .await
        .map_err(|e| ServiceError::request(SERVICE, e))
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Fields of a service-account key file that the JWT flow needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct AssertionClaims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

impl AssertionClaims {
    pub fn new(key: &ServiceAccountKey, scope: &str, now_secs: u64) -> Self {
        Self {
            iss: key.client_email.clone(),
            scope: scope.to_string(),
            aud: key.token_uri.clone(),
            iat: now_secs,
            exp: now_secs + ASSERTION_TTL_SECS,
        }
    }
}

/// Tokens for a service account, obtained with an RS256-signed assertion.
pub struct ServiceAccountTokenSource {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    scope: String,
    cache: TokenCache,
    client: reqwest::Client,
}

impl ServiceAccountTokenSource {
    /// Parse a service-account key JSON blob. Fails if the JSON or the private key is unusable.
    pub fn from_json(json: &str, scope: &str) -> Result<Self, ServiceError> {
        let key: ServiceAccountKey = serde_json::from_str(json)
            .map_err(|e| ServiceError::auth(SERVICE, format!("invalid service account key: {}", e)))?;
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| ServiceError::auth(SERVICE, format!("invalid private key: {}", e)))?;
        Ok(Self {
            key,
            encoding_key,
            scope: scope.to_string(),
            cache: TokenCache::default(),
            client: reqwest::Client::new(),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    fn assertion(&self) -> Result<String, ServiceError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let claims = AssertionClaims::new(&self.key, &self.scope, now);
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| ServiceError::auth(SERVICE, format!("signing assertion: {}", e)))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountTokenSource {
    async fn access_token(&self) -> Result<String, ServiceError> {
        self.cache
            .get_or_fetch(|| async {
                let assertion = self.assertion()?;
                request_token(
                    &self.client,
                    &self.key.token_uri,
                    &[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())],
                )
                .await
            })
            .await
    }
}

/// Tokens for a user who granted offline access to an OAuth client.
pub struct RefreshTokenSource {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    token_uri: String,
    cache: TokenCache,
    client: reqwest::Client,
}

impl RefreshTokenSource {
    pub fn new(client_id: String, client_secret: String, refresh_token: String) -> Self {
        Self {
            client_id,
            client_secret,
            refresh_token,
            token_uri: DEFAULT_TOKEN_URI.to_string(),
            cache: TokenCache::default(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TokenSource for RefreshTokenSource {
    async fn access_token(&self) -> Result<String, ServiceError> {
        self.cache
            .get_or_fetch(|| async {
                request_token(
                    &self.client,
                    &self.token_uri,
                    &[
                        ("grant_type", "refresh_token"),
                        ("client_id", self.client_id.as_str()),
                        ("client_secret", self.client_secret.as_str()),
                        ("refresh_token", self.refresh_token.as_str()),
                    ],
                )
                .await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn cache_reuses_unexpired_token() {
        let cache = TokenCache::default();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let token = cache
                .get_or_fetch(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(TokenResponse {
                        access_token: "tok".to_string(),
                        expires_in: Some(3600),
                    })
                })
                .await
                .unwrap();
            assert_eq!(token, "tok");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_refetches_when_token_is_within_margin() {
        let cache = TokenCache::default();
        let calls = AtomicUsize::new(0);
        for i in 0..2 {
            let token = cache
                .get_or_fetch(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(TokenResponse {
                        access_token: format!("tok{}", i),
                        // shorter than the margin: never reusable
                        expires_in: Some(30),
                    })
                })
                .await
                .unwrap();
            assert_eq!(token, format!("tok{}", i));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_error_is_not_cached() {
        let cache = TokenCache::default();
        let err = cache
            .get_or_fetch(|| async { Err(ServiceError::auth(SERVICE, "nope")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind_name(), "AuthError");
        let token = cache
            .get_or_fetch(|| async {
                Ok(TokenResponse {
                    access_token: "ok".to_string(),
                    expires_in: None,
                })
            })
            .await
            .unwrap();
        assert_eq!(token, "ok");
    }

    #[test]
    fn assertion_claims_target_token_uri() {
        let key: ServiceAccountKey = serde_json::from_str(
            r#"{"client_email": "ocr@proj.iam.gserviceaccount.com", "private_key": "pem"}"#,
        )
        .unwrap();
        let claims = AssertionClaims::new(&key, SCOPE_CLOUD_VISION, 1_000);
        assert_eq!(
            claims,
            AssertionClaims {
                iss: "ocr@proj.iam.gserviceaccount.com".to_string(),
                scope: SCOPE_CLOUD_VISION.to_string(),
                aud: DEFAULT_TOKEN_URI.to_string(),
                iat: 1_000,
                exp: 4_600,
            }
        );
    }

    #[test]
    fn malformed_key_json_is_rejected() {
        let err = ServiceAccountTokenSource::from_json("{\"client_email\": 1}", SCOPE_CLOUD_VISION)
            .err()
            .expect("should fail");
        assert_eq!(err.kind_name(), "AuthError");
        let err = ServiceAccountTokenSource::from_json(
            r#"{"client_email": "a@b", "private_key": "not a pem"}"#,
            SCOPE_CLOUD_VISION,
        )
        .err()
        .expect("should fail");
        assert!(err.to_string().contains("invalid private key"));
    }
}
