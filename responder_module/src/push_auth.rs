//! Push notification verification and payload decoding.
//!
//! Notifications arrive as Pub/Sub push requests carrying an OIDC bearer
//! token. The token is validated (RS256 signature against the issuer's
//! published JWKS, audience, issuer, expiry, plausible issued-at) before
//! the payload is even looked at.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::ServiceConfig;

const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);
const MAX_CLOCK_SKEW_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token header missing kid")]
    MissingKid,
    #[error("no published key matches kid {0}")]
    UnknownKey(String),
    #[error("jwks fetch failed: {0}")]
    JwksFetch(String),
    #[error("token rejected: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
pub struct PushClaims {
    pub iss: String,
    pub exp: u64,
    pub iat: u64,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

struct CachedKeys {
    keys: HashMap<String, Jwk>,
    fetched_at: Instant,
}

pub struct OidcVerifier {
    http: reqwest::Client,
    jwks_url: String,
    audience: String,
    issuers: Vec<String>,
    cache: RwLock<Option<CachedKeys>>,
}

impl OidcVerifier {
    pub fn new(config: &ServiceConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            jwks_url: config.jwks_url.clone(),
            audience: config.push_audience.clone(),
            issuers: config.push_issuers.clone(),
            cache: RwLock::new(None),
        }
    }

    pub async fn verify(&self, token: &str) -> Result<PushClaims, AuthError> {
        let header = decode_header(token).map_err(|err| AuthError::Invalid(err.to_string()))?;
        let kid = header.kid.ok_or(AuthError::MissingKid)?;

        let jwk = self.key_for(&kid).await?;
        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map_err(|err| AuthError::Invalid(err.to_string()))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_issuer(&self.issuers);
        validation.leeway = MAX_CLOCK_SKEW_SECS;

        let data = decode::<PushClaims>(token, &decoding_key, &validation)
            .map_err(|err| AuthError::Invalid(err.to_string()))?;

        let now = Utc::now().timestamp() as u64;
        if data.claims.iat > now + MAX_CLOCK_SKEW_SECS {
            return Err(AuthError::Invalid("issued-at is in the future".to_string()));
        }

        Ok(data.claims)
    }

    async fn key_for(&self, kid: &str) -> Result<Jwk, AuthError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < JWKS_CACHE_TTL {
                    if let Some(jwk) = cached.keys.get(kid) {
                        return Ok(jwk.clone());
                    }
                }
            }
        }

        // Cache miss or rotated key: fetch fresh keys.
        debug!("fetching JWKS from {}", self.jwks_url);
        let response = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::JwksFetch(format!("status {}", response.status())));
        }
        let jwks: JwksResponse = response
            .json()
            .await
            .map_err(|err| AuthError::JwksFetch(err.to_string()))?;

        let keys: HashMap<String, Jwk> = jwks
            .keys
            .into_iter()
            .map(|jwk| (jwk.kid.clone(), jwk))
            .collect();
        let jwk = keys.get(kid).cloned();

        let mut cache = self.cache.write().await;
        *cache = Some(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        });

        jwk.ok_or_else(|| AuthError::UnknownKey(kid.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PushDecodeError {
    #[error("bad push envelope: {0}")]
    Envelope(String),
    #[error("bad push data: {0}")]
    Data(String),
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    data: String,
}

/// The decoded notification: which mailbox changed and up to where.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PushNotification {
    #[serde(rename = "emailAddress")]
    pub mail_address: String,
    #[serde(rename = "historyId")]
    pub history_id: u64,
}

pub fn decode_push_payload(body: &[u8]) -> Result<PushNotification, PushDecodeError> {
    let envelope: PushEnvelope =
        serde_json::from_slice(body).map_err(|err| PushDecodeError::Envelope(err.to_string()))?;
    let data = STANDARD
        .decode(envelope.message.data.trim())
        .map_err(|err| PushDecodeError::Data(err.to_string()))?;
    serde_json::from_slice(&data).map_err(|err| PushDecodeError::Data(err.to_string()))
}
