//! OIDC identity-token verification for Login.
//!
//! Signing keys come from a JSON Web Key Set. They are cached by `kid` and
//! refetched when the cache is older than the refresh interval or when a
//! token names a key the cache doesn't have. Fetches are at least
//! `key_min_refetch` apart; a stale key stays usable while the issuer is
//! unreachable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::OidcConfig;
use crate::error::{Result, SchedulerError};

#[async_trait]
pub trait KeySource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<JwkSet>;
}

/// Fetches the key set over HTTPS.
pub struct HttpKeySource {
    client: reqwest::Client,
    url: String,
}

impl HttpKeySource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self) -> Result<JwkSet> {
        let response = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SchedulerError::Unavailable(format!("fetch {}: {}", self.url, e)))?;
        response
            .json::<JwkSet>()
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("parse {}: {}", self.url, e)))
    }
}

/// Fixed key set.
pub struct StaticKeySource {
    keys: JwkSet,
}

impl StaticKeySource {
    pub fn new(keys: JwkSet) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<JwkSet> {
        Ok(self.keys.clone())
    }
}

/// Claims Login relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    pub exp: i64,
}

#[derive(Default)]
struct KeyCache {
    keys: HashMap<String, (DecodingKey, Algorithm)>,
    fetched_at: Option<Instant>,
    /// Last fetch attempt, successful or not.
    attempted_at: Option<Instant>,
}

impl KeyCache {
    fn fresh(&self, refresh: Duration) -> bool {
        self.fetched_at.is_some_and(|t| t.elapsed() < refresh)
    }

    fn recently_attempted(&self, min_interval: Duration) -> bool {
        self.attempted_at.is_some_and(|t| t.elapsed() < min_interval)
    }

    fn cached(&self, kid: &str) -> Result<(DecodingKey, Algorithm)> {
        self.keys.get(kid).cloned().ok_or_else(|| {
            SchedulerError::Unauthenticated(format!("unknown signing key {:?}", kid))
        })
    }
}

pub struct TokenVerifier {
    source: Arc<dyn KeySource>,
    client_id: String,
    issuers: Vec<String>,
    refresh: Duration,
    min_refetch: Duration,
    cache: RwLock<KeyCache>,
}

impl TokenVerifier {
    pub fn new(source: Arc<dyn KeySource>, config: &OidcConfig) -> Self {
        Self {
            source,
            client_id: config.client_id.clone(),
            issuers: config.issuers.clone(),
            refresh: config.key_refresh,
            min_refetch: config.key_min_refetch,
            cache: RwLock::new(KeyCache::default()),
        }
    }

    /// Verifies signature, audience, issuer and expiry, then requires a
    /// verified email.
    ///
    /// Tokens that can't be parsed are `InvalidArgument`; well-formed tokens
    /// that fail verification are `Unauthenticated`.
    pub async fn verify(&self, token: &str) -> Result<Claims> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| SchedulerError::InvalidArgument(format!("malformed token: {}", e)))?;
        let kid = header
            .kid
            .ok_or_else(|| SchedulerError::InvalidArgument("token has no key id".to_string()))?;
        let (key, algorithm) = self.key(&kid).await?;

        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[&self.client_id]);
        validation.set_issuer(&self.issuers[..]);
        validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);

        let data = jsonwebtoken::decode::<Claims>(token, &key, &validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Utf8(_) => {
                    SchedulerError::InvalidArgument(format!("malformed token: {}", e))
                }
                _ => SchedulerError::Unauthenticated(format!("token rejected: {}", e)),
            }
        })?;

        let claims = data.claims;
        if !claims.email_verified {
            return Err(SchedulerError::Unauthenticated(
                "email not verified".to_string(),
            ));
        }
        if claims.email.is_empty() {
            return Err(SchedulerError::Unauthenticated(
                "token has no email".to_string(),
            ));
        }
        Ok(claims)
    }

    async fn key(&self, kid: &str) -> Result<(DecodingKey, Algorithm)> {
        {
            let cache = self.cache.read().await;
            let throttled = cache.recently_attempted(self.min_refetch);
            if throttled || cache.fresh(self.refresh) {
                if let Some(entry) = cache.keys.get(kid) {
                    return Ok(entry.clone());
                }
                if throttled {
                    return cache.cached(kid);
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another caller may have refetched while we waited for the lock.
        if cache.recently_attempted(self.min_refetch) {
            return cache.cached(kid);
        }
        cache.attempted_at = Some(Instant::now());
        match self.source.fetch().await {
            Ok(set) => {
                cache.keys = decode_key_set(&set);
                cache.fetched_at = Some(Instant::now());
                tracing::info!(keys = cache.keys.len(), "Refreshed OIDC signing keys");
                cache.cached(kid)
            }
            Err(e) => match cache.keys.get(kid) {
                Some(entry) => {
                    tracing::warn!(error = %e, kid, "Key refresh failed, using cached key");
                    Ok(entry.clone())
                }
                None => Err(e),
            },
        }
    }
}

fn decode_key_set(set: &JwkSet) -> HashMap<String, (DecodingKey, Algorithm)> {
    let mut keys = HashMap::new();
    for jwk in &set.keys {
        let Some(kid) = jwk.common.key_id.clone() else {
            continue;
        };
        let Some(algorithm) = algorithm_for(jwk) else {
            tracing::warn!(kid = %kid, "Skipping key with unsupported algorithm");
            continue;
        };
        match DecodingKey::from_jwk(jwk) {
            Ok(key) => {
                keys.insert(kid, (key, algorithm));
            }
            Err(e) => tracing::warn!(kid = %kid, error = %e, "Skipping unusable key"),
        }
    }
    keys
}

fn algorithm_for(jwk: &Jwk) -> Option<Algorithm> {
    if let Some(alg) = &jwk.common.key_algorithm {
        return match alg {
            KeyAlgorithm::HS256 => Some(Algorithm::HS256),
            KeyAlgorithm::HS384 => Some(Algorithm::HS384),
            KeyAlgorithm::HS512 => Some(Algorithm::HS512),
            KeyAlgorithm::ES256 => Some(Algorithm::ES256),
            KeyAlgorithm::ES384 => Some(Algorithm::ES384),
            KeyAlgorithm::RS256 => Some(Algorithm::RS256),
            KeyAlgorithm::RS384 => Some(Algorithm::RS384),
            KeyAlgorithm::RS512 => Some(Algorithm::RS512),
            KeyAlgorithm::PS256 => Some(Algorithm::PS256),
            KeyAlgorithm::PS384 => Some(Algorithm::PS384),
            KeyAlgorithm::PS512 => Some(Algorithm::PS512),
            KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
            _ => None,
        };
    }
    match jwk.algorithm {
        AlgorithmParameters::RSA(_) => Some(Algorithm::RS256),
        AlgorithmParameters::EllipticCurve(_) => Some(Algorithm::ES256),
        AlgorithmParameters::OctetKeyPair(_) => Some(Algorithm::EdDSA),
        AlgorithmParameters::OctetKey(_) => Some(Algorithm::HS256),
    }
}
