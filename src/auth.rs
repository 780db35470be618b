use std::{
    convert::Infallible,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{
    decode, decode_header,
    jwk::JwkSet,
    Algorithm, DecodingKey, Validation,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{config::AuthConfig, error::GatewayError, AppState};

const REDACTED_PREFIX_CHARS: usize = 6;
const JWKS_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Verified credential published to handlers through request extensions.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token: String,
    pub claims: Value,
}

/// The request's [`AuthContext`], or `None` when ingress auth is disabled.
#[derive(Debug, Clone)]
pub struct MaybeAuth(pub Option<AuthContext>);

impl<S> FromRequestParts<S> for MaybeAuth
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<AuthContext>().cloned()))
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("malformed token header: {0}")]
    MalformedHeader(jsonwebtoken::errors::Error),
    #[error("signing algorithm {0:?} is not accepted")]
    UnsupportedAlgorithm(Algorithm),
    #[error("no signing key matches kid {0:?}")]
    UnknownKey(Option<String>),
    #[error("failed to fetch signing keys: {0}")]
    Jwks(String),
    #[error("token rejected: {0}")]
    Rejected(jsonwebtoken::errors::Error),
}

enum KeySource {
    Secret(DecodingKey),
    Jwks(JwksSource),
}

struct JwksSource {
    url: String,
    cache: RwLock<Option<Arc<JwkSet>>>,
    /// Time of the last fetch attempt. Held across the fetch so refreshes are serialized.
    last_refresh: Mutex<Option<Instant>>,
    min_refresh_interval: Duration,
}

pub struct JwtVerifier {
    issuer: String,
    audience: String,
    keys: KeySource,
    http: reqwest::Client,
}

impl JwtVerifier {
    /// `None` when authentication is administratively disabled.
    pub fn from_config(auth: &AuthConfig) -> Option<Self> {
        let issuer = auth.issuer.clone()?;
        match (&auth.jwt_secret, auth.resolved_jwks_url()) {
            (Some(secret), _) => Some(Self::with_secret(&issuer, &auth.audience, secret.as_bytes())),
            (None, Some(url)) => Some(Self::with_jwks(
                &issuer,
                &auth.audience,
                &url,
                JWKS_MIN_REFRESH_INTERVAL,
            )),
            (None, None) => None,
        }
    }

    /// Unknown `kid`s trigger at most one key refresh per `min_refresh_interval`.
    pub fn with_jwks(issuer: &str, audience: &str, url: &str, min_refresh_interval: Duration) -> Self {
        Self {
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            keys: KeySource::Jwks(JwksSource {
                url: url.to_string(),
                cache: RwLock::new(None),
                last_refresh: Mutex::new(None),
                min_refresh_interval,
            }),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_secret(issuer: &str, audience: &str, secret: &[u8]) -> Self {
        Self {
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            keys: KeySource::Secret(DecodingKey::from_secret(secret)),
            http: reqwest::Client::new(),
        }
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub async fn verify(&self, token: &str) -> Result<Value, VerifyError> {
        let header = decode_header(token).map_err(VerifyError::MalformedHeader)?;

        let (key, algorithm) = match &self.keys {
            KeySource::Secret(key) => {
                if header.alg != Algorithm::HS256 {
                    return Err(VerifyError::UnsupportedAlgorithm(header.alg));
                }
                (key.clone(), Algorithm::HS256)
            }
            KeySource::Jwks(source) => {
                if !matches!(
                    header.alg,
                    Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::ES256
                ) {
                    return Err(VerifyError::UnsupportedAlgorithm(header.alg));
                }
                let key = self.jwks_key(source, header.kid.as_deref()).await?;
                (key, header.alg)
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);

        let data = decode::<Value>(token, &key, &validation).map_err(VerifyError::Rejected)?;
        Ok(data.claims)
    }

    async fn jwks_key(
        &self,
        source: &JwksSource,
        kid: Option<&str>,
    ) -> Result<DecodingKey, VerifyError> {
        let cached = source.cache.read().await.clone();
        let jwks = match cached {
            Some(jwks) => jwks,
            None => self.refresh_jwks(source).await?,
        };

        let jwk = match kid {
            Some(kid) => match jwks.find(kid) {
                Some(jwk) => jwk.clone(),
                None => {
                    // Key rotation: refresh before giving up, at most once per interval.
                    let refreshed = self.refresh_jwks(source).await?;
                    refreshed
                        .find(kid)
                        .cloned()
                        .ok_or_else(|| VerifyError::UnknownKey(Some(kid.to_string())))?
                }
            },
            None => jwks
                .keys
                .first()
                .cloned()
                .ok_or(VerifyError::UnknownKey(None))?,
        };

        DecodingKey::from_jwk(&jwk).map_err(VerifyError::Rejected)
    }

    /// Within the refresh interval the cached set is returned without a fetch.
    async fn refresh_jwks(&self, source: &JwksSource) -> Result<Arc<JwkSet>, VerifyError> {
        let mut last_refresh = source.last_refresh.lock().await;
        if let Some(at) = *last_refresh {
            if at.elapsed() < source.min_refresh_interval {
                return source
                    .cache
                    .read()
                    .await
                    .clone()
                    .ok_or_else(|| VerifyError::Jwks("signing keys unavailable".to_string()));
            }
        }
        *last_refresh = Some(Instant::now());

        debug!(url = %source.url, "Fetching JWKS");
        let response = self
            .http
            .get(&source.url)
            .send()
            .await
            .map_err(|err| VerifyError::Jwks(err.to_string()))?;
        if !response.status().is_success() {
            return Err(VerifyError::Jwks(format!("status {}", response.status())));
        }
        let jwks = response
            .json::<JwkSet>()
            .await
            .map_err(|err| VerifyError::Jwks(err.to_string()))?;
        let jwks = Arc::new(jwks);
        *source.cache.write().await = Some(jwks.clone());
        Ok(jwks)
    }
}

/// `None` when the header is absent, not UTF-8, not a Bearer scheme, or empty.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw_header = headers.get(AUTHORIZATION)?;
    let value = raw_header.to_str().ok()?;
    let token = value.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

pub fn redact_token(token: &str) -> String {
    if token.chars().count() <= REDACTED_PREFIX_CHARS {
        return "***".to_string();
    }
    let prefix: String = token.chars().take(REDACTED_PREFIX_CHARS).collect();
    format!("{prefix}...")
}

/// Ingress middleware. Installed only when an issuer is configured.
pub async fn require_bearer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(verifier) = state.verifier.clone() else {
        return next.run(request).await;
    };

    let Some(token) = extract_bearer_token(request.headers()) else {
        debug!(path = %request.uri().path(), "Request without bearer token");
        return GatewayError::missing_token(verifier.audience()).into_response();
    };

    match verifier.verify(&token).await {
        Ok(claims) => {
            request.extensions_mut().insert(AuthContext { token, claims });
            next.run(request).await
        }
        Err(err) => {
            warn!(token = %redact_token(&token), reason = %err, "Rejected bearer token");
            GatewayError::invalid_token(verifier.audience()).into_response()
        }
    }
}
