//! Verification of cluster-issued service-account tokens.
//!
//! Callers present projected service-account tokens. Signatures are checked
//! against the cluster's published key set, which is cached and refreshed when
//! a token names a key id the cache does not know yet.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::http::Request;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation, decode, decode_header,
    errors::ErrorKind,
    jwk::{AlgorithmParameters, Jwk, JwkSet},
};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

/// Path of the key set relative to the cluster API server.
pub const CLUSTER_JWKS_PATH: &str = "/openid/v1/jwks";

const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub issuer: String,
    pub subject: String,
    namespace: Option<String>,
    pod_name: Option<String>,
    pod_uid: Option<String>,
    service_account_name: Option<String>,
    service_account_uid: Option<String>,
}

impl Identity {
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn pod_name(&self) -> Option<&str> {
        self.pod_name.as_deref()
    }

    #[must_use]
    pub fn pod_uid(&self) -> Option<&str> {
        self.pod_uid.as_deref()
    }

    #[must_use]
    pub fn service_account_name(&self) -> Option<&str> {
        self.service_account_name.as_deref()
    }

    #[must_use]
    pub fn service_account_uid(&self) -> Option<&str> {
        self.service_account_uid.as_deref()
    }

    fn from_claims(claims: ServiceAccountClaims) -> Result<Self, IdentityError> {
        let kubernetes = claims.kubernetes.ok_or(IdentityError::MissingClaims)?;
        let (pod_name, pod_uid) = kubernetes
            .pod
            .map_or((None, None), |pod| (non_empty(pod.name), non_empty(pod.uid)));
        let (service_account_name, service_account_uid) = kubernetes
            .serviceaccount
            .map_or((None, None), |account| {
                (non_empty(account.name), non_empty(account.uid))
            });
        Ok(Self {
            issuer: claims.iss,
            subject: claims.sub,
            namespace: non_empty(kubernetes.namespace),
            pod_name,
            pod_uid,
            service_account_name,
            service_account_uid,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ServiceAccountClaims {
    iss: String,
    #[serde(default)]
    sub: String,
    #[serde(rename = "kubernetes.io")]
    kubernetes: Option<KubernetesClaims>,
}

#[derive(Debug, Default, Deserialize)]
struct KubernetesClaims {
    #[serde(default)]
    namespace: String,
    pod: Option<ObjectReference>,
    serviceaccount: Option<ObjectReference>,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectReference {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uid: String,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("missing authorization header")]
    MissingAuthorization,
    #[error("invalid authorization scheme")]
    InvalidAuthorizationScheme,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("token is not valid yet")]
    TokenNotYetValid,
    #[error("token issuer mismatch")]
    IssuerMismatch,
    #[error("token audience mismatch")]
    AudienceMismatch,
    #[error("token signed by unknown key")]
    UnknownKey,
    #[error("token missing kubernetes.io claims")]
    MissingClaims,
    #[error("key set unavailable: {0}")]
    KeySetUnavailable(String),
}

impl IdentityError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingAuthorization => "missing_authorization",
            Self::InvalidAuthorizationScheme => "invalid_authorization_scheme",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::TokenNotYetValid => "token_not_yet_valid",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::AudienceMismatch => "audience_mismatch",
            Self::UnknownKey => "unknown_key",
            Self::MissingClaims => "missing_claims",
            Self::KeySetUnavailable(_) => "key_set_unavailable",
        }
    }

    /// Whether the caller is at fault, as opposed to the bridge failing to
    /// reach its key set.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        !matches!(self, Self::KeySetUnavailable(_))
    }
}

/// Where the verifier obtains the cluster's signing keys.
#[async_trait]
pub trait KeySetSource: Send + Sync {
    async fn fetch(&self) -> Result<JwkSet, IdentityError>;
}

/// Reads the key set through the authenticated cluster client.
pub struct ClusterKeySetSource {
    client: kube::Client,
}

impl ClusterKeySetSource {
    #[must_use]
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KeySetSource for ClusterKeySetSource {
    async fn fetch(&self) -> Result<JwkSet, IdentityError> {
        let request = Request::get(CLUSTER_JWKS_PATH)
            .body(Vec::new())
            .map_err(|error| IdentityError::KeySetUnavailable(error.to_string()))?;
        let body = self
            .client
            .request_text(request)
            .await
            .map_err(|error| IdentityError::KeySetUnavailable(error.to_string()))?;
        serde_json::from_str(&body)
            .map_err(|error| IdentityError::KeySetUnavailable(format!("decode key set: {error}")))
    }
}

/// Reads the key set from an explicit URL.
pub struct HttpKeySetSource {
    http: reqwest::Client,
    url: String,
}

impl HttpKeySetSource {
    #[must_use]
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl KeySetSource for HttpKeySetSource {
    async fn fetch(&self) -> Result<JwkSet, IdentityError> {
        let response = self
            .http
            .get(self.url.as_str())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| IdentityError::KeySetUnavailable(error.to_string()))?;
        response
            .json::<JwkSet>()
            .await
            .map_err(|error| IdentityError::KeySetUnavailable(format!("decode key set: {error}")))
    }
}

struct CachedKeySet {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

pub struct IdentityVerifier {
    source: Arc<dyn KeySetSource>,
    issuer: String,
    audiences: Vec<String>,
    cache_ttl: Duration,
    min_refresh_interval: Duration,
    cache: RwLock<Option<CachedKeySet>>,
}

impl IdentityVerifier {
    #[must_use]
    pub fn new(
        source: Arc<dyn KeySetSource>,
        issuer: impl Into<String>,
        audiences: Vec<String>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            source,
            issuer: issuer.into(),
            audiences,
            cache_ttl,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            cache: RwLock::new(None),
        }
    }

    /// Shortest gap between two refreshes triggered by unknown key ids.
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn extract_bearer_token(header_value: Option<&str>) -> Result<&str, IdentityError> {
        let raw = header_value.ok_or(IdentityError::MissingAuthorization)?;
        let Some(token) = raw.trim().strip_prefix("Bearer ") else {
            return Err(IdentityError::InvalidAuthorizationScheme);
        };
        let token = token.trim();
        if token.is_empty() {
            return Err(IdentityError::InvalidAuthorizationScheme);
        }
        Ok(token)
    }

    pub async fn verify(&self, token: &str) -> Result<Identity, IdentityError> {
        let header = decode_header(token).map_err(|_| IdentityError::InvalidToken)?;
        let jwk = self.find_key(header.kid.as_deref()).await?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|_| IdentityError::UnknownKey)?;

        let accepted = accepted_algorithms(&jwk);
        if !accepted.contains(&header.alg) {
            debug!(alg = ?header.alg, "token algorithm does not match its signing key");
            return Err(IdentityError::InvalidToken);
        }
        let mut validation = Validation::new(header.alg);
        validation.algorithms = accepted.to_vec();
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&self.audiences);
        let claims = decode::<ServiceAccountClaims>(token, &key, &validation)
            .map_err(map_decode_error)?
            .claims;
        Identity::from_claims(claims)
    }

    async fn find_key(&self, kid: Option<&str>) -> Result<Jwk, IdentityError> {
        let keys = self.key_set(false).await?;
        if let Some(jwk) = select_key(&keys, kid) {
            return Ok(jwk.clone());
        }
        debug!(kid = kid.unwrap_or_default(), "unknown key id, refreshing key set");
        let keys = self.key_set(true).await?;
        select_key(&keys, kid)
            .cloned()
            .ok_or(IdentityError::UnknownKey)
    }

    async fn key_set(&self, force: bool) -> Result<Arc<JwkSet>, IdentityError> {
        if !force {
            if let Some(cached) = self.cache.read().await.as_ref() {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        let mut guard = self.cache.write().await;
        if let Some(cached) = guard.as_ref() {
            let age = cached.fetched_at.elapsed();
            let fresh_enough = if force {
                age < self.min_refresh_interval
            } else {
                age < self.cache_ttl
            };
            if fresh_enough {
                return Ok(cached.keys.clone());
            }
        }

        let keys = Arc::new(self.source.fetch().await?);
        debug!(key_count = keys.keys.len(), "refreshed cluster key set");
        *guard = Some(CachedKeySet {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }
}

/// Algorithms a key of this family can verify; the token header only picks
/// among them.
fn accepted_algorithms(jwk: &Jwk) -> &'static [Algorithm] {
    match jwk.algorithm {
        AlgorithmParameters::RSA(_) => &[
            Algorithm::RS256,
            Algorithm::RS384,
            Algorithm::RS512,
            Algorithm::PS256,
            Algorithm::PS384,
            Algorithm::PS512,
        ],
        AlgorithmParameters::EllipticCurve(_) => &[Algorithm::ES256, Algorithm::ES384],
        AlgorithmParameters::OctetKeyPair(_) => &[Algorithm::EdDSA],
        AlgorithmParameters::OctetKey(_) => {
            &[Algorithm::HS256, Algorithm::HS384, Algorithm::HS512]
        }
    }
}

fn select_key<'a>(keys: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => keys.find(kid),
        None if keys.keys.len() == 1 => keys.keys.first(),
        None => None,
    }
}

/// Reads the issuer out of a token WITHOUT checking its signature, expiry or
/// audience.
///
/// This is insecure and exists only so the bridge can learn its cluster's
/// issuer from its own mounted service credential at startup. Never call it
/// on a token presented by a caller.
pub fn discover_issuer_insecure(token: &str) -> Result<String, IdentityError> {
    #[derive(Deserialize)]
    struct IssuerOnly {
        iss: String,
    }

    let header = decode_header(token).map_err(|_| IdentityError::InvalidToken)?;
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let claims = decode::<IssuerOnly>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|_| IdentityError::InvalidToken)?
        .claims;
    non_empty(claims.iss).ok_or(IdentityError::InvalidToken)
}

fn map_decode_error(error: jsonwebtoken::errors::Error) -> IdentityError {
    match error.kind() {
        ErrorKind::ExpiredSignature => IdentityError::TokenExpired,
        ErrorKind::ImmatureSignature => IdentityError::TokenNotYetValid,
        ErrorKind::InvalidIssuer => IdentityError::IssuerMismatch,
        ErrorKind::InvalidAudience => IdentityError::AudienceMismatch,
        _ => IdentityError::InvalidToken,
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
