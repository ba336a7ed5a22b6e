use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use super::helpers::get_json_with_retry;
use super::reconciler::ProviderEndpoint;

// Helper struct for deserializing Keycloak's realm_access structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RealmAccess {
    pub(crate) roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Provider session the token was issued under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) realm_access: Option<RealmAccess>,
    /// Every other claim, kept for rendering
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Claims {
    /// Realm roles from Keycloak's realm_access claim
    pub fn roles(&self) -> Vec<String> {
        self.realm_access
            .as_ref()
            .map(|ra| ra.roles.clone())
            .unwrap_or_default()
    }

    /// Name to greet the user with
    pub fn display_name(&self) -> String {
        self.preferred_username
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| self.sub.clone())
    }
}

/// Event a back-channel logout token must announce
pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// Claims of an OpenID Connect back-channel logout token
#[derive(Debug, Clone, Deserialize)]
pub struct LogoutClaims {
    pub iss: Option<String>,
    pub sub: Option<String>,
    pub sid: Option<String>,
    pub jti: Option<String>,
    #[serde(default)]
    pub events: serde_json::Map<String, serde_json::Value>,
    nonce: Option<String>,
}

/// Token payloads whose issuer is checked against the policy
trait IssuedClaims {
    fn issuer(&self) -> Option<&str>;
}

impl IssuedClaims for Claims {
    fn issuer(&self) -> Option<&str> {
        self.iss.as_deref()
    }
}

impl IssuedClaims for LogoutClaims {
    fn issuer(&self) -> Option<&str> {
        self.iss.as_deref()
    }
}

/// How strictly the `iss` claim is compared against the provider's addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuerMatchMode {
    /// Issuer must be the external realm URL
    Strict,
    /// Issuer may be either the internal or the external realm URL
    RelaxedInternalExternal,
    /// Issuer is not checked
    Disabled,
}

impl FromStr for IssuerMatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "relaxed-internal-external" | "relaxed" => Ok(Self::RelaxedInternalExternal),
            "disabled" | "off" => Ok(Self::Disabled),
            other => Err(format!("unknown issuer match mode: {}", other)),
        }
    }
}

impl std::fmt::Display for IssuerMatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Strict => "strict",
            Self::RelaxedInternalExternal => "relaxed-internal-external",
            Self::Disabled => "disabled",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationPolicy {
    pub expected_audience: Option<String>,
    pub issuer_match_mode: IssuerMatchMode,
    /// Clock leeway applied to exp and nbf
    pub leeway_secs: u64,
}

impl ValidationPolicy {
    /// Issuers accepted under this policy, or None when the issuer is not checked
    pub fn accepted_issuers(&self, endpoint: &ProviderEndpoint) -> Option<Vec<String>> {
        match self.issuer_match_mode {
            IssuerMatchMode::Strict => Some(vec![endpoint.external_realm_url()]),
            IssuerMatchMode::RelaxedInternalExternal => Some(vec![
                endpoint.internal_realm_url(),
                endpoint.external_realm_url(),
            ]),
            IssuerMatchMode::Disabled => None,
        }
    }

    pub fn check_issuer(
        &self,
        issuer: Option<&str>,
        endpoint: &ProviderEndpoint,
    ) -> Result<(), ValidationError> {
        let Some(accepted) = self.accepted_issuers(endpoint) else {
            return Ok(());
        };
        let found = issuer.map(|i| i.trim_end_matches('/'));
        match found {
            Some(iss) if accepted.iter().any(|a| a.trim_end_matches('/') == iss) => Ok(()),
            _ => Err(ValidationError::Issuer {
                found: issuer.map(str::to_string),
            }),
        }
    }
}

/// Why a token was rejected
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("unknown signing key id: {0}")]
    UnknownKey(String),

    #[error("key discovery failed: {0}")]
    KeyDiscovery(String),

    #[error("unexpected signing algorithm")]
    Algorithm,

    #[error("invalid signature")]
    Signature,

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,

    #[error("audience mismatch")]
    Audience,

    #[error("issuer not accepted: {found:?}")]
    Issuer { found: Option<String> },

    #[error("missing required claim: {0}")]
    MissingClaim(String),
}

impl ValidationError {
    /// Name of the claim (or token part) that failed, for operator logs
    pub fn failing_claim(&self) -> &str {
        match self {
            Self::Malformed(_) => "token",
            Self::UnknownKey(_) => "kid",
            Self::KeyDiscovery(_) => "jwks",
            Self::Algorithm => "alg",
            Self::Signature => "signature",
            Self::Expired => "exp",
            Self::NotYetValid => "nbf",
            Self::Audience => "aud",
            Self::Issuer { .. } => "iss",
            Self::MissingClaim(claim) => claim.as_str(),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for ValidationError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidSignature => Self::Signature,
            ErrorKind::InvalidAudience => Self::Audience,
            ErrorKind::InvalidIssuer => Self::Issuer { found: None },
            ErrorKind::InvalidAlgorithm => Self::Algorithm,
            ErrorKind::MissingRequiredClaim(claim) => Self::MissingClaim(claim.clone()),
            _ => Self::Malformed(e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    #[serde(rename = "use")]
    key_use: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

pub struct TokenValidator {
    /// JWKS location on the internal address
    jwks_url: String,
    endpoint: ProviderEndpoint,
    policy: ValidationPolicy,
    client: reqwest::Client,
    jwks_cache: RwLock<Option<JwksCache>>,
    cache_ttl: Duration,
    max_attempts: u32,
}

impl TokenValidator {
    /// Create an RS256 validator backed by the provider's JWKS
    ///
    /// # Arguments
    /// * `jwks_url` - JWKS URL already mapped to the internal address
    /// * `endpoint` - Provider addresses, used for issuer checks
    /// * `policy` - Default validation policy
    /// * `client` - Shared HTTP client with timeouts
    /// * `jwks_cache_ttl_secs` - JWKS cache TTL
    /// * `max_attempts` - Attempts per JWKS fetch (the fetch is idempotent)
    pub fn new(
        jwks_url: String,
        endpoint: ProviderEndpoint,
        policy: ValidationPolicy,
        client: reqwest::Client,
        jwks_cache_ttl_secs: u64,
        max_attempts: u32,
    ) -> Self {
        tracing::info!(
            jwks_url = %jwks_url,
            issuer_match_mode = %policy.issuer_match_mode,
            accepted_issuers = ?policy.accepted_issuers(&endpoint),
            expected_audience = ?policy.expected_audience,
            jwks_cache_ttl_secs = jwks_cache_ttl_secs,
            "Token validator initialized"
        );

        Self {
            jwks_url,
            endpoint,
            policy,
            client,
            jwks_cache: RwLock::new(None),
            cache_ttl: Duration::from_secs(jwks_cache_ttl_secs),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Validate a token against the configured policy
    pub async fn validate(&self, token: &str) -> Result<Claims, ValidationError> {
        self.validate_with(token, &self.policy).await
    }

    /// Validate a token against an explicit policy
    ///
    /// Signature, `exp` and `nbf` are always verified; the policy only decides
    /// the audience and issuer checks.
    pub async fn validate_with(
        &self,
        token: &str,
        policy: &ValidationPolicy,
    ) -> Result<Claims, ValidationError> {
        let claims: Claims = self.verify(token, policy).await?;
        tracing::info!(
            sub = %claims.sub,
            username = ?claims.preferred_username,
            issuer = ?claims.iss,
            "Token validated successfully"
        );
        Ok(claims)
    }

    /// Validate a back-channel logout token against the configured policy
    ///
    /// On top of the usual checks the token must carry the logout event and a
    /// `sid` or `sub`, and must not carry a `nonce`.
    pub async fn validate_logout_token(&self, token: &str) -> Result<LogoutClaims, ValidationError> {
        let claims: LogoutClaims = self.verify(token, &self.policy).await?;
        if !claims.events.contains_key(BACKCHANNEL_LOGOUT_EVENT) {
            return Err(ValidationError::MissingClaim("events".to_string()));
        }
        if claims.sid.is_none() && claims.sub.is_none() {
            return Err(ValidationError::MissingClaim("sid".to_string()));
        }
        if claims.nonce.is_some() {
            return Err(ValidationError::Malformed(
                "logout token must not carry a nonce".to_string(),
            ));
        }
        tracing::info!(
            sub = ?claims.sub,
            sid = ?claims.sid,
            jti = ?claims.jti,
            "Logout token validated"
        );
        Ok(claims)
    }

    async fn verify<T: DeserializeOwned + IssuedClaims>(
        &self,
        token: &str,
        policy: &ValidationPolicy,
    ) -> Result<T, ValidationError> {
        tracing::debug!(token_len = token.len(), "Validating token");

        let header = decode_header(token).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let kid = header
            .kid
            .clone()
            .ok_or_else(|| ValidationError::Malformed("token header has no kid".to_string()))?;

        let decoding_key = match self.get_cached_key(&kid).await? {
            Some(key) => key,
            None => {
                // Key not found in cache - the provider may have rotated keys
                tracing::warn!(kid = %kid, "Key ID not found in cache, forcing JWKS refresh");
                self.refresh_jwks().await?;
                match self.lookup_key(&kid).await {
                    Some(key) => key,
                    None => {
                        tracing::error!(kid = %kid, "Unknown key ID even after JWKS refresh");
                        return Err(ValidationError::UnknownKey(kid));
                    }
                }
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = policy.leeway_secs;
        match &policy.expected_audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        // Issuer is checked below against the policy's explicit allow-list
        validation.iss = None;

        let result = decode::<T>(token, &decoding_key, &validation)
            .map_err(ValidationError::from)
            .and_then(|data| {
                policy.check_issuer(data.claims.issuer(), &self.endpoint)?;
                Ok(data.claims)
            });

        result.map_err(|e| {
            // Security audit logging - never the token itself
            let token_hash = format!("{:x}", md5::compute(token));
            tracing::error!(
                error = %e,
                failing_claim = e.failing_claim(),
                issuer_match_mode = %policy.issuer_match_mode,
                kid = %kid,
                alg = ?header.alg,
                token_hash = %token_hash,
                "Token validation failed"
            );
            e
        })
    }

    /// Check if JWKS is cached (for readiness checks)
    pub async fn is_jwks_cached(&self) -> bool {
        self.jwks_cache.read().await.is_some()
    }

    /// Prefetch JWKS at startup so readiness passes immediately
    pub async fn prefetch_jwks(&self) -> Result<(), ValidationError> {
        tracing::info!("Prefetching JWKS at startup for readiness");
        self.refresh_jwks().await
    }

    async fn lookup_key(&self, kid: &str) -> Option<DecodingKey> {
        let cache = self.jwks_cache.read().await;
        cache.as_ref().and_then(|c| c.keys.get(kid).cloned())
    }

    /// Get cached key, refreshing the cache first when it is missing or stale
    async fn get_cached_key(&self, kid: &str) -> Result<Option<DecodingKey>, ValidationError> {
        {
            let cache = self.jwks_cache.read().await;
            if let Some(jwks_cache) = cache.as_ref() {
                if jwks_cache.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(jwks_cache.keys.get(kid).cloned());
                }
                tracing::info!(
                    elapsed_secs = jwks_cache.fetched_at.elapsed().as_secs(),
                    ttl_secs = self.cache_ttl.as_secs(),
                    "JWKS cache expired, will refresh"
                );
            }
        } // Lock is dropped here

        self.refresh_jwks().await?;
        Ok(self.lookup_key(kid).await)
    }

    /// Refresh JWKS cache from the provider's internal address
    async fn refresh_jwks(&self) -> Result<(), ValidationError> {
        tracing::info!(url = %self.jwks_url, "Fetching JWKS");

        let response: JwksResponse =
            get_json_with_retry(&self.client, &self.jwks_url, self.max_attempts, "jwks")
                .await
                .map_err(|e| ValidationError::KeyDiscovery(format!("{:#}", e)))?;

        let mut keys = HashMap::new();
        for jwk in response.keys {
            // Only RSA signing keys; Keycloak also publishes RSA-OAEP encryption keys
            if jwk.kty != "RSA" || jwk.key_use.as_deref() == Some("enc") {
                continue;
            }
            let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n, jwk.e) else {
                continue;
            };
            match DecodingKey::from_rsa_components(&n, &e) {
                Ok(key) => {
                    tracing::debug!(kid = %kid, "Added key to cache");
                    keys.insert(kid, key);
                }
                Err(err) => {
                    tracing::warn!(kid = %kid, error = %err, "Skipping unusable JWK");
                }
            }
        }

        tracing::info!(key_count = keys.len(), "JWKS fetched successfully");

        let mut cache = self.jwks_cache.write().await;
        *cache = Some(JwksCache {
            keys,
            fetched_at: Instant::now(),
        });

        Ok(())
    }
}
