use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::jwt::{IssuerMatchMode, ValidationPolicy};
use crate::auth::reconciler::ProviderEndpoint;

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Development,
    Production,
}

/// Configuration failures. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{var} is not a valid absolute URL ({value}): {reason}")]
    InvalidUrl {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} has an invalid value: {value}")]
    InvalidValue { var: &'static str, value: String },

    #[error("TLS_CERT_PATH and TLS_KEY_PATH must be set together")]
    IncompleteTls,
}

/// Certificate and key used when terminating TLS locally
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Environment configuration
    pub environment: Environment,

    // Server configuration
    pub server_host: String,
    pub server_port: u16,
    pub tls: Option<TlsConfig>,

    // Browser-visible URL of this app (callback and post-logout targets)
    pub public_url: String,
    pub callback_path: String,

    // Identity provider, internal (server-to-server) and external (browser) addresses
    pub provider: ProviderEndpoint,
    pub client_id: String,
    pub client_secret: String,
    pub scopes: Vec<String>,

    // Token validation
    pub validation: ValidationPolicy,

    // Session configuration
    pub session_cookie_name: String,
    pub session_inactivity_timeout_secs: u64,
    pub pending_auth_timeout_secs: u64,
    pub session_sweep_interval_secs: u64,

    // Cookie configuration (None = host-only cookie, Some = domain cookie)
    pub cookie_domain: Option<String>,

    // HTTP client timeout configuration (in seconds)
    pub http_connect_timeout_secs: u64,
    pub http_request_timeout_secs: u64,

    // JWKS cache configuration (in seconds)
    pub jwks_cache_ttl_secs: u64,

    // Attempts for idempotent provider fetches (discovery, JWKS)
    pub discovery_max_attempts: u32,

    // Send X-Forwarded-* headers derived from the external address on provider calls
    pub forwarded_headers: bool,
}

/// Routes served by the app itself
const RESERVED_PATHS: &[&str] = &[
    "/",
    "/protected",
    "/login",
    "/logout",
    "/backchannel-logout",
    "/healthz",
    "/readyz",
];

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| -> Result<String, ConfigError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };
        let number = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key).filter(|v| !v.trim().is_empty()) {
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidValue { var: key, value }),
                None => Ok(default),
            }
        };

        // Parse environment type
        let environment = match lookup("ENVIRONMENT")
            .unwrap_or_else(|| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        };

        // Required variables
        let public_url = absolute_url("PUBLIC_URL", &required("PUBLIC_URL")?)?;
        let realm = required("PROVIDER_REALM")?;
        let internal_base_url =
            absolute_url("PROVIDER_INTERNAL_URL", &required("PROVIDER_INTERNAL_URL")?)?;
        let external_base_url =
            absolute_url("PROVIDER_EXTERNAL_URL", &required("PROVIDER_EXTERNAL_URL")?)?;
        let client_id = required("CLIENT_ID")?;
        let client_secret = required("CLIENT_SECRET")?;

        // Keycloak layout unless overridden; an empty template means the base URL is the realm URL
        let realm_path = lookup("PROVIDER_REALM_PATH")
            .unwrap_or_else(|| "/realms/{realm}".to_string())
            .replace("{realm}", &realm);

        let callback_path = lookup("CALLBACK_PATH")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/callback".to_string());
        // Must be a literal route that does not shadow one of the app's own pages
        if !callback_path.starts_with('/')
            || callback_path.contains(['{', '}', '*', '?', '#'])
            || RESERVED_PATHS.contains(&callback_path.as_str())
        {
            return Err(ConfigError::InvalidValue {
                var: "CALLBACK_PATH",
                value: callback_path,
            });
        }

        let scopes: Vec<String> = lookup("SCOPES")
            .unwrap_or_else(|| "openid profile email".to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if !scopes.iter().any(|s| s == "openid") {
            return Err(ConfigError::InvalidValue {
                var: "SCOPES",
                value: scopes.join(" "),
            });
        }

        let issuer_match_mode = match lookup("ISSUER_MATCH_MODE") {
            Some(value) => value
                .parse::<IssuerMatchMode>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: "ISSUER_MATCH_MODE",
                    value,
                })?,
            None => IssuerMatchMode::Strict,
        };

        // Audience defaults to the client id; explicitly empty disables the check
        let expected_audience = match lookup("EXPECTED_AUDIENCE") {
            Some(aud) if aud.trim().is_empty() => None,
            Some(aud) => Some(aud.trim().to_string()),
            None => Some(client_id.clone()),
        };

        // Optional variables with defaults
        let server_host = lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let server_port = match lookup("SERVER_PORT") {
            Some(value) => value
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidValue {
                    var: "SERVER_PORT",
                    value,
                })?,
            None => 3000,
        };

        let tls = match (
            lookup("TLS_CERT_PATH").filter(|s| !s.is_empty()),
            lookup("TLS_KEY_PATH").filter(|s| !s.is_empty()),
        ) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        // Cookie domain: if not set or empty, use host-only cookies (no Domain attribute)
        let cookie_domain = lookup("COOKIE_DOMAIN").filter(|s| !s.is_empty());

        let session_cookie_name = lookup("SESSION_COOKIE_NAME")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "rp_session".to_string());

        let forwarded_headers = match lookup("FORWARDED_HEADERS")
            .map(|s| s.trim().to_lowercase())
            .as_deref()
        {
            None | Some("") | Some("true") | Some("1") | Some("yes") => true,
            Some("false") | Some("0") | Some("no") => false,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    var: "FORWARDED_HEADERS",
                    value: other.to_string(),
                })
            }
        };

        let discovery_max_attempts = number("DISCOVERY_MAX_ATTEMPTS", 3)?.clamp(1, 10) as u32;

        Ok(Config {
            environment,
            server_host,
            server_port,
            tls,
            public_url,
            callback_path,
            provider: ProviderEndpoint {
                internal_base_url,
                external_base_url,
                realm,
                realm_path,
            },
            client_id,
            client_secret,
            scopes,
            validation: ValidationPolicy {
                expected_audience,
                issuer_match_mode,
                leeway_secs: number("TOKEN_LEEWAY_SECS", 60)?,
            },
            session_cookie_name,
            session_inactivity_timeout_secs: number("SESSION_INACTIVITY_TIMEOUT_SECS", 1800)?,
            pending_auth_timeout_secs: number("PENDING_AUTH_TIMEOUT_SECS", 600)?,
            session_sweep_interval_secs: number("SESSION_SWEEP_INTERVAL_SECS", 60)?.max(1),
            cookie_domain,
            http_connect_timeout_secs: number("HTTP_CONNECT_TIMEOUT_SECS", 10)?,
            http_request_timeout_secs: number("HTTP_REQUEST_TIMEOUT_SECS", 30)?,
            jwks_cache_ttl_secs: number("JWKS_CACHE_TTL_SECS", 3600)?,
            discovery_max_attempts,
            forwarded_headers,
        })
    }

    /// Check if running in production mode
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Get cookie security flags based on environment and public scheme
    pub fn cookie_secure_flag(&self) -> &str {
        if self.is_production() || self.public_url.starts_with("https://") {
            "; Secure"
        } else {
            ""
        }
    }

    /// Get cookie domain attribute string (empty if host-only cookie)
    pub fn cookie_domain_attr(&self) -> String {
        match &self.cookie_domain {
            Some(domain) => format!("; Domain={}", domain),
            None => String::new(),
        }
    }

    /// External callback URL registered with the provider
    pub fn redirect_uri(&self) -> String {
        format!("{}{}", self.public_url, self.callback_path)
    }

    pub fn session_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.session_inactivity_timeout_secs)
    }

    pub fn pending_auth_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_auth_timeout_secs)
    }

    /// Get bind address for server
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

/// Validate an absolute http(s) URL and normalize away the trailing slash
fn absolute_url(var: &'static str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim().trim_end_matches('/');
    let parsed = url::Url::parse(trimmed).map_err(|e| ConfigError::InvalidUrl {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            var,
            value: value.to_string(),
            reason: "expected an http or https URL with a host".to_string(),
        });
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(ConfigError::InvalidUrl {
            var,
            value: value.to_string(),
            reason: "query and fragment are not allowed".to_string(),
        });
    }
    Ok(trimmed.to_string())
}
