//! Helper functions for authentication
//!
//! This module contains URL builders, cookie handling and the HTTP client
//! used for every server-to-server call to the identity provider.
//!
//! Everything here is pure except `get_json_with_retry`, which performs
//! HTTP requests.

use anyhow::Context;
use axum::http::{header::InvalidHeaderValue, HeaderMap, HeaderValue};
use reqwest::header::HeaderName;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::config::Config;

// =============================================================================
// HTTP Client
// =============================================================================

/// Create the reqwest client for provider calls
///
/// Redirects are never followed and both connect and total timeouts are bounded.
/// `forwarded` headers are attached to every request.
pub fn create_http_client(
    connect_timeout_secs: u64,
    request_timeout_secs: u64,
    forwarded: &[(&'static str, String)],
) -> Result<reqwest::Client, reqwest::Error> {
    let mut default_headers = reqwest::header::HeaderMap::new();
    for (name, value) in forwarded {
        match reqwest::header::HeaderValue::from_str(value) {
            Ok(v) => {
                default_headers.insert(HeaderName::from_static(*name), v);
            }
            Err(e) => {
                tracing::warn!(header = %name, error = %e, "Skipping invalid forwarded header");
            }
        }
    }

    reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none()) // Security: prevent SSRF
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .timeout(Duration::from_secs(request_timeout_secs))
        .default_headers(default_headers)
        .build()
}

/// GET a JSON document, retrying transient failures
///
/// Only for idempotent fetches (discovery, JWKS). Never use for code exchange.
pub async fn get_json_with_retry<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    max_attempts: u32,
    what: &'static str,
) -> anyhow::Result<T> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = async {
            client
                .get(url)
                .send()
                .await
                .with_context(|| format!("Failed to fetch {}", what))?
                .error_for_status()
                .with_context(|| format!("{} endpoint returned an error status", what))?
                .json::<T>()
                .await
                .with_context(|| format!("Failed to parse {}", what))
        }
        .await;

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                tracing::warn!(
                    url = %url,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %format!("{:#}", e),
                    "Provider fetch failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// URL Builders
// =============================================================================

/// Build the provider end-session URL
///
/// OIDC providers require either `client_id` or `id_token_hint` alongside
/// `post_logout_redirect_uri`. We prefer `id_token_hint` when available.
pub fn build_end_session_url(
    end_session_endpoint: &str,
    post_logout_redirect_uri: &str,
    client_id: &str,
    id_token_hint: Option<&str>,
) -> String {
    let separator = if end_session_endpoint.contains('?') {
        '&'
    } else {
        '?'
    };
    let post_logout_redirect = urlencoding::encode(post_logout_redirect_uri);

    match id_token_hint.filter(|t| !t.trim().is_empty()) {
        Some(id_token) => format!(
            "{}{}id_token_hint={}&post_logout_redirect_uri={}",
            end_session_endpoint,
            separator,
            urlencoding::encode(id_token),
            post_logout_redirect
        ),
        None => format!(
            "{}{}client_id={}&post_logout_redirect_uri={}",
            end_session_endpoint,
            separator,
            urlencoding::encode(client_id),
            post_logout_redirect
        ),
    }
}

/// Accept only local absolute paths as post-login targets
pub fn safe_return_to(candidate: Option<&str>) -> String {
    match candidate {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.contains('\\')
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}

// =============================================================================
// Cookies
// =============================================================================

/// Extract a cookie value from headers
///
/// Handles multiple Cookie headers (some proxies fold/duplicate headers).
/// Uses `get_all` to collect all Cookie header values.
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);

    // Iterate over all Cookie headers (proxies may send multiple)
    for header_value in headers.get_all("cookie") {
        if let Ok(cookie_str) = header_value.to_str() {
            if let Some(value) = cookie_str
                .split(';')
                .map(|c| c.trim())
                .find(|c| c.starts_with(&prefix))
                .and_then(|c| c.strip_prefix(&prefix))
            {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Set-Cookie value carrying the opaque session identifier
pub fn session_cookie(config: &Config, session_id: &str) -> String {
    format!(
        "{}={}; HttpOnly; Path=/; Max-Age={}; SameSite=Lax{}{}",
        config.session_cookie_name,
        session_id,
        config.session_inactivity_timeout_secs,
        config.cookie_domain_attr(),
        config.cookie_secure_flag()
    )
}

/// Set-Cookie value that removes the session cookie
pub fn clear_session_cookie(config: &Config) -> String {
    format!(
        "{}=; HttpOnly; Path=/; Max-Age=0; SameSite=Lax{}{}",
        config.session_cookie_name,
        config.cookie_domain_attr(),
        config.cookie_secure_flag()
    )
}

/// Create a HeaderValue from a string, logging instead of panicking on bad input
pub fn header_value(s: &str) -> Result<HeaderValue, InvalidHeaderValue> {
    HeaderValue::from_str(s).map_err(|e| {
        tracing::error!(
            error = %e,
            value_len = s.len(),
            "Failed to create header value"
        );
        e
    })
}

// =============================================================================
// Tests
// =============================================================================
