//! Split-horizon OIDC relying party
//!
//! A small web application that signs users in through an OpenID Connect
//! provider reachable at two addresses: an internal one used for
//! server-to-server calls and an external one the browser can reach.

pub mod auth;
pub mod config;
pub mod web;

#[cfg(test)]
pub(crate) mod test_support;

use anyhow::Context;
use auth::{
    flow::Coordinator,
    helpers::create_http_client,
    jwt::TokenValidator,
    provider::{ClientRegistration, ProviderClient},
    reconciler::AddressReconciler,
    session::SessionStore,
};
use config::Config;
use std::sync::Arc;

pub struct AppState {
    pub config: Arc<Config>,
    pub reconciler: Arc<AddressReconciler>,
    pub validator: Arc<TokenValidator>,
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    pub fn sessions(&self) -> &Arc<SessionStore> {
        self.coordinator.sessions()
    }
}

/// Discover the provider, warm the key cache and assemble the shared state
///
/// Fails when the provider cannot be reached through its internal address.
pub async fn bootstrap(config: Config) -> anyhow::Result<Arc<AppState>> {
    let reconciler = Arc::new(AddressReconciler::new(&config.provider)?);

    let forwarded = if config.forwarded_headers {
        reconciler.forwarded_headers()
    } else {
        Vec::new()
    };
    let http = create_http_client(
        config.http_connect_timeout_secs,
        config.http_request_timeout_secs,
        &forwarded,
    )
    .context("Failed to build HTTP client for provider calls")?;

    let provider = ProviderClient::discover(
        &config.provider,
        &reconciler,
        http.clone(),
        config.discovery_max_attempts,
        ClientRegistration::from_config(&config),
    )
    .await?;

    let validator = Arc::new(TokenValidator::new(
        provider.routes().jwks_url.clone(),
        config.provider.clone(),
        config.validation.clone(),
        http,
        config.jwks_cache_ttl_secs,
        config.discovery_max_attempts,
    ));
    validator
        .prefetch_jwks()
        .await
        .context("Failed to prefetch JWKS at startup")?;

    let sessions = Arc::new(SessionStore::new(
        config.session_inactivity_timeout(),
        config.pending_auth_timeout(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        sessions,
        Arc::new(provider),
        validator.clone(),
        format!("{}/", config.public_url),
    ));

    Ok(Arc::new(AppState {
        config: Arc::new(config),
        reconciler,
        validator,
        coordinator,
    }))
}
