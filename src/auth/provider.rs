//! Identity provider client
//!
//! Discovers the provider's endpoints through its internal address, reconciles
//! each endpoint to the side of the network it is used from, and performs the
//! one-shot authorization-code exchange and refresh-token grant.

use oauth2::{
    basic::{BasicErrorResponseType, BasicTokenType},
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointSet, ExtraTokenFields,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, StandardErrorResponse,
    StandardRevocableToken, StandardTokenIntrospectionResponse, StandardTokenResponse,
    TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::helpers::{build_end_session_url, get_json_with_retry};
use super::reconciler::{AddressReconciler, ProviderEndpoint};

/// Custom extra fields to capture id_token from OIDC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcTokenFields {
    pub id_token: Option<String>,
}

impl ExtraTokenFields for OidcTokenFields {}

/// Type alias for our configured OAuth client with OIDC support
type ConfiguredOAuthClient = oauth2::Client<
    StandardErrorResponse<BasicErrorResponseType>,
    StandardTokenResponse<OidcTokenFields, BasicTokenType>,
    StandardTokenIntrospectionResponse<OidcTokenFields, BasicTokenType>,
    StandardRevocableToken,
    StandardErrorResponse<oauth2::RevocationErrorResponseType>,
    EndpointSet,            // HasAuthUrl
    oauth2::EndpointNotSet, // HasDeviceAuthUrl
    oauth2::EndpointNotSet, // HasIntrospectionUrl
    oauth2::EndpointNotSet, // HasRevocationUrl
    EndpointSet,            // HasTokenUrl
>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider discovery failed: {0}")]
    Discovery(String),

    #[error("invalid {which} endpoint {url}: {reason}")]
    InvalidEndpoint {
        which: &'static str,
        url: String,
        reason: String,
    },

    #[error("token request failed: {0}")]
    TokenRequest(String),
}

/// Subset of the OIDC discovery document we rely on
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Provider endpoints, each already mapped to the address it is used from
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRoutes {
    /// Browser-facing (external)
    pub authorization_url: String,
    /// Server-to-server (internal)
    pub token_url: String,
    /// Server-to-server (internal)
    pub jwks_url: String,
    /// Browser-facing (external)
    pub end_session_url: Option<String>,
}

impl ProviderRoutes {
    /// Map discovered endpoints regardless of which address the provider self-reported
    pub fn resolve(metadata: &ProviderMetadata, reconciler: &AddressReconciler) -> Self {
        Self {
            authorization_url: reconciler.to_external(&metadata.authorization_endpoint),
            token_url: reconciler.to_internal(&metadata.token_endpoint),
            jwks_url: reconciler.to_internal(&metadata.jwks_uri),
            end_session_url: metadata
                .end_session_endpoint
                .as_deref()
                .map(|url| reconciler.to_external(url)),
        }
    }
}

/// Everything the browser redirect needs, plus the secrets kept server-side
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub csrf_state: String,
    pub pkce_verifier: String,
}

/// Tokens returned by the token endpoint
#[derive(Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: Option<Duration>,
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"***REDACTED***")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl From<StandardTokenResponse<OidcTokenFields, BasicTokenType>> for TokenSet {
    fn from(response: StandardTokenResponse<OidcTokenFields, BasicTokenType>) -> Self {
        Self {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            id_token: response.extra_fields().id_token.clone(),
            expires_in: response.expires_in(),
        }
    }
}

pub struct ProviderClient {
    oauth: ConfiguredOAuthClient,
    http: reqwest::Client,
    routes: ProviderRoutes,
    client_id: String,
    scopes: Vec<String>,
}

impl ProviderClient {
    /// Fetch the discovery document from the internal realm URL and build the client
    pub async fn discover(
        endpoint: &ProviderEndpoint,
        reconciler: &AddressReconciler,
        http: reqwest::Client,
        max_attempts: u32,
        client: ClientRegistration,
    ) -> Result<Self, ProviderError> {
        let discovery_url = endpoint.discovery_url();
        tracing::info!(url = %discovery_url, "Fetching provider discovery document");

        let metadata: ProviderMetadata =
            get_json_with_retry(&http, &discovery_url, max_attempts, "discovery")
                .await
                .map_err(|e| ProviderError::Discovery(format!("{:#}", e)))?;

        let routes = ProviderRoutes::resolve(&metadata, reconciler);
        tracing::info!(
            reported_issuer = %metadata.issuer,
            authorization_url = %routes.authorization_url,
            token_url = %routes.token_url,
            jwks_url = %routes.jwks_url,
            end_session_url = ?routes.end_session_url,
            "Provider endpoints reconciled"
        );

        Self::from_routes(routes, http, client)
    }

    pub fn from_routes(
        routes: ProviderRoutes,
        http: reqwest::Client,
        client: ClientRegistration,
    ) -> Result<Self, ProviderError> {
        let invalid = |which: &'static str, url: &str, e: url::ParseError| {
            ProviderError::InvalidEndpoint {
                which,
                url: url.to_string(),
                reason: e.to_string(),
            }
        };

        // Public URL for browser redirects
        let auth_url = AuthUrl::new(routes.authorization_url.clone())
            .map_err(|e| invalid("authorization", &routes.authorization_url, e))?;

        // Internal URL for token exchange
        let token_url = TokenUrl::new(routes.token_url.clone())
            .map_err(|e| invalid("token", &routes.token_url, e))?;

        let redirect_url = RedirectUrl::new(client.redirect_uri.clone())
            .map_err(|e| invalid("redirect", &client.redirect_uri, e))?;

        let oauth = oauth2::Client::new(ClientId::new(client.client_id.clone()))
            .set_client_secret(ClientSecret::new(client.client_secret))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);

        Ok(Self {
            oauth,
            http,
            routes,
            client_id: client.client_id,
            scopes: client.scopes,
        })
    }

    pub fn routes(&self) -> &ProviderRoutes {
        &self.routes
    }

    /// Build the external authorization URL with a fresh state value and PKCE challenge
    pub fn authorization_request(&self) -> AuthorizationRequest {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = self
            .oauth
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (url, csrf_token) = request.url();

        AuthorizationRequest {
            url: url.to_string(),
            csrf_state: csrf_token.secret().clone(),
            pkce_verifier: pkce_verifier.secret().clone(),
        }
    }

    /// Exchange an authorization code at the internal token endpoint
    ///
    /// Codes are one-shot at the provider, so this is never retried.
    pub async fn exchange_code(
        &self,
        code: String,
        pkce_verifier: String,
    ) -> Result<TokenSet, ProviderError> {
        tracing::info!(token_url = %self.routes.token_url, "Exchanging authorization code for tokens");

        let response = self
            .oauth
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
            .request_async(&self.http)
            .await
            .map_err(|e| ProviderError::TokenRequest(e.to_string()))?;

        Ok(TokenSet::from(response))
    }

    /// Run the refresh-token grant at the internal token endpoint
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, ProviderError> {
        tracing::info!(token_url = %self.routes.token_url, "Refreshing tokens");

        let refresh_token = RefreshToken::new(refresh_token.to_string());
        let response = self
            .oauth
            .exchange_refresh_token(&refresh_token)
            .request_async(&self.http)
            .await
            .map_err(|e| ProviderError::TokenRequest(e.to_string()))?;

        Ok(TokenSet::from(response))
    }

    /// Browser-facing end-session URL, if the provider advertises one
    pub fn end_session_url(
        &self,
        post_logout_redirect_uri: &str,
        id_token_hint: Option<&str>,
    ) -> Option<String> {
        self.routes.end_session_url.as_deref().map(|endpoint| {
            build_end_session_url(
                endpoint,
                post_logout_redirect_uri,
                &self.client_id,
                id_token_hint,
            )
        })
    }
}

/// Client credentials and redirect registered with the provider
#[derive(Clone)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl ClientRegistration {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri(),
            scopes: config.scopes.clone(),
        }
    }
}
