use crate::auth::flow::Access;
use crate::auth::handlers::login_redirect_response;
use crate::auth::helpers::{extract_cookie, safe_return_to};
use crate::auth::jwt::Claims;
use crate::AppState;
use axum::{extract::FromRequestParts, http::request::Parts, response::Response};
use std::sync::Arc;
use std::time::Duration;

/// Authenticated user extractor - resolves the session cookie to a live grant
///
/// A lapsed grant is refreshed silently. Anything else rejects with a redirect
/// that starts the login flow and comes back to the requested path.
///
/// Usage:
/// ```rust,ignore
/// async fn handler(AuthenticatedUser { claims, .. }: AuthenticatedUser) {
///     println!("User: {}", claims.sub);
/// }
/// ```
pub struct AuthenticatedUser {
    pub claims: Claims,
    pub roles: Vec<String>,
    /// Time left on the access token
    pub expires_in: Duration,
}

impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let session_id = extract_cookie(&parts.headers, &state.config.session_cookie_name);

        match state.coordinator.access(session_id.as_deref()).await {
            Access::Authenticated(grant) => {
                let roles = grant.id_token_claims.roles();
                if roles.is_empty() {
                    tracing::debug!(
                        user = %grant.id_token_claims.sub,
                        "Token carries no realm roles"
                    );
                }
                Ok(AuthenticatedUser {
                    expires_in: grant.expires_in(),
                    claims: grant.id_token_claims,
                    roles,
                })
            }
            Access::Anonymous { expired } => {
                let return_to =
                    safe_return_to(parts.uri.path_and_query().map(|pq| pq.as_str()));
                tracing::info!(
                    path = %parts.uri.path(),
                    expired = expired,
                    "Unauthenticated request to protected resource"
                );
                let login = state
                    .coordinator
                    .begin_login(session_id.as_deref(), return_to)
                    .await;
                Err(login_redirect_response(&state.config, login))
            }
        }
    }
}
