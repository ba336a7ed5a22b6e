use super::templates::{IndexTemplate, ProtectedTemplate};
use crate::{
    auth::{extractors::AuthenticatedUser, flow::Access, helpers::extract_cookie},
    AppState,
};
use askama::Template;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use std::sync::Arc;

/// Liveness probe - always returns OK if the process is running
pub async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness probe - 200 once the provider's signing keys are cached, 503 otherwise
pub async fn readyz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.validator.is_jwks_cached().await {
        (StatusCode::OK, "ready")
    } else {
        tracing::warn!("Readiness check failed: JWKS not cached");
        (StatusCode::SERVICE_UNAVAILABLE, "not ready: JWKS not cached")
    }
}

fn render(template: impl Template) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Template rendering failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Template error").into_response()
        }
    }
}

/// Home page; shows who is signed in without forcing a login
pub async fn index_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let session_id = extract_cookie(&headers, &state.config.session_cookie_name);

    let template = match state.coordinator.access(session_id.as_deref()).await {
        Access::Authenticated(grant) => IndexTemplate {
            authenticated: true,
            expired: false,
            username: grant.id_token_claims.display_name(),
            roles: grant.id_token_claims.roles(),
            email: grant.id_token_claims.email,
        },
        Access::Anonymous { expired } => IndexTemplate {
            authenticated: false,
            expired,
            username: String::new(),
            email: None,
            roles: Vec::new(),
        },
    };
    render(template)
}

pub async fn protected_handler(
    AuthenticatedUser {
        claims, expires_in, ..
    }: AuthenticatedUser,
) -> Response {
    let claims_json = match serde_json::to_string_pretty(&claims) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize claims");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Serialization error").into_response();
        }
    };

    render(ProtectedTemplate {
        username: claims.display_name(),
        expires_in_secs: expires_in.as_secs(),
        claims_json,
    })
}
