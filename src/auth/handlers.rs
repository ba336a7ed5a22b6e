//! Authentication handlers for login, callback, and logout flows
//!
//! - `login_handler`: Starts the authorization code flow
//! - `callback_handler`: Completes it and rotates the session cookie
//! - `logout_handler`: Destroys the session and ends the provider session
//! - `backchannel_logout_handler`: Lets the provider end sessions server-to-server

use axum::{
    extract::{Form, Query, State},
    http::{
        header::{CACHE_CONTROL, LOCATION, SET_COOKIE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::flow::{Access, CallbackParams, LoginRedirect};
use super::helpers::{
    clear_session_cookie, extract_cookie, header_value, safe_return_to, session_cookie,
};
use crate::config::Config;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub return_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BackchannelLogoutForm {
    pub logout_token: Option<String>,
}

fn header_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "Internal error setting response headers"})),
    )
        .into_response()
}

/// 302 Found to `location`
fn found(location: &str) -> Response {
    match header_value(location) {
        Ok(value) => (StatusCode::FOUND, [(LOCATION, value)]).into_response(),
        Err(_) => header_error(),
    }
}

/// 302 Found that also sets a cookie
fn redirect_with_cookie(location: &str, cookie: &str) -> Response {
    let mut response = found(location);
    if response.status() != StatusCode::FOUND {
        return response;
    }
    match header_value(cookie) {
        Ok(value) => {
            response.headers_mut().insert(SET_COOKIE, value);
            response
        }
        Err(_) => header_error(),
    }
}

/// 302 to the provider's authorization endpoint, pinning the session cookie
pub(crate) fn login_redirect_response(config: &Config, login: LoginRedirect) -> Response {
    redirect_with_cookie(&login.location, &session_cookie(config, &login.session_id))
}

/// Login handler - initiates the authorization code flow
///
/// Already authenticated sessions go straight back to `/`.
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LoginQuery>,
    headers: HeaderMap,
) -> Response {
    tracing::info!("Login requested");
    let session_id = extract_cookie(&headers, &state.config.session_cookie_name);

    if let Access::Authenticated(grant) = state.coordinator.access(session_id.as_deref()).await {
        tracing::debug!(user = %grant.id_token_claims.sub, "Already authenticated");
        return found("/");
    }

    let return_to = safe_return_to(query.return_to.as_deref());
    let login = state
        .coordinator
        .begin_login(session_id.as_deref(), return_to)
        .await;
    login_redirect_response(&state.config, login)
}

/// Callback handler - exchanges the code and authenticates the session
pub async fn callback_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Response {
    tracing::info!(
        has_code = params.code.is_some(),
        has_error = params.error.is_some(),
        "OAuth callback received"
    );
    let session_id = extract_cookie(&headers, &state.config.session_cookie_name);

    match state
        .coordinator
        .complete_callback(session_id.as_deref(), params)
        .await
    {
        Ok(outcome) => {
            tracing::info!(
                redirect_to = %outcome.return_to,
                "Authentication successful, redirecting"
            );
            redirect_with_cookie(
                &outcome.return_to,
                &session_cookie(&state.config, &outcome.session_id),
            )
        }
        Err(e) => {
            tracing::warn!(
                event = "auth_failed",
                kind = e.kind(),
                error = %e,
                has_session_cookie = session_id.is_some(),
                "Authentication callback rejected"
            );
            e.into_response()
        }
    }
}

/// Logout handler - destroys the session, then ends the provider session
pub async fn logout_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    tracing::info!(event = "logout_start", "Logout requested");
    let session_id = extract_cookie(&headers, &state.config.session_cookie_name);

    // Not logged: may carry id_token_hint
    let location = state.coordinator.logout(session_id.as_deref()).await;

    redirect_with_cookie(&location, &clear_session_cookie(&state.config))
}

/// Back-channel logout handler - the provider reports a session ended on its side
pub async fn backchannel_logout_handler(
    State(state): State<Arc<AppState>>,
    Form(form): Form<BackchannelLogoutForm>,
) -> Response {
    let Some(token) = form.logout_token.filter(|t| !t.is_empty()) else {
        tracing::warn!(event = "backchannel_logout_rejected", "Logout request without a token");
        return backchannel_error();
    };

    match state.coordinator.backchannel_logout(&token).await {
        Ok(_) => (StatusCode::OK, [(CACHE_CONTROL, "no-store")]).into_response(),
        Err(e) => {
            tracing::warn!(
                event = "backchannel_logout_rejected",
                error = %e,
                failing_claim = e.failing_claim(),
                "Logout token rejected"
            );
            backchannel_error()
        }
    }
}

fn backchannel_error() -> Response {
    (
        StatusCode::BAD_REQUEST,
        [(CACHE_CONTROL, "no-store")],
        Json(serde_json::json!({"error": "invalid_request"})),
    )
        .into_response()
}
