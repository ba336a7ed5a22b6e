use axum::{
    body::Body,
    extract::State,
    http::{
        header::{LOCATION, SET_COOKIE},
        Request,
    },
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::{
    helpers::{extract_cookie, header_value, session_cookie},
    reconciler::AddressReconciler,
};
use crate::AppState;

/// Rewrite any `Location` header that points at the provider's internal address
///
/// The browser must never be sent to an address only reachable from inside the
/// deployment, whatever produced the redirect.
pub async fn external_redirects_middleware(
    State(reconciler): State<Arc<AddressReconciler>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;

    let Some(location) = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return response;
    };

    let rewritten = reconciler.to_external(&location);
    if rewritten != location {
        tracing::warn!(
            status = %response.status(),
            "Outbound redirect pointed at the internal provider address; rewritten"
        );
        if let Ok(value) = header_value(&rewritten) {
            response.headers_mut().insert(LOCATION, value);
        }
    }
    response
}

/// Re-issue the session cookie on every response for a live session
///
/// Keeps the browser's `Max-Age` sliding with the server-side inactivity
/// timeout. Responses that already set a cookie (login, callback, logout) win.
pub async fn sliding_session_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let session_id = extract_cookie(request.headers(), &state.config.session_cookie_name);
    let mut response = next.run(request).await;

    let Some(session_id) = session_id else {
        return response;
    };
    if response.headers().contains_key(SET_COOKIE) || !state.sessions().contains(&session_id) {
        return response;
    }
    match header_value(&session_cookie(&state.config, &session_id)) {
        Ok(value) => {
            response.headers_mut().insert(SET_COOKIE, value);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Could not re-issue session cookie");
        }
    }
    response
}
