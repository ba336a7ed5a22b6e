use super::filters::{external_redirects_middleware, sliding_session_middleware};
use super::handlers::{healthz_handler, index_handler, protected_handler, readyz_handler};
use crate::{
    auth::{backchannel_logout_handler, callback_handler, login_handler, logout_handler},
    AppState,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/protected", get(protected_handler))
        .route("/login", get(login_handler))
        .route(&state.config.callback_path, get(callback_handler))
        // POST for form submission, GET for plain links
        .route("/logout", get(logout_handler).post(logout_handler))
        // Provider-to-server only; never visited by the browser
        .route("/backchannel-logout", post(backchannel_logout_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            sliding_session_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.reconciler.clone(),
            external_redirects_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
