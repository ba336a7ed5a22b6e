use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::jwt::ValidationError;

/// Failures of the authorization-code flow
///
/// Every variant leaves the session anonymous. Details are for logs only; the
/// browser always receives the same generic response.
#[derive(Debug, thiserror::Error)]
pub enum AuthFlowError {
    #[error("no pending authorization for this session")]
    NoPendingAuthorization,

    #[error("pending authorization expired")]
    PendingExpired,

    #[error("state parameter mismatch")]
    StateMismatch,

    #[error("provider returned {error}: {description:?}")]
    ProviderDenied {
        error: String,
        description: Option<String>,
    },

    #[error("callback carried no authorization code")]
    MissingCode,

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("token validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("token refresh failed: {0}")]
    Refresh(String),
}

impl AuthFlowError {
    /// Stable label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoPendingAuthorization => "no_pending_authorization",
            Self::PendingExpired => "pending_expired",
            Self::StateMismatch => "state_mismatch",
            Self::ProviderDenied { .. } => "provider_denied",
            Self::MissingCode => "missing_code",
            Self::TokenExchange(_) => "token_exchange",
            Self::Validation(_) => "validation",
            Self::Refresh(_) => "refresh",
        }
    }
}

impl IntoResponse for AuthFlowError {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Authentication failed",
                "message": "Sign-in could not be completed. Please log in again.",
                "code": "AUTHENTICATION_FAILED"
            })),
        )
            .into_response()
    }
}
