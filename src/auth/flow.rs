//! Session and redirect coordination
//!
//! Drives a session through `Anonymous → AuthPending → Authenticated →
//! (Expired | logged out)`. Every transition happens while the session's own
//! mutex is held, including the token-endpoint calls, so a code can only be
//! spent once and a grant only refreshed once per expiry.

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::error::AuthFlowError;
use super::jwt::{Claims, TokenValidator, ValidationError};
use super::provider::{ProviderClient, TokenSet};
use super::session::{Grant, PendingAuthorization, ProviderKey, SessionState, SessionStore};

/// Query parameters the provider sends back to the callback route
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Where to send the browser to start authenticating
#[derive(Debug)]
pub struct LoginRedirect {
    pub session_id: String,
    pub location: String,
}

#[derive(Debug)]
pub struct CallbackOutcome {
    /// Rotated identifier; the pre-login identifier no longer resolves
    pub session_id: String,
    pub return_to: String,
}

/// What a request is allowed to see
#[derive(Debug)]
pub enum Access {
    Anonymous {
        /// A grant was held but lapsed without a usable refresh
        expired: bool,
    },
    Authenticated(Grant),
}

pub struct Coordinator {
    sessions: Arc<SessionStore>,
    provider: Arc<ProviderClient>,
    validator: Arc<TokenValidator>,
    post_logout_redirect_uri: String,
}

impl Coordinator {
    pub fn new(
        sessions: Arc<SessionStore>,
        provider: Arc<ProviderClient>,
        validator: Arc<TokenValidator>,
        post_logout_redirect_uri: String,
    ) -> Self {
        Self {
            sessions,
            provider,
            validator,
            post_logout_redirect_uri,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Put the session into `AuthPending` and return the external authorization URL
    ///
    /// Creates a session when the cookie is absent or no longer resolves. A
    /// previously pending authorization on the same session is superseded.
    pub async fn begin_login(&self, session_id: Option<&str>, return_to: String) -> LoginRedirect {
        let existing = match session_id {
            Some(id) => self.sessions.get(id).await,
            None => None,
        };
        let handle = match existing {
            Some(handle) => handle,
            None => self.sessions.create(),
        };

        let request = self.provider.authorization_request();
        let mut session = handle.entry.lock().await;
        if matches!(session.state, SessionState::AuthPending(_)) {
            tracing::debug!(event = "auth_pending_superseded", "Replacing pending authorization");
        }
        session.state = SessionState::AuthPending(PendingAuthorization {
            csrf_state: request.csrf_state,
            pkce_verifier: request.pkce_verifier,
            return_to,
            started_at: Instant::now(),
        });

        tracing::info!(event = "auth_redirect", "Redirecting to provider for authentication");
        LoginRedirect {
            session_id: session.id.clone(),
            location: request.url,
        }
    }

    /// Finish the authorization-code flow for the session behind `session_id`
    ///
    /// Any failure leaves the session anonymous.
    pub async fn complete_callback(
        &self,
        session_id: Option<&str>,
        params: CallbackParams,
    ) -> Result<CallbackOutcome, AuthFlowError> {
        let handle = match session_id {
            Some(id) => self.sessions.get(id).await,
            None => None,
        }
        .ok_or(AuthFlowError::NoPendingAuthorization)?;

        let mut session = handle.entry.lock().await;

        let pending = match std::mem::take(&mut session.state) {
            SessionState::AuthPending(pending) => pending,
            other => {
                // Duplicate or unsolicited callback; leave the session as it was
                session.state = other;
                return Err(AuthFlowError::NoPendingAuthorization);
            }
        };

        if pending.started_at.elapsed() >= self.sessions.pending_timeout() {
            return Err(AuthFlowError::PendingExpired);
        }
        if params.state.as_deref() != Some(pending.csrf_state.as_str()) {
            return Err(AuthFlowError::StateMismatch);
        }
        if let Some(error) = params.error {
            return Err(AuthFlowError::ProviderDenied {
                error,
                description: params.error_description,
            });
        }
        let code = params
            .code
            .filter(|c| !c.is_empty())
            .ok_or(AuthFlowError::MissingCode)?;

        let tokens = self
            .provider
            .exchange_code(code, pending.pkce_verifier)
            .await
            .map_err(|e| AuthFlowError::TokenExchange(e.to_string()))?;

        let grant = self.grant_from(tokens, None).await?;
        tracing::info!(
            event = "auth_success",
            sub = %grant.id_token_claims.sub,
            username = ?grant.id_token_claims.preferred_username,
            expires_in_secs = grant.expires_in().as_secs(),
            "Session authenticated"
        );
        self.sessions.index_grant(&handle, &grant.id_token_claims);
        session.state = SessionState::Authenticated(grant);
        let new_id = self.sessions.rotate(&handle, &mut session);

        Ok(CallbackOutcome {
            session_id: new_id,
            return_to: pending.return_to,
        })
    }

    /// Resolve what the session may access, refreshing a lapsed grant silently
    pub async fn access(&self, session_id: Option<&str>) -> Access {
        let handle = match session_id {
            Some(id) => self.sessions.get(id).await,
            None => None,
        };
        let Some(handle) = handle else {
            return Access::Anonymous { expired: false };
        };

        let mut session = handle.entry.lock().await;
        let grant = match &session.state {
            SessionState::Authenticated(grant) => grant.clone(),
            SessionState::Expired => return Access::Anonymous { expired: true },
            _ => return Access::Anonymous { expired: false },
        };
        if !grant.is_expired() {
            return Access::Authenticated(grant);
        }

        let refreshed = match grant.refresh_token.as_deref() {
            Some(refresh_token) => self.refresh(refresh_token, &grant).await,
            None => Err(AuthFlowError::Refresh("no refresh token held".to_string())),
        };
        match refreshed {
            Ok(new_grant) => {
                tracing::info!(
                    event = "grant_refreshed",
                    sub = %new_grant.id_token_claims.sub,
                    expires_in_secs = new_grant.expires_in().as_secs(),
                    "Grant refreshed"
                );
                session.state = SessionState::Authenticated(new_grant.clone());
                Access::Authenticated(new_grant)
            }
            Err(e) => {
                tracing::warn!(
                    event = "grant_expired",
                    error = %e,
                    sub = %grant.id_token_claims.sub,
                    "Grant expired and could not be refreshed"
                );
                session.state = SessionState::Expired;
                Access::Anonymous { expired: true }
            }
        }
    }

    /// Destroy the session and return where to send the browser
    pub async fn logout(&self, session_id: Option<&str>) -> String {
        let handle = match session_id {
            Some(id) => self.sessions.get(id).await,
            None => None,
        };

        let id_token_hint = match handle {
            Some(handle) => {
                let mut session = handle.entry.lock().await;
                let hint = match &session.state {
                    SessionState::Authenticated(grant) if !claims_expired(&grant.id_token_claims) => {
                        grant.id_token.clone()
                    }
                    _ => None,
                };
                session.state = SessionState::Anonymous;
                self.sessions.remove(&session.id);
                tracing::info!(
                    event = "logout",
                    with_id_token_hint = hint.is_some(),
                    "Session destroyed"
                );
                hint
            }
            None => None,
        };

        self.provider
            .end_session_url(&self.post_logout_redirect_uri, id_token_hint.as_deref())
            .unwrap_or_else(|| "/".to_string())
    }

    /// End the local sessions named by a provider-initiated logout token
    ///
    /// A `sid` targets that provider session only; a bare `sub` targets every
    /// session of that user. Returns how many sessions were destroyed.
    pub async fn backchannel_logout(&self, logout_token: &str) -> Result<usize, ValidationError> {
        let claims = self.validator.validate_logout_token(logout_token).await?;
        let key = match (claims.sid, claims.sub) {
            (Some(sid), _) => ProviderKey::Session(sid),
            (None, Some(sub)) => ProviderKey::Subject(sub),
            (None, None) => return Err(ValidationError::MissingClaim("sid".to_string())),
        };
        let revoked = self.sessions.revoke_provider_session(&key).await;
        tracing::info!(
            event = "backchannel_logout",
            key = ?key,
            revoked = revoked,
            "Provider ended sessions"
        );
        Ok(revoked)
    }

    async fn refresh(&self, refresh_token: &str, previous: &Grant) -> Result<Grant, AuthFlowError> {
        let tokens = self
            .provider
            .refresh(refresh_token)
            .await
            .map_err(|e| AuthFlowError::Refresh(e.to_string()))?;
        self.grant_from(tokens, Some(previous))
            .await
            .map_err(|e| AuthFlowError::Refresh(e.to_string()))
    }

    /// Validate freshly issued tokens and turn them into a grant
    ///
    /// The ID token is validated when present, the access token otherwise.
    /// On refresh, a refresh or ID token the provider did not reissue is carried over.
    async fn grant_from(
        &self,
        tokens: TokenSet,
        previous: Option<&Grant>,
    ) -> Result<Grant, AuthFlowError> {
        let subject_token = tokens.id_token.as_deref().unwrap_or(&tokens.access_token);
        let claims = self.validator.validate(subject_token).await?;

        // The grant never outlives the validated token
        let token_lifetime = remaining_lifetime(&claims);
        let lifetime = tokens
            .expires_in
            .map_or(token_lifetime, |reported| reported.min(token_lifetime));
        let now = Instant::now();
        let expires_at = now.checked_add(lifetime).ok_or_else(|| {
            AuthFlowError::TokenExchange(format!(
                "token lifetime of {}s is out of range",
                lifetime.as_secs()
            ))
        })?;

        Ok(Grant {
            refresh_token: tokens
                .refresh_token
                .or_else(|| previous.and_then(|g| g.refresh_token.clone())),
            id_token: tokens
                .id_token
                .or_else(|| previous.and_then(|g| g.id_token.clone())),
            access_token: tokens.access_token,
            id_token_claims: claims,
            issued_at: now,
            expires_at,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn claims_expired(claims: &Claims) -> bool {
    claims.exp <= unix_now()
}

fn remaining_lifetime(claims: &Claims) -> Duration {
    Duration::from_secs(claims.exp.saturating_sub(unix_now()))
}
