//! Server-side session store
//!
//! Sessions are keyed by an opaque random identifier carried in a cookie. Each
//! entry sits behind its own async mutex; every state transition of a session
//! happens while that mutex is held, which serializes duplicate callbacks and
//! concurrent refreshes for the same browser.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::jwt::Claims;

/// Tokens and claims obtained from a successful authentication
#[derive(Clone)]
pub struct Grant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Raw ID token, kept for the end-session hint
    pub id_token: Option<String>,
    pub id_token_claims: Claims,
    pub issued_at: Instant,
    pub expires_at: Instant,
}

impl Grant {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn expires_in(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

impl std::fmt::Debug for Grant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grant")
            .field("sub", &self.id_token_claims.sub)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("expires_in", &self.expires_in())
            .finish()
    }
}

/// An authorization request the browser has been sent off to complete
#[derive(Clone)]
pub struct PendingAuthorization {
    pub csrf_state: String,
    pub pkce_verifier: String,
    /// Local path to land on after the callback
    pub return_to: String,
    pub started_at: Instant,
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("return_to", &self.return_to)
            .field("age", &self.started_at.elapsed())
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub enum SessionState {
    #[default]
    Anonymous,
    AuthPending(PendingAuthorization),
    Authenticated(Grant),
    /// Grant lapsed and could not be refreshed; behaves as anonymous
    Expired,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::AuthPending(_) => "auth_pending",
            Self::Authenticated(_) => "authenticated",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub state: SessionState,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: SessionState::Anonymous,
            created_at: now,
            last_accessed_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed_at = Instant::now();
    }

    pub fn is_inactive(&self, timeout: Duration) -> bool {
        self.last_accessed_at.elapsed() >= timeout
    }

    /// Whether the sweeper should drop this session
    ///
    /// A session that never authenticated only lives as long as a pending
    /// authorization could; anything idle that long has nothing left to complete.
    fn is_evictable(&self, inactivity_timeout: Duration, pending_timeout: Duration) -> bool {
        match self.state {
            SessionState::Anonymous | SessionState::AuthPending(_) => {
                self.is_inactive(pending_timeout.min(inactivity_timeout))
            }
            SessionState::Authenticated(_) | SessionState::Expired => {
                self.is_inactive(inactivity_timeout)
            }
        }
    }
}

/// How the provider refers to a local session in back-channel logout
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderKey {
    /// Provider session (`sid` claim)
    Session(String),
    /// Provider user (`sub` claim)
    Subject(String),
}

impl ProviderKey {
    fn matches(&self, claims: &Claims) -> bool {
        match self {
            Self::Session(sid) => claims.sid.as_deref() == Some(sid.as_str()),
            Self::Subject(sub) => claims.sub == *sub,
        }
    }
}

/// Shared handle to one session entry
#[derive(Clone)]
pub struct SessionHandle {
    pub id: String,
    pub entry: Arc<Mutex<Session>>,
}

pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    /// Authenticated entries by provider session and subject; survives id rotation
    provider_index: DashMap<ProviderKey, Vec<Weak<Mutex<Session>>>>,
    inactivity_timeout: Duration,
    pending_timeout: Duration,
}

impl SessionStore {
    pub fn new(inactivity_timeout: Duration, pending_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            provider_index: DashMap::new(),
            inactivity_timeout,
            pending_timeout,
        }
    }

    pub fn pending_timeout(&self) -> Duration {
        self.pending_timeout
    }

    /// Create a fresh anonymous session under a new random identifier
    pub fn create(&self) -> SessionHandle {
        loop {
            let id = generate_session_id();
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.sessions.entry(id.clone()) {
                let entry = Arc::new(Mutex::new(Session::new(id.clone())));
                slot.insert(entry.clone());
                tracing::debug!(event = "session_created", "Session created");
                return SessionHandle { id, entry };
            }
        }
    }

    /// Look up a live session; evicts it instead when it has been inactive too long
    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        // Clone the Arc out so no map guard is held across the await
        let entry = self.sessions.get(id).map(|e| e.value().clone())?;

        let mut session = entry.lock().await;
        if session.is_inactive(self.inactivity_timeout) {
            drop(session);
            self.remove(id);
            tracing::info!(event = "session_inactive", "Session expired after inactivity");
            return None;
        }
        // Removed (logout or rotation) while we waited for the lock
        if session.id != id || !self.sessions.contains_key(id) {
            return None;
        }
        session.touch();
        drop(session);

        Some(SessionHandle {
            id: id.to_string(),
            entry,
        })
    }

    /// Move a session to a new identifier; the old identifier stops resolving
    ///
    /// The caller must hold the session's lock and pass the locked session in.
    pub fn rotate(&self, handle: &SessionHandle, session: &mut Session) -> String {
        let new_id = loop {
            let candidate = generate_session_id();
            if let dashmap::mapref::entry::Entry::Vacant(slot) =
                self.sessions.entry(candidate.clone())
            {
                slot.insert(handle.entry.clone());
                break candidate;
            }
        };
        self.sessions.remove(&session.id);
        session.id = new_id.clone();
        tracing::debug!(event = "session_rotated", "Session identifier rotated");
        new_id
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Whether `id` currently resolves, without touching the session
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Record which provider session and subject authenticated this entry
    pub fn index_grant(&self, handle: &SessionHandle, claims: &Claims) {
        let keys = claims
            .sid
            .as_ref()
            .map(|sid| ProviderKey::Session(sid.clone()))
            .into_iter()
            .chain(std::iter::once(ProviderKey::Subject(claims.sub.clone())));
        for key in keys {
            let mut entries = self.provider_index.entry(key).or_default();
            if !entries
                .iter()
                .any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(&handle.entry)))
            {
                entries.push(Arc::downgrade(&handle.entry));
            }
        }
    }

    /// Destroy every local session the provider knows as `key`; returns how many
    pub async fn revoke_provider_session(&self, key: &ProviderKey) -> usize {
        // Collect first so no map guard is held across the awaits below
        let entries: Vec<Arc<Mutex<Session>>> = match self.provider_index.remove(key) {
            Some((_, weak)) => weak.iter().filter_map(Weak::upgrade).collect(),
            None => return 0,
        };

        let mut revoked = 0;
        for entry in entries {
            let mut session = entry.lock().await;
            let live = self
                .sessions
                .get(&session.id)
                .is_some_and(|current| Arc::ptr_eq(current.value(), &entry));
            // The entry may since have been logged out or signed in as someone else
            let owned = match &session.state {
                SessionState::Authenticated(grant) => key.matches(&grant.id_token_claims),
                _ => false,
            };
            if !live || !owned {
                continue;
            }
            session.state = SessionState::Anonymous;
            self.sessions.remove(&session.id);
            revoked += 1;
        }
        revoked
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Evict idle sessions and prune index entries whose session is gone
    ///
    /// Sessions locked by an in-flight request are skipped this round.
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| match entry.try_lock() {
            Ok(session) => !session.is_evictable(self.inactivity_timeout, self.pending_timeout),
            Err(_) => true,
        });
        self.provider_index.retain(|_, entries| {
            entries.retain(|weak| weak.strong_count() > 0);
            !entries.is_empty()
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Run `sweep` periodically in the background
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let evicted = self.sweep();
                if evicted > 0 {
                    tracing::info!(
                        event = "session_sweep",
                        evicted = evicted,
                        remaining = self.len(),
                        "Evicted inactive sessions"
                    );
                }
            }
        })
    }
}

/// 256 bits from the OS RNG, base64url without padding
fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(Duration::from_secs(5), Duration::from_secs(2))
    }

    fn pending(age: Duration) -> PendingAuthorization {
        PendingAuthorization {
            csrf_state: "S1".to_string(),
            pkce_verifier: "v".to_string(),
            return_to: "/".to_string(),
            started_at: Instant::now() - age,
        }
    }

    fn grant(sub: &str, sid: &str) -> Grant {
        let claims: Claims = serde_json::from_value(serde_json::json!({
            "sub": sub,
            "sid": sid,
            "exp": 4_102_444_800u64,
        }))
        .unwrap();
        let now = Instant::now();
        Grant {
            access_token: "at".to_string(),
            refresh_token: None,
            id_token: None,
            id_token_claims: claims,
            issued_at: now,
            expires_at: now + Duration::from_secs(300),
        }
    }

    async fn authenticated(store: &SessionStore, sub: &str, sid: &str) -> SessionHandle {
        let handle = store.create();
        let grant = grant(sub, sid);
        store.index_grant(&handle, &grant.id_token_claims);
        handle.entry.lock().await.state = SessionState::Authenticated(grant);
        handle
    }

    #[test]
    fn test_session_ids_are_opaque_and_unique() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store();
        let handle = store.create();
        assert_eq!(store.len(), 1);

        let found = store.get(&handle.id).await.unwrap();
        assert!(Arc::ptr_eq(&found.entry, &handle.entry));
        assert!(matches!(
            found.entry.lock().await.state,
            SessionState::Anonymous
        ));
        assert!(store.get("unknown").await.is_none());
        assert!(store.contains(&handle.id));
        assert!(!store.contains("unknown"));
    }

    #[tokio::test]
    async fn test_inactive_session_evicted_on_get() {
        let store = store();
        let handle = store.create();
        handle.entry.lock().await.last_accessed_at = Instant::now() - Duration::from_secs(6);

        assert!(store.get(&handle.id).await.is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_stale_pending_left_for_callback_to_reject() {
        let store = store();
        let handle = store.create();
        handle.entry.lock().await.state =
            SessionState::AuthPending(pending(Duration::from_secs(3)));

        let found = store.get(&handle.id).await.unwrap();
        assert_eq!(found.entry.lock().await.state.name(), "auth_pending");
    }

    #[tokio::test]
    async fn test_rotate_invalidates_old_id() {
        let store = store();
        let handle = store.create();
        let old_id = handle.id.clone();

        let new_id = {
            let mut session = handle.entry.lock().await;
            store.rotate(&handle, &mut session)
        };

        assert_ne!(old_id, new_id);
        assert!(store.get(&old_id).await.is_none());
        let found = store.get(&new_id).await.unwrap();
        assert_eq!(found.entry.lock().await.id, new_id);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_evicts_inactive_and_skips_locked() {
        let store = store();
        let idle = authenticated(&store, "user-1", "sid-1").await;
        let busy = store.create();
        let fresh = store.create();
        let pending_session = store.create();

        idle.entry.lock().await.last_accessed_at = Instant::now() - Duration::from_secs(6);
        busy.entry.lock().await.last_accessed_at = Instant::now() - Duration::from_secs(6);
        pending_session.entry.lock().await.state =
            SessionState::AuthPending(pending(Duration::ZERO));

        let guard = busy.entry.lock().await;
        assert_eq!(store.sweep(), 1);
        drop(guard);

        assert_eq!(store.len(), 3);
        assert!(store.contains(&fresh.id));
        assert!(store.contains(&pending_session.id));
    }

    #[tokio::test]
    async fn test_sweep_drops_unauthenticated_sessions_after_pending_window() {
        let store = store();
        let anonymous = store.create();
        let abandoned = store.create();
        let signed_in = authenticated(&store, "user-1", "sid-1").await;

        for handle in [&anonymous, &abandoned, &signed_in] {
            handle.entry.lock().await.last_accessed_at = Instant::now() - Duration::from_secs(3);
        }
        abandoned.entry.lock().await.state =
            SessionState::AuthPending(pending(Duration::from_secs(3)));

        assert_eq!(store.sweep(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.contains(&signed_in.id));
    }

    #[tokio::test]
    async fn test_revoke_by_provider_session_follows_rotation() {
        let store = store();
        let handle = authenticated(&store, "user-1", "sid-1").await;
        let other = authenticated(&store, "user-1", "sid-2").await;

        let rotated = {
            let mut session = handle.entry.lock().await;
            store.rotate(&handle, &mut session)
        };

        let revoked = store
            .revoke_provider_session(&ProviderKey::Session("sid-1".to_string()))
            .await;
        assert_eq!(revoked, 1);
        assert!(store.get(&rotated).await.is_none());
        assert!(store.contains(&other.id));

        // Already gone
        assert_eq!(
            store
                .revoke_provider_session(&ProviderKey::Session("sid-1".to_string()))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_revoke_by_subject_skips_sessions_now_owned_by_someone_else() {
        let store = store();
        let first = authenticated(&store, "user-1", "sid-1").await;
        let second = authenticated(&store, "user-1", "sid-2").await;
        let reused = authenticated(&store, "user-1", "sid-3").await;
        reused.entry.lock().await.state = SessionState::Authenticated(grant("user-2", "sid-4"));

        let revoked = store
            .revoke_provider_session(&ProviderKey::Subject("user-1".to_string()))
            .await;
        assert_eq!(revoked, 2);
        assert!(!store.contains(&first.id));
        assert!(!store.contains(&second.id));
        assert!(store.contains(&reused.id));
    }

    #[tokio::test]
    async fn test_sweep_prunes_index_of_removed_sessions() {
        let store = store();
        let handle = authenticated(&store, "user-1", "sid-1").await;
        store.remove(&handle.id);
        drop(handle);

        store.sweep();
        assert!(store.provider_index.is_empty());
    }
}
