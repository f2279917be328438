use reqwest::header::{HeaderMap, AUTHORIZATION};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::persistence::{KeyValueStore, MemoryKeyValueStore};
use super::types::{PersistedSession, Session, SESSION_STORAGE_KEY};
use crate::models::bearer_header;

/// Credential store
/// Owns the session, its persisted copy and the default outgoing headers.
///
/// Cloning is cheap and every clone shares the same session.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: RwLock<StoreState>,
    storage: Arc<dyn KeyValueStore>,
}

#[derive(Default)]
struct StoreState {
    session: Session,

    /// Headers merged into every outgoing call (Authorization while a token is held)
    default_headers: HeaderMap,

    /// Bumped by every clear(); lets an in-flight refresh notice a logout
    clear_epoch: u64,
}

impl StoreState {
    fn apply(&mut self, session: Session) {
        self.default_headers.remove(AUTHORIZATION);
        if let Some(ref token) = session.token {
            match bearer_header(token) {
                Ok(value) => {
                    self.default_headers.insert(AUTHORIZATION, value);
                }
                Err(e) => tracing::warn!("Token is not a valid header value: {}", e),
            }
        }
        self.session = session;
    }
}

impl CredentialStore {
    /// Create a store seeded from `storage`
    ///
    /// A missing or unreadable record starts an anonymous session.
    pub fn load(storage: Arc<dyn KeyValueStore>) -> Self {
        let session = match storage.get(SESSION_STORAGE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<PersistedSession>(&raw) {
                Ok(persisted) => persisted.into_session(),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable persisted session: {}", e);
                    Session::default()
                }
            },
            Ok(None) => Session::default(),
            Err(e) => {
                tracing::warn!("Failed to load persisted session: {:#}", e);
                Session::default()
            }
        };

        if session.token.is_some() {
            tracing::info!("Session restored from storage");
        } else {
            tracing::debug!("No persisted session found");
        }

        let mut state = StoreState::default();
        state.apply(session);

        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(state),
                storage,
            }),
        }
    }

    /// Store backed by process memory only
    pub fn in_memory() -> Self {
        Self::load(Arc::new(MemoryKeyValueStore::new()))
    }

    /// Current bearer token
    pub async fn token(&self) -> Option<String> {
        self.inner.state.read().await.session.token.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.state.read().await.session.authenticated
    }

    pub async fn session(&self) -> Session {
        self.inner.state.read().await.session.clone()
    }

    /// Headers the dispatcher merges under every call's own headers
    pub async fn default_headers(&self) -> HeaderMap {
        self.inner.state.read().await.default_headers.clone()
    }

    /// Number of clear() calls so far
    pub async fn clear_epoch(&self) -> u64 {
        self.inner.state.read().await.clear_epoch
    }

    /// Token and clear epoch read under one guard
    pub async fn token_and_epoch(&self) -> (Option<String>, u64) {
        let state = self.inner.state.read().await;
        (state.session.token.clone(), state.clear_epoch)
    }

    /// Default headers and clear epoch read under one guard
    pub async fn headers_and_epoch(&self) -> (HeaderMap, u64) {
        let state = self.inner.state.read().await;
        (state.default_headers.clone(), state.clear_epoch)
    }

    /// Adopt a new token (login success or refresh success)
    pub async fn set_token(&self, token: String) {
        let mut state = self.inner.state.write().await;
        self.write_session(&mut state, Session::with_token(token));
    }

    /// Adopt a refreshed token unless the session was cleared since `epoch`
    ///
    /// Returns false, leaving the store untouched, when a clear() happened.
    pub async fn commit_refreshed(&self, token: String, epoch: u64) -> bool {
        let mut state = self.inner.state.write().await;
        if state.clear_epoch != epoch {
            return false;
        }
        self.write_session(&mut state, Session::with_token(token));
        true
    }

    /// Forget the session everywhere
    pub async fn clear(&self) {
        let mut state = self.inner.state.write().await;
        state.apply(Session::default());
        state.clear_epoch += 1;

        if let Err(e) = self.inner.storage.remove(SESSION_STORAGE_KEY) {
            tracing::warn!("Failed to erase persisted session: {:#}", e);
        }
        tracing::debug!(epoch = state.clear_epoch, "Session cleared");
    }

    fn write_session(&self, state: &mut StoreState, session: Session) {
        let record = PersistedSession::from_session(&session);
        state.apply(session);

        match serde_json::to_string(&record) {
            Ok(raw) => {
                if let Err(e) = self.inner.storage.set(SESSION_STORAGE_KEY, &raw) {
                    tracing::warn!("Failed to persist session: {:#}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode session: {}", e),
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}
