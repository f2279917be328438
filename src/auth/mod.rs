// Authentication module
// Session storage, endpoint classification and token refresh coordination

mod classifier;
mod persistence;
mod refresh;
mod store;
mod types;

pub use classifier::{
    EndpointClassifier, DEFAULT_LOGIN_PATH, DEFAULT_LOGOUT_PATH, DEFAULT_REFRESH_PATH,
    REFRESH_ALIAS_PATH,
};
pub use persistence::{KeyValueStore, MemoryKeyValueStore, SqliteKeyValueStore};
pub use refresh::{Assessment, RefreshCoordinator, RefreshOutcome, RejectedCredential, TerminalReason};
pub use store::CredentialStore;
pub use types::{EndpointKind, PersistedSession, Session, SESSION_STORAGE_KEY, SESSION_STORAGE_VERSION};
