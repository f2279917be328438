// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key the session record is persisted under
pub const SESSION_STORAGE_KEY: &str = "auth-storage";

/// Current persisted record layout
pub const SESSION_STORAGE_VERSION: u32 = 2;

/// In-memory session state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub token: Option<String>,
    pub authenticated: bool,
}

impl Session {
    pub fn with_token(token: String) -> Self {
        Self {
            token: Some(token),
            authenticated: true,
        }
    }
}

/// Session record as written to durable storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub token: Option<String>,
    pub authenticated: bool,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PersistedSession {
    pub fn from_session(session: &Session) -> Self {
        Self {
            token: session.token.clone(),
            authenticated: session.authenticated,
            version: SESSION_STORAGE_VERSION,
            updated_at: Some(Utc::now()),
        }
    }

    /// Restore the in-memory session; a record without a token is anonymous
    pub fn into_session(self) -> Session {
        match self.token.filter(|t| !t.is_empty()) {
            Some(token) => Session {
                token: Some(token),
                authenticated: self.authenticated,
            },
            None => Session::default(),
        }
    }
}

/// Refresh endpoint response
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Which side of the API surface a URL belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// login, refresh and logout routes
    Auth,
    /// everything else
    Protected,
}
