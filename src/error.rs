// Error handling module
// Defines the client error taxonomy surfaced to callers

use std::time::Duration;

use thiserror::Error;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Why a token refresh did not produce a usable token.
///
/// Cloneable because one refresh outcome is fanned out to every queued waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshFailure {
    /// The refresh endpoint answered with a non-success status
    #[error("refresh endpoint rejected the session: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// The refresh endpoint answered 2xx without an access token
    #[error("refresh response does not contain access_token")]
    MissingToken,

    /// The refresh call never got a response
    #[error("refresh request failed: {0}")]
    Transport(String),

    /// The session was cleared while the refresh was in flight
    #[error("session was cleared while the token refresh was in flight")]
    SessionCleared,
}

/// Errors returned by the session client
#[derive(Error, Debug)]
pub enum ClientError {
    /// No response reached us (connect failure, broken body, ...)
    #[error("Network error ({kind}): {message}")]
    Network { kind: &'static str, message: String },

    /// The call, or the wait for a refresh, exceeded its timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Any non-success status, passed through unmodified
    #[error("API error: {status} - {message}")]
    Status { status: u16, message: String },

    /// The shared token refresh failed; the session has been cleared
    #[error("Token refresh failed: {0}")]
    RefreshRejected(#[from] RefreshFailure),

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Build a status error from a response status and body
    pub fn from_status(status: u16, body: &str) -> Self {
        ClientError::Status {
            status,
            message: Self::truncate_body(body),
        }
    }

    /// HTTP status carried by this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            ClientError::RefreshRejected(RefreshFailure::Rejected { status, .. }) => Some(*status),
            _ => None,
        }
    }

    /// True for a 401 delivered to the caller
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Status { status: 401, .. })
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ClientError::Status {
            status: 422,
            message: "title is required".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 422 - title is required");

        let err = ClientError::Network {
            kind: "connection_failed",
            message: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "Network error (connection_failed): refused");

        let err = ClientError::RefreshRejected(RefreshFailure::MissingToken);
        assert_eq!(
            err.to_string(),
            "Token refresh failed: refresh response does not contain access_token"
        );
    }

    #[test]
    fn test_from_status_truncates_long_bodies() {
        let body = "x".repeat(2000);
        let err = ClientError::from_status(500, &body);
        match err {
            ClientError::Status { status, message } => {
                assert_eq!(status, 500);
                assert!(message.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
                assert!(message.ends_with("(truncated, 2000 total bytes)"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        // 'م' is two bytes in UTF-8
        let body = "م".repeat(400);
        let truncated = ClientError::truncate_body(&body);
        assert!(truncated.contains("truncated, 800 total bytes"));
    }

    #[test]
    fn test_status_accessors() {
        assert!(ClientError::from_status(401, "").is_unauthorized());
        assert!(!ClientError::from_status(403, "").is_unauthorized());
        assert_eq!(ClientError::from_status(404, "").status(), Some(404));

        let err = ClientError::from(RefreshFailure::Rejected {
            status: 401,
            message: "expired".to_string(),
        });
        assert_eq!(err.status(), Some(401));
        assert!(!err.is_unauthorized());
        assert_eq!(ClientError::Timeout(Duration::from_secs(1)).status(), None);
    }

    #[test]
    fn test_refresh_failure_is_cloneable() {
        let failure = RefreshFailure::Transport("connection reset".to_string());
        let copies: Vec<ClientError> = (0..3).map(|_| failure.clone().into()).collect();
        assert!(copies
            .iter()
            .all(|e| e.to_string() == "Token refresh failed: refresh request failed: connection reset"));
    }
}
