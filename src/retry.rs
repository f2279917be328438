// Replay of a request after a successful token refresh

use crate::error::Result;
use crate::http_client::{Dispatched, Dispatcher};
use crate::models::PendingRequest;

/// Retry executor
/// Replays a request once with the token the refresh just committed.
#[derive(Clone)]
pub struct RetryExecutor {
    dispatcher: Dispatcher,
}

impl RetryExecutor {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Mark `request` retried and send it again with `new_token`.
    ///
    /// Whatever comes back, a second 401 included, belongs to the caller:
    /// a retried request never re-enters the refresh queue.
    pub async fn retry(&self, request: &mut PendingRequest, new_token: &str) -> Result<Dispatched> {
        request.retried = true;
        request.descriptor.set_bearer(new_token)?;

        self.dispatcher.events().metrics().record_retry();
        tracing::debug!(
            method = %request.descriptor.method,
            url = %request.descriptor.url,
            "Replaying request with refreshed token"
        );

        self.dispatcher.dispatch(&request.descriptor).await
    }
}
