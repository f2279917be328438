// Token refresh coordination
//
// Single-flight renewal: the first refreshable 401 flips the coordinator to
// Refreshing and issues the only refresh call; every 401 that arrives while it
// is in flight queues behind it. The whole queue is drained exactly once with
// the same outcome.

use reqwest::Url;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

use super::types::{EndpointKind, RefreshResponse};
use crate::error::{ClientError, RefreshFailure};
use crate::events::{LogoutReason, SessionEvent};
use crate::http_client::{Dispatched, Dispatcher};
use crate::models::{PendingRequest, RequestDescriptor};

/// Outcome handed to every waiter of one refresh attempt
pub type RefreshOutcome = std::result::Result<String, RefreshFailure>;

/// Why a 401 is delivered to the caller without a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// login/refresh/logout failures (e.g. bad password) are the caller's business
    AuthEndpoint,
    /// the request was already replayed once
    AlreadyRetried,
    /// no bearer token was involved
    Anonymous,
}

/// Credentials a rejected request was sent with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedCredential {
    pub token: String,

    /// The token was the store's default rather than set by the caller
    pub from_store: bool,

    /// Store clear epoch when the request was sent
    pub epoch: u64,
}

/// How a 401 should be handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    Terminal(TerminalReason),
    /// Queue behind a refresh
    Refreshable(RejectedCredential),
}

enum RefreshState {
    Idle,
    Refreshing {
        waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    },
}

/// Refresh coordinator
/// Owns the Idle/Refreshing state machine and its waiter queue.
///
/// Cloning is cheap; clones share one state machine.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    state: Mutex<RefreshState>,

    /// Dispatcher used for the refresh call (strips bearer on auth routes)
    dispatcher: Dispatcher,

    refresh_url: Url,
}

impl RefreshCoordinator {
    pub fn new(dispatcher: Dispatcher, refresh_url: Url) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                state: Mutex::new(RefreshState::Idle),
                dispatcher,
                refresh_url,
            }),
        }
    }

    /// Decide whether a 401 may enter the refresh queue
    pub fn assess(&self, request: &PendingRequest, sent: &Dispatched) -> Assessment {
        let classifier = self.inner.dispatcher.classifier();
        if classifier.classify(request.descriptor.url.as_str()) == EndpointKind::Auth {
            return Assessment::Terminal(TerminalReason::AuthEndpoint);
        }
        if request.retried {
            return Assessment::Terminal(TerminalReason::AlreadyRetried);
        }
        match &sent.bearer {
            Some(token) => Assessment::Refreshable(RejectedCredential {
                token: token.clone(),
                from_store: sent.bearer_from_store,
                epoch: sent.epoch,
            }),
            None => Assessment::Terminal(TerminalReason::Anonymous),
        }
    }

    /// Wait for a token to replace `rejected`, refreshing if nobody else is
    ///
    /// Exactly one refresh call is in flight at a time; concurrent callers
    /// share its outcome.
    pub async fn fresh_token(&self, rejected: &RejectedCredential) -> RefreshOutcome {
        let store = self.inner.dispatcher.store();

        let receiver = {
            let mut state = self.inner.state.lock().await;
            let (sender, receiver) = oneshot::channel();

            match &mut *state {
                RefreshState::Refreshing { waiters } => {
                    waiters.push(sender);
                    tracing::debug!(waiters = waiters.len(), "Queued behind in-flight token refresh");
                }
                RefreshState::Idle => {
                    let (current, epoch) = store.token_and_epoch().await;

                    // Logged out after this request was sent: nothing to renew
                    if epoch != rejected.epoch {
                        return Err(RefreshFailure::SessionCleared);
                    }

                    // Someone already refreshed after this request was sent.
                    // A caller-supplied bearer is never swapped for the stored one.
                    if rejected.from_store {
                        if let Some(current) = current.filter(|t| *t != rejected.token) {
                            tracing::debug!("Token changed since request was sent, replaying with current token");
                            return Ok(current);
                        }
                    }

                    *state = RefreshState::Refreshing {
                        waiters: vec![sender],
                    };

                    // Runs on its own task so a cancelled caller never strands the queue
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { inner.run_refresh(epoch).await });
                }
            }

            receiver
        };

        receiver.await.unwrap_or_else(|_| {
            Err(RefreshFailure::Transport(
                "token refresh ended without a result".to_string(),
            ))
        })
    }

    pub async fn is_refreshing(&self) -> bool {
        matches!(*self.inner.state.lock().await, RefreshState::Refreshing { .. })
    }

    /// Waiters queued behind the current refresh
    pub async fn waiter_count(&self) -> usize {
        match &*self.inner.state.lock().await {
            RefreshState::Refreshing { waiters } => waiters.len(),
            RefreshState::Idle => 0,
        }
    }
}

impl CoordinatorInner {
    async fn run_refresh(&self, epoch: u64) {
        let store = self.dispatcher.store();
        let events = self.dispatcher.events();

        tracing::info!("Refreshing access token...");
        events.metrics().record_refresh_attempt();
        events.emit(SessionEvent::RefreshStarted);

        let outcome = match self.request_refresh().await {
            Ok(token) => {
                // Committed before any waiter is released, so no retry sees the old token
                if store.commit_refreshed(token.clone(), epoch).await {
                    tracing::info!("Access token refreshed");
                    events.emit(SessionEvent::TokenRefreshed);
                    Ok(token)
                } else {
                    tracing::warn!("Session was cleared during token refresh, discarding new token");
                    Err(RefreshFailure::SessionCleared)
                }
            }
            Err(failure) => {
                tracing::error!("Token refresh failed: {}", failure);
                Err(failure)
            }
        };

        if let Err(ref failure) = outcome {
            events.metrics().record_refresh_failure();
            // A logout that raced the refresh already cleared the session
            if *failure != RefreshFailure::SessionCleared {
                store.clear().await;
                events.emit(SessionEvent::LoggedOut {
                    reason: LogoutReason::RefreshFailed,
                });
            }
        }

        let waiters = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, RefreshState::Idle) {
                RefreshState::Refreshing { waiters } => waiters,
                RefreshState::Idle => Vec::new(),
            }
        };

        tracing::debug!(
            waiters = waiters.len(),
            success = outcome.is_ok(),
            "Releasing token refresh waiters"
        );

        for waiter in waiters {
            // A waiter whose own timeout already fired has dropped its receiver
            let _ = waiter.send(outcome.clone());
        }
    }

    /// POST to the refresh endpoint; it authenticates by cookie, never bearer
    async fn request_refresh(&self) -> RefreshOutcome {
        let request = RequestDescriptor::post(self.refresh_url.clone())
            .json(&serde_json::json!({}))
            .map_err(|e| RefreshFailure::Transport(e.to_string()))?;

        let sent = self
            .dispatcher
            .dispatch(&request)
            .await
            .map_err(|e| RefreshFailure::Transport(e.to_string()))?;

        let response = sent.response;
        if !response.is_success() {
            return Err(RefreshFailure::Rejected {
                status: response.status.as_u16(),
                message: ClientError::truncate_body(&response.text()),
            });
        }

        let data: RefreshResponse = response
            .json()
            .map_err(|_| RefreshFailure::MissingToken)?;

        data.access_token
            .filter(|token| !token.is_empty())
            .ok_or(RefreshFailure::MissingToken)
    }
}
