//! Session client: the staged chain around a single `send`.
//!
//! classify → attach-header → dispatch → handle-401. The first three stages
//! live in the [`Dispatcher`]; this module adds the 401 stage, which consults
//! the [`RefreshCoordinator`] and replays through the [`RetryExecutor`].

use anyhow::Context;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::auth::{Assessment, CredentialStore, EndpointClassifier, RefreshCoordinator};
use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::events::{LogoutReason, SessionEvent, SessionEvents};
use crate::http_client::{Dispatcher, ReqwestTransport, Transport};
use crate::metrics::SessionMetrics;
use crate::models::{ApiResponse, PendingRequest, RequestDescriptor};
use crate::profile::{extract_user, ProfileCache};
use crate::retry::RetryExecutor;

/// Marketplace API client with automatic token refresh.
///
/// Cloning is cheap; clones share the session, the refresh state machine and
/// the event channel.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    base_url: Url,
    store: CredentialStore,
    dispatcher: Dispatcher,
    coordinator: RefreshCoordinator,
    retry: RetryExecutor,
    events: SessionEvents,
    profile: ProfileCache,
    logout_path: String,
    profile_path: String,

    /// Longest a request waits in the refresh queue
    refresh_wait: Duration,
}

impl SessionClient {
    /// Client talking to the network through reqwest
    pub fn new(config: &Config, store: CredentialStore) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(
            config.http_max_connections,
            config.connect_timeout(),
            config.request_timeout(),
        )?;
        Self::with_transport(config, store, Arc::new(transport))
    }

    /// Client over an arbitrary transport
    pub fn with_transport(
        config: &Config,
        store: CredentialStore,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let base_url = config.base_url()?;
        let refresh_url = base_url
            .join(&config.refresh_path)
            .with_context(|| format!("Invalid refresh path: {}", config.refresh_path))?;

        let classifier = Arc::new(EndpointClassifier::new(
            &config.login_path,
            &config.refresh_path,
            &config.logout_path,
        ));
        let events = SessionEvents::new(Arc::new(SessionMetrics::new()));
        let dispatcher = Dispatcher::new(transport, store.clone(), classifier, events.clone());
        let coordinator = RefreshCoordinator::new(dispatcher.clone(), refresh_url);
        let retry = RetryExecutor::new(dispatcher.clone());

        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url,
                store,
                dispatcher,
                coordinator,
                retry,
                events,
                profile: ProfileCache::new(config.profile_cache_ttl),
                logout_path: config.logout_path.clone(),
                profile_path: config.profile_path.clone(),
                refresh_wait: config.request_timeout(),
            }),
        })
    }

    // ==========================================================================
    // Request helpers
    // ==========================================================================

    /// Resolve `path` against the base URL
    pub fn url(&self, path: &str) -> Result<Url> {
        self.inner
            .base_url
            .join(path)
            .map_err(|e| ClientError::InvalidRequest(format!("invalid path {}: {}", path, e)))
    }

    pub fn request(&self, method: Method, path: &str) -> Result<RequestDescriptor> {
        Ok(RequestDescriptor::new(method, self.url(path)?))
    }

    pub fn get(&self, path: &str) -> Result<RequestDescriptor> {
        self.request(Method::GET, path)
    }

    pub fn delete(&self, path: &str) -> Result<RequestDescriptor> {
        self.request(Method::DELETE, path)
    }

    pub fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<RequestDescriptor> {
        self.request(Method::POST, path)?.json(body)
    }

    /// GET `path` and decode the JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.get(path)?).await?.json()
    }

    // ==========================================================================
    // The chain
    // ==========================================================================

    /// Send a call, refreshing the token and replaying once on an expired-token 401.
    ///
    /// Non-success statuses come back as `ClientError::Status` with the body
    /// untouched; only 401 is ever intercepted.
    pub async fn send(&self, descriptor: RequestDescriptor) -> Result<ApiResponse> {
        let mut request = PendingRequest::new(descriptor);
        let sent = self.inner.dispatcher.dispatch(&request.descriptor).await?;
        if !sent.response.is_unauthorized() {
            return sent.response.error_for_status();
        }

        let rejected = match self.inner.coordinator.assess(&request, &sent) {
            Assessment::Refreshable(rejected) => rejected,
            Assessment::Terminal(reason) => {
                tracing::debug!(?reason, url = %request.descriptor.url, "401 delivered without refresh");
                return self.deliver_unauthorized(sent.response);
            }
        };

        tracing::debug!(url = %request.descriptor.url, "Access token rejected, waiting for refresh");
        let token = tokio::time::timeout(
            self.inner.refresh_wait,
            self.inner.coordinator.fresh_token(&rejected),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.inner.refresh_wait))??;

        let replayed = self.inner.retry.retry(&mut request, &token).await?;
        if replayed.response.is_unauthorized() {
            tracing::warn!(url = %request.descriptor.url, "Replayed request rejected again");
            return self.deliver_unauthorized(replayed.response);
        }
        replayed.response.error_for_status()
    }

    fn deliver_unauthorized(&self, response: ApiResponse) -> Result<ApiResponse> {
        self.inner.events.metrics().record_terminal_unauthorized();
        response.error_for_status()
    }

    // ==========================================================================
    // Session lifecycle
    // ==========================================================================

    /// Login-success hook: adopt the access token the login call returned
    pub async fn complete_login(&self, access_token: String) {
        self.inner.profile.clear().await;
        self.inner.store.set_token(access_token).await;
        tracing::info!("Session established");
    }

    /// Tell the server, then forget the session whatever it answered
    pub async fn logout(&self) {
        match self.post_json(&self.inner.logout_path, &serde_json::json!({})) {
            Ok(request) => {
                if let Err(e) = self.send(request).await {
                    tracing::warn!("Logout request failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("Could not build logout request: {}", e),
        }

        self.inner.store.clear().await;
        self.inner.profile.clear().await;
        self.inner.events.emit(SessionEvent::LoggedOut {
            reason: LogoutReason::UserRequested,
        });
        tracing::info!("Logged out");
    }

    /// Fetch the signed-in user, served from cache unless stale or `force`
    ///
    /// Returns `None` when the response holds no user record.
    pub async fn fetch_profile(&self, force: bool) -> Result<Option<Value>> {
        if !force {
            if let Some(user) = self.inner.profile.fresh().await {
                return Ok(Some(user));
            }
        }

        let response = match self.send(self.get(&self.inner.profile_path)?).await {
            Ok(response) => response,
            Err(e) if e.is_unauthorized() => {
                if self.inner.store.token().await.is_some() {
                    tracing::warn!("Profile bootstrap unauthorized, clearing session");
                    self.inner.store.clear().await;
                    self.inner.events.emit(SessionEvent::LoggedOut {
                        reason: LogoutReason::ProfileUnauthorized,
                    });
                }
                self.inner.profile.clear().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let body: Value = response.json()?;
        match extract_user(&body) {
            Some(user) => Ok(Some(self.inner.profile.merge(user).await)),
            None => {
                tracing::warn!("Profile response did not contain a user record");
                Ok(None)
            }
        }
    }

    // ==========================================================================
    // Accessors
    // ==========================================================================

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        self.inner.events.metrics()
    }

    pub fn profile(&self) -> &ProfileCache {
        &self.inner.profile
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RefreshFailure;
    use crate::events::drain;
    use futures::future::BoxFuture;
    use reqwest::header::AUTHORIZATION;
    use reqwest::StatusCode;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Fake API: /api/refresh issues "fresh" after `gate` opens, protected
    /// routes accept only "fresh", login always refuses.
    struct FakeApi {
        log: Mutex<Vec<(String, Option<String>)>>,
        gate: Notify,
        refresh_status: StatusCode,
        gated: bool,
    }

    impl FakeApi {
        fn new(refresh_status: StatusCode, gated: bool) -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                gate: Notify::new(),
                refresh_status,
                gated,
            })
        }

        fn calls_to(&self, path: &str) -> usize {
            self.log.lock().unwrap().iter().filter(|(p, _)| p == path).count()
        }
    }

    impl Transport for FakeApi {
        fn send(&self, request: RequestDescriptor) -> BoxFuture<'_, Result<ApiResponse>> {
            let path = request.url.path().to_string();
            let bearer = request.bearer_token().map(str::to_owned);
            self.log.lock().unwrap().push((path.clone(), bearer.clone()));

            Box::pin(async move {
                match path.as_str() {
                    "/api/refresh" => {
                        if self.gated {
                            self.gate.notified().await;
                        }
                        let body = if self.refresh_status.is_success() {
                            r#"{"access_token":"fresh"}"#
                        } else {
                            r#"{"message":"refresh token expired"}"#
                        };
                        Ok(ApiResponse::new(self.refresh_status, body))
                    }
                    "/api/login" => Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, r#"{"message":"bad credentials"}"#)),
                    "/api/logout" => Ok(ApiResponse::new(StatusCode::OK, "{}")),
                    _ => match bearer.as_deref() {
                        Some("fresh") => Ok(ApiResponse::new(StatusCode::OK, r#"{"data":{"id":1,"name":"Sara"}}"#)),
                        _ => Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, r#"{"message":"Unauthenticated."}"#)),
                    },
                }
            })
        }
    }

    async fn client(api: Arc<FakeApi>, token: Option<&str>) -> SessionClient {
        let mut config = Config::for_base_url("http://localhost:8000");
        config.http_request_timeout = 2;
        let store = CredentialStore::in_memory();
        if let Some(token) = token {
            store.set_token(token.to_string()).await;
        }
        SessionClient::with_transport(&config, store, api).unwrap()
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_and_replayed() {
        let api = FakeApi::new(StatusCode::OK, false);
        let client = client(api.clone(), Some("expired")).await;

        let response = client.send(client.get("/api/auctions").unwrap()).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(api.calls_to("/api/refresh"), 1);
        let log = api.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                ("/api/auctions".to_string(), Some("expired".to_string())),
                ("/api/refresh".to_string(), None),
                ("/api/auctions".to_string(), Some("fresh".to_string())),
            ]
        );
        assert_eq!(client.store().token().await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_anonymous_401_is_not_refreshed() {
        let api = FakeApi::new(StatusCode::OK, false);
        let client = client(api.clone(), None).await;

        let err = client.send(client.get("/api/auctions").unwrap()).await.unwrap_err();

        assert!(err.is_unauthorized());
        assert_eq!(api.calls_to("/api/refresh"), 0);
        assert_eq!(client.metrics().snapshot().terminal_unauthorized, 1);
    }

    #[tokio::test]
    async fn test_login_401_passes_through() {
        let api = FakeApi::new(StatusCode::OK, false);
        let client = client(api.clone(), Some("expired")).await;

        let req = client
            .post_json("/api/login", &serde_json::json!({"email": "a@b.c", "password": "x"}))
            .unwrap();
        let err = client.send(req).await.unwrap_err();

        assert!(err.is_unauthorized());
        assert!(err.to_string().contains("bad credentials"));
        assert_eq!(api.calls_to("/api/refresh"), 0);
        // login never carries the stored bearer
        assert_eq!(api.log.lock().unwrap()[0].1, None);
    }

    #[tokio::test]
    async fn test_waiter_timeout_reaches_caller() {
        let api = FakeApi::new(StatusCode::OK, true);
        let mut config = Config::for_base_url("http://localhost:8000");
        config.http_request_timeout = 1;
        let store = CredentialStore::in_memory();
        store.set_token("expired".to_string()).await;
        let client = SessionClient::with_transport(&config, store, api.clone()).unwrap();

        let err = client.send(client.get("/api/auctions").unwrap()).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));

        // The refresh is still in flight and completes for later callers
        api.gate.notify_one();
        for _ in 0..100 {
            if !client.coordinator().is_refreshing().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.store().token().await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_logout_during_refresh_rejects_waiter() {
        let api = FakeApi::new(StatusCode::OK, true);
        let client = client(api.clone(), Some("expired")).await;

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.send(client.get("/api/auctions")?).await })
        };
        for _ in 0..100 {
            if client.coordinator().waiter_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        client.logout().await;
        api.gate.notify_one();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClientError::RefreshRejected(RefreshFailure::SessionCleared)
        ));
        assert_eq!(client.store().token().await, None);
        // logout route is auth-classified and carries no bearer
        assert!(api
            .log
            .lock()
            .unwrap()
            .iter()
            .any(|(p, b)| p == "/api/logout" && b.is_none()));
    }

    #[tokio::test]
    async fn test_profile_bootstrap_uses_cache() {
        let api = FakeApi::new(StatusCode::OK, false);
        let client = client(api.clone(), Some("fresh")).await;

        let user = client.fetch_profile(false).await.unwrap().unwrap();
        assert_eq!(user["name"], "Sara");

        client.fetch_profile(false).await.unwrap();
        assert_eq!(api.calls_to("/api/user/profile"), 1);

        client.fetch_profile(true).await.unwrap();
        assert_eq!(api.calls_to("/api/user/profile"), 2);
    }

    #[tokio::test]
    async fn test_profile_refresh_failure_logs_out_once() {
        let api = FakeApi::new(StatusCode::UNAUTHORIZED, false);
        let client = client(api.clone(), Some("expired")).await;
        let mut rx = client.subscribe();

        let err = client.fetch_profile(true).await.unwrap_err();

        assert!(matches!(err, ClientError::RefreshRejected(RefreshFailure::Rejected { status: 401, .. })));
        assert_eq!(client.store().token().await, None);
        let logouts: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::LoggedOut { .. }))
            .collect();
        assert_eq!(
            logouts,
            vec![SessionEvent::LoggedOut {
                reason: LogoutReason::RefreshFailed
            }]
        );
    }

    #[tokio::test]
    async fn test_explicit_bearer_without_session_is_refreshed() {
        let api = FakeApi::new(StatusCode::OK, false);
        let client = client(api.clone(), None).await;

        let req = client.get("/api/auctions").unwrap().bearer("expired-explicit").unwrap();
        let response = client.send(req).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        let log = api.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                ("/api/auctions".to_string(), Some("expired-explicit".to_string())),
                ("/api/refresh".to_string(), None),
                ("/api/auctions".to_string(), Some("fresh".to_string())),
            ]
        );
    }

    /// Logs the session out while a protected call is on the wire
    struct LogoutOnTheWire {
        store: CredentialStore,
        refresh_calls: std::sync::atomic::AtomicUsize,
    }

    impl Transport for LogoutOnTheWire {
        fn send(&self, request: RequestDescriptor) -> BoxFuture<'_, Result<ApiResponse>> {
            Box::pin(async move {
                if request.url.path() == "/api/refresh" {
                    self.refresh_calls
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    return Ok(ApiResponse::new(StatusCode::OK, r#"{"access_token":"fresh"}"#));
                }
                self.store.clear().await;
                Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, ""))
            })
        }
    }

    #[tokio::test]
    async fn test_logout_while_request_in_flight_is_not_undone() {
        let store = CredentialStore::in_memory();
        store.set_token("expired".to_string()).await;
        let transport = Arc::new(LogoutOnTheWire {
            store: store.clone(),
            refresh_calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let config = Config::for_base_url("http://localhost:8000");
        let client = SessionClient::with_transport(&config, store, transport.clone()).unwrap();

        let err = client.send(client.get("/api/auctions").unwrap()).await.unwrap_err();

        assert!(matches!(
            err,
            ClientError::RefreshRejected(RefreshFailure::SessionCleared)
        ));
        assert_eq!(
            transport.refresh_calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert_eq!(client.store().token().await, None);
    }

    #[tokio::test]
    async fn test_complete_login_sets_default_header() {
        let api = FakeApi::new(StatusCode::OK, false);
        let client = client(api, None).await;

        client.complete_login("fresh".to_string()).await;

        assert!(client.store().is_authenticated().await);
        assert_eq!(
            client.store().default_headers().await[AUTHORIZATION],
            "Bearer fresh"
        );
    }
}
