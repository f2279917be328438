use anyhow::{Context, Result as AnyResult};
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{CredentialStore, EndpointClassifier};
use crate::error::{ClientError, Result};
use crate::events::SessionEvents;
use crate::models::{ApiResponse, RequestDescriptor};

/// Network seam: sends one fully prepared request and buffers the response.
///
/// A non-success status is still `Ok`; only "no response" is an error.
pub trait Transport: Send + Sync {
    fn send(&self, request: RequestDescriptor) -> BoxFuture<'_, Result<ApiResponse>>;
}

/// Transport backed by a pooled reqwest client with a cookie store
pub struct ReqwestTransport {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Per-call timeout, reported back in `ClientError::Timeout`
    request_timeout: Duration,
}

impl ReqwestTransport {
    /// Create a new transport
    pub fn new(
        max_connections: usize,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> AnyResult<Self> {
        // The refresh call authenticates with an HttpOnly cookie, so cookies
        // set by login/refresh responses must be replayed.
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .cookie_store(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            request_timeout,
        })
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn execute(&self, request: RequestDescriptor) -> Result<ApiResponse> {
        let url = request.url.clone();
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.categorize(e, &url))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.categorize(e, &url))?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    /// Categorize the error for better debugging
    fn categorize(&self, e: reqwest::Error, url: &reqwest::Url) -> ClientError {
        let error_kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else if e.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };

        tracing::warn!(
            error_kind = error_kind,
            error = %e,
            error_debug = ?e,
            url = %url,
            "HTTP request error"
        );

        if e.is_timeout() {
            ClientError::Timeout(self.request_timeout)
        } else {
            ClientError::Network {
                kind: error_kind,
                message: e.to_string(),
            }
        }
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: RequestDescriptor) -> BoxFuture<'_, Result<ApiResponse>> {
        Box::pin(self.execute(request))
    }
}

/// Result of one dispatch: the response and the credentials it was sent with
#[derive(Debug)]
pub struct Dispatched {
    pub response: ApiResponse,
    pub bearer: Option<String>,

    /// `bearer` came from the store's default headers, not the caller
    pub bearer_from_store: bool,

    /// Store clear epoch observed when the call was prepared
    pub epoch: u64,
}

/// Request dispatcher
/// Classifies, attaches credentials and emits loading signals for every call.
/// It has no retry logic of its own.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    classifier: Arc<EndpointClassifier>,
    events: SessionEvents,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        classifier: Arc<EndpointClassifier>,
        events: SessionEvents,
    ) -> Self {
        Self {
            transport,
            store,
            classifier,
            events,
        }
    }

    pub fn classifier(&self) -> &EndpointClassifier {
        &self.classifier
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    /// Send one call and report which bearer token (if any) it carried
    pub async fn dispatch(&self, descriptor: &RequestDescriptor) -> Result<Dispatched> {
        let (defaults, epoch) = self.store.headers_and_epoch().await;
        let outgoing = prepare_request(&self.classifier, descriptor, &defaults);
        let bearer = outgoing.bearer_token().map(str::to_owned);
        let bearer_from_store = bearer.is_some() && !descriptor.has_authorization();

        let method = outgoing.method.clone();
        let url = outgoing.url.clone();

        let loading = self.events.begin_loading();
        tracing::debug!(
            request_id = %loading.request_id(),
            method = %method,
            url = %url,
            authenticated = bearer.is_some(),
            "Sending HTTP request"
        );

        let result = self.transport.send(outgoing).await;
        drop(loading);

        match result {
            Ok(response) => {
                tracing::debug!(
                    status = %response.status,
                    method = %method,
                    url = %url,
                    "Received HTTP response"
                );
                Ok(Dispatched {
                    response,
                    bearer,
                    bearer_from_store,
                    epoch,
                })
            }
            Err(e) => {
                match &e {
                    ClientError::Network { kind, .. } => self.events.metrics().record_error(kind),
                    ClientError::Timeout(_) => self.events.metrics().record_error("timeout"),
                    _ => {}
                }
                Err(e)
            }
        }
    }
}

/// Classify and attach-header stages.
///
/// Auth routes never carry Authorization (explicit or default). Other routes
/// get the store's default headers under their own, so an explicit
/// Authorization always wins.
pub fn prepare_request(
    classifier: &EndpointClassifier,
    descriptor: &RequestDescriptor,
    defaults: &HeaderMap,
) -> RequestDescriptor {
    let mut outgoing = descriptor.clone();
    let is_auth = classifier.is_auth(outgoing.url.as_str());

    for (name, value) in defaults {
        if is_auth && *name == AUTHORIZATION {
            continue;
        }
        if !outgoing.headers.contains_key(name) {
            outgoing.headers.insert(name.clone(), value.clone());
        }
    }

    if is_auth {
        outgoing.headers.remove(AUTHORIZATION);
    }

    outgoing
}
