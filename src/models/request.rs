use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::Serialize;

use crate::error::{ClientError, Result};

// ==================================================================================================
// Request Descriptor
// ==================================================================================================

/// Everything needed to (re)send a call: method, url, headers and buffered body.
///
/// Bodies are buffered so the same call can be replayed after a token refresh.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    /// Add a header, rejecting values that are not valid header text
    pub fn header(mut self, name: HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| ClientError::InvalidRequest(format!("invalid {} header: {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Explicitly authenticate this call with the given bearer token
    pub fn bearer(mut self, token: &str) -> Result<Self> {
        self.set_bearer(token)?;
        Ok(self)
    }

    /// Serialize `body` as the JSON payload
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| ClientError::InvalidRequest(format!("failed to encode JSON body: {}", e)))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    /// Replace any Authorization header with `Bearer <token>`
    pub fn set_bearer(&mut self, token: &str) -> Result<()> {
        self.headers.insert(AUTHORIZATION, bearer_header(token)?);
        Ok(())
    }

    /// Bearer token carried by the Authorization header, if any
    pub fn bearer_token(&self) -> Option<&str> {
        bearer_from_headers(&self.headers)
    }

    pub fn has_authorization(&self) -> bool {
        self.headers.contains_key(AUTHORIZATION)
    }
}

/// A dispatched call and its replay flag.
///
/// `retried` flips to true exactly once, when the call is replayed after a
/// token refresh. A retried request never enters the refresh queue again.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub descriptor: RequestDescriptor,
    pub retried: bool,
}

impl PendingRequest {
    pub fn new(descriptor: RequestDescriptor) -> Self {
        Self {
            descriptor,
            retried: false,
        }
    }
}

impl From<RequestDescriptor> for PendingRequest {
    fn from(descriptor: RequestDescriptor) -> Self {
        Self::new(descriptor)
    }
}

// ==================================================================================================
// Header helpers
// ==================================================================================================

/// Build an `Authorization: Bearer <token>` header value
pub fn bearer_header(token: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| ClientError::InvalidRequest(format!("invalid bearer token: {}", e)))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Extract the token from an `Authorization: Bearer <token>` header
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
        Some(token)
    } else {
        None
    }
}
