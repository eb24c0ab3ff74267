use crate::capture::CapturedBody;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime};

/// Raw request data as the adapter saw it.
///
/// Holds the original, unredacted values. It is filled in while the request
/// is being set up and then moved into the probe; nothing mutates it after
/// that.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    /// HTTP method.
    pub method: Method,
    /// Request target.
    pub uri: Uri,
    /// HTTP version.
    pub version: Version,
    /// Request headers.
    pub headers: HeaderMap,
    /// Route pattern, when the host router exposes one.
    pub path_template: Option<String>,
    /// Path parameters, when the host router exposes them.
    pub path_params: BTreeMap<String, String>,
    /// Captured body, `None` when body capture is off.
    pub body: Option<CapturedBody>,
    /// Peer address supplied by the host, used when no proxy header names
    /// the client.
    pub remote_addr: Option<String>,
    /// Monotonic request start.
    pub started: Instant,
    /// Wall-clock request start.
    pub started_at: SystemTime,
}

impl RequestSnapshot {
    /// Start a snapshot for `method uri`, stamped now.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            path_template: None,
            path_params: BTreeMap::new(),
            body: None,
            remote_addr: None,
            started: Instant::now(),
            started_at: SystemTime::now(),
        }
    }

    /// Copy method, URI, version and headers out of request parts.
    pub fn from_parts(parts: &http::request::Parts) -> Self {
        Self {
            version: parts.version,
            headers: parts.headers.clone(),
            ..Self::new(parts.method.clone(), parts.uri.clone())
        }
    }

    /// Copy method, URI, version and headers out of a whole request.
    pub fn from_request<B>(request: &http::Request<B>) -> Self {
        Self {
            version: request.version(),
            headers: request.headers().clone(),
            ..Self::new(request.method().clone(), request.uri().clone())
        }
    }

    /// Set the route pattern and path parameters.
    pub fn with_route(
        mut self,
        template: Option<String>,
        params: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.path_template = template;
        self.path_params = params.into_iter().collect();
        self
    }

    /// Set the headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Attach the captured body.
    pub fn with_body(mut self, body: CapturedBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the peer address.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }
}

/// Raw response data as the adapter saw it.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    /// Status written by the handler.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Captured body, `None` when body capture is off.
    pub body: Option<CapturedBody>,
}

impl ResponseSnapshot {
    /// A response with `status`, no headers and no body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Copy status and headers out of response parts.
    pub fn from_parts(parts: &http::response::Parts) -> Self {
        Self {
            status: parts.status,
            headers: parts.headers.clone(),
            body: None,
        }
    }

    /// Set the headers.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Attach the captured body.
    pub fn with_body(mut self, body: CapturedBody) -> Self {
        self.body = Some(body);
        self
    }
}
