//! The normalized telemetry record and how it is assembled.
//!
//! A [`Payload`] is built once per request by [`PayloadBuilder`] from the raw
//! [`RequestSnapshot`] and [`ResponseSnapshot`] an adapter captured. It owns
//! all of its data; once built it is handed to the publisher and never
//! touched again.

mod builder;
mod snapshot;

pub use builder::{Exchange, PayloadBuilder};
pub use snapshot::{RequestSnapshot, ResponseSnapshot};

use crate::context::CorrelationId;
use crate::headers::HeaderList;
use crate::report::ReportedError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

/// Which integration produced a payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SdkKind {
    /// The generic tower layer.
    Tower,
    /// The axum integration.
    Axum,
    /// The `std::io::Write` adapter.
    Blocking,
    /// A client-side call recorded on behalf of a request.
    Outgoing,
    /// A host-specific integration.
    Custom(String),
}

impl SdkKind {
    /// Wire name, e.g. `apiprobe-tower`.
    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            SdkKind::Tower => Cow::Borrowed("apiprobe-tower"),
            SdkKind::Axum => Cow::Borrowed("apiprobe-axum"),
            SdkKind::Blocking => Cow::Borrowed("apiprobe-blocking"),
            SdkKind::Outgoing => Cow::Borrowed("apiprobe-outgoing"),
            SdkKind::Custom(name) => Cow::Borrowed(name.as_str()),
        }
    }

    fn from_wire(name: String) -> Self {
        match name.as_str() {
            "apiprobe-tower" => SdkKind::Tower,
            "apiprobe-axum" => SdkKind::Axum,
            "apiprobe-blocking" => SdkKind::Blocking,
            "apiprobe-outgoing" => SdkKind::Outgoing,
            _ => SdkKind::Custom(name),
        }
    }
}

impl fmt::Display for SdkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl Serialize for SdkKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for SdkKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(SdkKind::from_wire)
    }
}

/// A captured body as it appears in the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BodyRecord {
    /// Body capture is disabled.
    Omitted,
    /// The body had no bytes.
    Empty,
    /// A structured body, parsed and redacted.
    Json {
        /// The redacted document.
        value: Value,
        /// Size of the raw body in bytes.
        size: usize,
    },
    /// A textual body, reported verbatim.
    Text {
        /// The (possibly truncated) text.
        text: String,
        /// Size of the raw body in bytes.
        size: usize,
        /// Whether `text` is only a prefix.
        truncated: bool,
    },
    /// A body that was not parsed: binary, malformed, or truncated.
    Opaque {
        /// Base64 of the retained bytes.
        base64: String,
        /// Size of the raw body in bytes.
        size: usize,
        /// Whether only a prefix was retained.
        truncated: bool,
    },
}

impl BodyRecord {
    /// The parsed document, for structured bodies.
    pub fn json(&self) -> Option<&Value> {
        match self {
            BodyRecord::Json { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Size of the raw body, zero when omitted.
    pub fn size(&self) -> usize {
        match self {
            BodyRecord::Omitted | BodyRecord::Empty => 0,
            BodyRecord::Json { size, .. }
            | BodyRecord::Text { size, .. }
            | BodyRecord::Opaque { size, .. } => *size,
        }
    }

    /// Whether the record holds only a prefix of the body.
    pub fn is_truncated(&self) -> bool {
        matches!(
            self,
            BodyRecord::Text { truncated: true, .. } | BodyRecord::Opaque { truncated: true, .. }
        )
    }
}

/// Request half of a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// HTTP method.
    pub method: String,
    /// Full URL with the redacted query string.
    pub url: String,
    /// Request path without the query.
    pub path: String,
    /// Route pattern, e.g. `/users/{id}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_template: Option<String>,
    /// Path parameters extracted by the router (redacted).
    #[serde(default)]
    pub path_params: BTreeMap<String, String>,
    /// Raw query string (redacted).
    #[serde(default)]
    pub query_string: String,
    /// Decoded query parameters (redacted).
    #[serde(default)]
    pub query_params: BTreeMap<String, Vec<String>>,
    /// Request headers (redacted).
    pub headers: HeaderList,
    /// Request body (redacted when structured).
    pub body: BodyRecord,
    /// Host the request was addressed to.
    #[serde(default)]
    pub host: String,
    /// Address of the client, empty when unknown.
    #[serde(default)]
    pub client_ip: String,
    /// HTTP version, e.g. `HTTP/1.1`.
    pub http_version: String,
}

/// Response half of a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    /// Status code. Forced to 500 when the handler panicked.
    pub status: u16,
    /// Response headers (redacted).
    pub headers: HeaderList,
    /// Response body (redacted when structured).
    pub body: BodyRecord,
}

/// One request/response pair, ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Id tying this payload to the request's errors and span.
    pub correlation_id: CorrelationId,
    /// Id of the request this one was made on behalf of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<CorrelationId>,
    /// Integration that produced the payload.
    pub sdk: SdkKind,
    /// Request start (Unix milliseconds).
    pub timestamp: u64,
    /// Time from request start to payload build, in nanoseconds.
    pub duration_ns: u64,
    /// Service name from configuration.
    pub service_name: String,
    /// Service version from configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_version: Option<String>,
    /// Tags from configuration.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Request data.
    pub request: RequestRecord,
    /// Response data.
    pub response: ResponseRecord,
    /// Errors reported while handling the request, in order.
    #[serde(default)]
    pub errors: Vec<ReportedError>,
    /// Caller-provided extra data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl Payload {
    /// Whether the request failed: a 5xx status or at least one error.
    pub fn is_error(&self) -> bool {
        self.response.status >= 500 || !self.errors.is_empty()
    }
}
