//! Correlation of calls a handler makes to other services.
//!
//! The handler forwards [`PARENT_ID_HEADER`] so the downstream service can
//! link its payload to this request, and may record the client-side view of
//! the call with [`ProbeContext::record_outgoing`].

use crate::context::{CorrelationId, ProbeContext};
use crate::payload::{Exchange, RequestSnapshot, ResponseSnapshot, SdkKind};
use crate::report::ReportedError;
use http::{HeaderMap, HeaderValue};

/// Header carrying the caller's correlation id.
pub const PARENT_ID_HEADER: &str = "x-apiprobe-parent-id";

/// Read an upstream correlation id; malformed values are ignored.
pub(crate) fn parent_id_from(headers: &HeaderMap) -> Option<CorrelationId> {
    let value = headers.get(PARENT_ID_HEADER)?.to_str().ok()?;
    match value.parse() {
        Ok(id) => Some(id),
        Err(e) => {
            tracing::debug!(error = %e, value, "ignoring malformed parent id header");
            None
        }
    }
}

impl ProbeContext {
    /// Headers to add to an outgoing request made on behalf of this one.
    pub fn outgoing_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        self.inject_headers(&mut headers);
        headers
    }

    /// Add the correlation header to an existing header map.
    pub fn inject_headers(&self, headers: &mut HeaderMap) {
        // a hyphenated UUID is always a valid header value
        if let Ok(value) = HeaderValue::from_str(&self.id().to_string()) {
            headers.insert(PARENT_ID_HEADER, value);
        }
    }

    /// Publish a payload for an outgoing call made while handling this
    /// request.
    ///
    /// The payload gets its own correlation id, with this request's id as
    /// its parent. Returns the new id.
    pub fn record_outgoing(&self, request: RequestSnapshot, response: ResponseSnapshot) -> CorrelationId {
        self.record_outgoing_with_errors(request, response, Vec::new())
    }

    /// Like [`record_outgoing`](Self::record_outgoing), attaching errors the
    /// client saw.
    pub fn record_outgoing_with_errors(
        &self,
        request: RequestSnapshot,
        response: ResponseSnapshot,
        errors: Vec<ReportedError>,
    ) -> CorrelationId {
        let id = CorrelationId::new();
        tracing::debug!(
            parent: self.span(),
            correlation_id = %id,
            parent_id = %self.id(),
            "recording outgoing call"
        );
        self.probe().publish(Exchange {
            sdk: SdkKind::Outgoing,
            correlation_id: id,
            parent_id: Some(self.id()),
            request,
            response,
            errors,
            extra: None,
        });
        id
    }
}
