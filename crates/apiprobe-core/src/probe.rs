//! The probe handle and the per-request finalisation every adapter shares.
//!
//! An adapter calls [`Probe::begin`] once the request is captured, runs the
//! handler, and hands the outcome to [`RequestProbe::finish`]. `finish`
//! builds and publishes the payload and then gives the outcome back; for a
//! panic that means the caller resumes it only after publishing.
//!
//! ```text
//! Capturing -> Finalizing -> Published
//!                         -> PublishedThenPanicked
//! ```

use crate::capture::SharedCapture;
use crate::config::ProbeConfig;
use crate::context::ProbeContext;
use crate::error::Result;
use crate::outgoing::parent_id_from;
use crate::payload::{Exchange, PayloadBuilder, RequestSnapshot, ResponseSnapshot, SdkKind};
use crate::publish::Publisher;
use crate::redact::Redactor;
use crate::report::{ErrorKind, ReportedError};
use http::StatusCode;
use serde_json::Value;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Status reported when the client went away before the handler finished.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

struct ProbeInner {
    config: ProbeConfig,
    builder: PayloadBuilder,
    publisher: Publisher,
}

/// Configured capture pipeline, shared by every request.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Probe {
    inner: Arc<ProbeInner>,
}

impl Probe {
    /// Compile `config` and attach `publisher`.
    ///
    /// Fails if a redaction rule does not parse.
    pub fn new(config: ProbeConfig, publisher: Publisher) -> Result<Self> {
        let builder = PayloadBuilder::new(&config)?;
        Ok(Self {
            inner: Arc::new(ProbeInner {
                config,
                builder,
                publisher,
            }),
        })
    }

    /// The configuration.
    pub fn config(&self) -> &ProbeConfig {
        &self.inner.config
    }

    /// The publisher.
    pub fn publisher(&self) -> &Publisher {
        &self.inner.publisher
    }

    /// The payload builder.
    pub fn builder(&self) -> &PayloadBuilder {
        &self.inner.builder
    }

    /// The compiled redaction rules.
    pub fn redactor(&self) -> &Redactor {
        self.inner.builder.redactor()
    }

    /// Whether a request for `path` should be captured at all.
    pub fn should_capture(&self, path: &str) -> bool {
        !self.inner.config.should_skip_path(path)
    }

    /// Start capturing one request.
    ///
    /// Mints the correlation id, opens the request span and reads the
    /// upstream parent id from the request headers.
    pub fn begin(&self, request: RequestSnapshot, sdk: SdkKind) -> RequestProbe {
        let span = if self.inner.config.trace_requests {
            tracing::info_span!(
                "apiprobe.request",
                correlation_id = tracing::field::Empty,
                method = %request.method,
                path = %request.uri.path(),
                route = request.path_template.as_deref().unwrap_or(""),
                status = tracing::field::Empty,
                duration_ms = tracing::field::Empty,
            )
        } else {
            tracing::Span::none()
        };

        let parent_id = parent_id_from(&request.headers);
        let context = ProbeContext::new(self.clone(), parent_id, span);
        tracing::debug!(
            parent: context.span(),
            correlation_id = %context.id(),
            sdk = %sdk,
            "capturing request"
        );

        RequestProbe {
            context,
            request: Some(request),
            request_body: None,
            sdk,
            extra: None,
            state: ProbeState::Capturing,
        }
    }

    /// Build and publish a payload for a finished exchange.
    pub fn publish(&self, exchange: Exchange) {
        let payload = self.inner.builder.build(exchange);
        if self.inner.config.debug {
            match serde_json::to_string(&payload) {
                Ok(json) => tracing::debug!(correlation_id = %payload.correlation_id, payload = %json, "publishing payload"),
                Err(e) => tracing::debug!(correlation_id = %payload.correlation_id, error = %e, "payload not serializable"),
            }
        }
        self.inner.publisher.send(payload);
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("service_name", &self.inner.config.service_name)
            .field("publisher", &self.inner.publisher)
            .finish()
    }
}

/// How the wrapped handler ended.
pub enum HandlerOutcome<T> {
    /// The handler returned.
    Completed(T),
    /// The handler panicked with this payload.
    Panicked(Box<dyn Any + Send + 'static>),
}

impl<T> HandlerOutcome<T> {
    /// Convert the result of `catch_unwind`.
    pub fn from_result(result: std::thread::Result<T>) -> Self {
        match result {
            Ok(value) => HandlerOutcome::Completed(value),
            Err(panic) => HandlerOutcome::Panicked(panic),
        }
    }

    /// Whether the handler panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, HandlerOutcome::Panicked(_))
    }

    /// Return the value, or re-raise the original panic unchanged.
    pub fn resume(self) -> T {
        match self {
            HandlerOutcome::Completed(value) => value,
            HandlerOutcome::Panicked(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl<T> From<std::thread::Result<T>> for HandlerOutcome<T> {
    fn from(result: std::thread::Result<T>) -> Self {
        Self::from_result(result)
    }
}

impl<T: fmt::Debug> fmt::Debug for HandlerOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerOutcome::Completed(value) => f.debug_tuple("Completed").field(value).finish(),
            HandlerOutcome::Panicked(_) => f.write_str("Panicked(..)"),
        }
    }
}

/// Lifecycle of one captured request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// The handler is running and bytes are being captured.
    Capturing,
    /// The payload is being built.
    Finalizing,
    /// The payload was handed to the publisher.
    Published,
    /// The payload was handed to the publisher and the panic is about to be
    /// re-raised.
    PublishedThenPanicked,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProbeState::Capturing => "capturing",
            ProbeState::Finalizing => "finalizing",
            ProbeState::Published => "published",
            ProbeState::PublishedThenPanicked => "published_then_panicked",
        })
    }
}

/// One request between [`Probe::begin`] and [`RequestProbe::finish`].
///
/// Dropping it unfinished still publishes a best-effort payload with status
/// 499 and a `cancelled` error.
pub struct RequestProbe {
    context: ProbeContext,
    request: Option<RequestSnapshot>,
    request_body: Option<SharedCapture>,
    sdk: SdkKind,
    extra: Option<Value>,
    state: ProbeState,
}

impl RequestProbe {
    /// The request's context.
    pub fn context(&self) -> &ProbeContext {
        &self.context
    }

    /// The captured request, until the payload is built.
    pub fn request(&self) -> Option<&RequestSnapshot> {
        self.request.as_ref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Take the request body from `capture` when the payload is built.
    ///
    /// For adapters that stream the request body to the handler: the payload
    /// records whatever had flowed through by then.
    pub fn stream_request_body(&mut self, capture: SharedCapture) {
        self.request_body = Some(capture);
    }

    /// Attach extra data to the payload.
    pub fn set_extra(&mut self, extra: Value) {
        self.extra = Some(extra);
    }

    /// Build and publish the payload, then hand `outcome` back.
    ///
    /// A panic is recorded as an error and forces status 500 in the payload.
    /// The caller is expected to [`resume`](HandlerOutcome::resume) the
    /// returned outcome.
    pub fn finish<T>(mut self, outcome: HandlerOutcome<T>, response: ResponseSnapshot) -> HandlerOutcome<T> {
        let response = match &outcome {
            HandlerOutcome::Completed(_) => response,
            HandlerOutcome::Panicked(panic) => {
                self.context
                    .errors()
                    .push(ReportedError::from_panic(panic.as_ref()));
                ResponseSnapshot {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    ..response
                }
            }
        };

        self.publish(response);
        if outcome.is_panic() {
            self.state = ProbeState::PublishedThenPanicked;
        }
        tracing::debug!(
            parent: self.context.span(),
            correlation_id = %self.context.id(),
            state = %self.state,
            "request finalised"
        );
        outcome
    }

    fn publish(&mut self, response: ResponseSnapshot) {
        let Some(mut request) = self.request.take() else {
            return;
        };
        if let Some(capture) = self.request_body.take() {
            request.body = Some(capture.snapshot());
        }
        self.state = ProbeState::Finalizing;

        let errors = self.context.errors().seal();
        let span = self.context.span();
        span.record("status", response.status.as_u16());
        span.record("duration_ms", request.started.elapsed().as_millis() as u64);

        let exchange = Exchange {
            sdk: self.sdk.clone(),
            correlation_id: self.context.id(),
            parent_id: self.context.parent_id(),
            request,
            response,
            errors,
            extra: self.extra.take(),
        };
        self.context.probe().publish(exchange);
        self.state = ProbeState::Published;
    }
}

impl Drop for RequestProbe {
    fn drop(&mut self) {
        if self.request.is_none() {
            return;
        }
        tracing::debug!(
            parent: self.context.span(),
            correlation_id = %self.context.id(),
            "request dropped before the handler finished"
        );
        self.context.errors().push(ReportedError::message(
            ErrorKind::Cancelled,
            "request dropped before the handler finished",
        ));
        let status = StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST);
        self.publish(ResponseSnapshot::new(status));
    }
}

impl fmt::Debug for RequestProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestProbe")
            .field("correlation_id", &self.context.id())
            .field("sdk", &self.sdk)
            .field("state", &self.state)
            .finish()
    }
}
