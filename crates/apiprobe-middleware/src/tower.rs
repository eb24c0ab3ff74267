//! Tower middleware.
//!
//! Works with any `tower::Service<http::Request<B>>` that accepts the
//! wrapped request body: hyper services, axum routers, tonic-style stacks.
//! The request body streams to the handler through [`TeeRequestBody`]; the
//! payload records what the handler read.
//!
//! # Example
//!
//! ```rust,ignore
//! use apiprobe_middleware::{ProbeLayer, TemplateRoutes};
//! use tower::ServiceBuilder;
//!
//! let svc = ServiceBuilder::new()
//!     .layer(ProbeLayer::new(probe).with_resolver(TemplateRoutes::new(["/users/{id}"])?))
//!     .service(app);
//! ```

use crate::body::{ResponseCapture, TeeBody, TeeRequestBody};
use crate::route::{ExtensionRoute, RouteResolver};
use apiprobe_core::{
    ErrorKind, HandlerOutcome, Probe, ReportedError, RequestSnapshot, ResponseSnapshot, SdkKind,
    SharedCapture,
};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::{Request, Response, StatusCode};
use http_body::Body;
use std::convert::Infallible;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

/// Layer that captures every request passing through the wrapped service.
#[derive(Clone)]
pub struct ProbeLayer<R = ExtensionRoute> {
    probe: Probe,
    resolver: R,
    sdk: SdkKind,
}

impl ProbeLayer {
    /// Capture with `probe`, reading routes from a [`MatchedRoute`](crate::MatchedRoute)
    /// request extension.
    pub fn new(probe: Probe) -> Self {
        Self {
            probe,
            resolver: ExtensionRoute,
            sdk: SdkKind::Tower,
        }
    }
}

impl<R> ProbeLayer<R> {
    /// Use another route resolver.
    pub fn with_resolver<R2: RouteResolver>(self, resolver: R2) -> ProbeLayer<R2> {
        ProbeLayer {
            probe: self.probe,
            resolver,
            sdk: self.sdk,
        }
    }

    /// Tag payloads with `sdk`.
    pub fn sdk(mut self, sdk: SdkKind) -> Self {
        self.sdk = sdk;
        self
    }

    /// The probe.
    pub fn probe(&self) -> &Probe {
        &self.probe
    }
}

impl<R> fmt::Debug for ProbeLayer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeLayer")
            .field("probe", &self.probe)
            .field("sdk", &self.sdk)
            .finish()
    }
}

impl<S, R: Clone> Layer<S> for ProbeLayer<R> {
    type Service = ProbeService<S, R>;

    fn layer(&self, inner: S) -> Self::Service {
        ProbeService {
            inner,
            probe: self.probe.clone(),
            resolver: self.resolver.clone(),
            sdk: self.sdk.clone(),
        }
    }
}

/// Service produced by [`ProbeLayer`].
#[derive(Clone)]
pub struct ProbeService<S, R = ExtensionRoute> {
    inner: S,
    probe: Probe,
    resolver: R,
    sdk: SdkKind,
}

impl<S, R> ProbeService<S, R> {
    /// The wrapped service.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: fmt::Debug, R> fmt::Debug for ProbeService<S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeService")
            .field("inner", &self.inner)
            .field("sdk", &self.sdk)
            .finish()
    }
}

impl<S, R, ReqBody, ResBody> Service<Request<ReqBody>> for ProbeService<S, R>
where
    S: Service<Request<TeeRequestBody<ReqBody>>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    R: RouteResolver,
    ReqBody: Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: fmt::Display,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: fmt::Display,
{
    type Response = Response<TeeBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // the clone is not ready; keep the one that is
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !self.probe.should_capture(req.uri().path()) {
            let req = req.map(TeeRequestBody::passthrough);
            return Box::pin(async move {
                let response = inner.call(req).await?;
                Ok(response.map(TeeBody::passthrough))
            });
        }

        let probe = self.probe.clone();
        let sdk = self.sdk.clone();
        let (mut parts, body) = req.into_parts();
        let route = self.resolver.resolve(&parts);
        let remote_addr = self.resolver.remote_addr(&parts);

        Box::pin(async move {
            let mut snapshot =
                RequestSnapshot::from_parts(&parts).with_route(route.template, route.params);
            if let Some(addr) = remote_addr {
                snapshot = snapshot.with_remote_addr(addr);
            }

            let mut request = probe.begin(snapshot, sdk);
            let ctx = request.context().clone();
            let capture = probe
                .config()
                .captures_request_body()
                .then(|| SharedCapture::new(probe.config().get_max_body_size()));
            if let Some(capture) = &capture {
                request.stream_request_body(capture.clone());
            }
            parts.extensions.insert(ctx.clone());
            let req = Request::from_parts(parts, TeeRequestBody::new(body, ctx.clone(), capture));

            let handler = AssertUnwindSafe(async move { inner.call(req).await }).catch_unwind();
            let outcome = ctx.scope(handler).instrument(ctx.span().clone()).await;

            match outcome {
                Ok(Ok(response)) => {
                    let (parts, body) = response.into_parts();
                    let capture = ResponseCapture::new(request, &parts);
                    Ok(Response::from_parts(parts, TeeBody::new(body, capture)))
                }
                Ok(Err(error)) => {
                    tracing::debug!(
                        parent: ctx.span(),
                        correlation_id = %ctx.id(),
                        error = %error,
                        "inner service failed"
                    );
                    ctx.errors()
                        .push(ReportedError::message(ErrorKind::Service, error.to_string()));
                    request.finish(
                        HandlerOutcome::Completed(()),
                        ResponseSnapshot::new(StatusCode::INTERNAL_SERVER_ERROR),
                    );
                    Err(error)
                }
                Err(panic) => {
                    let outcome = request.finish(
                        HandlerOutcome::<Infallible>::Panicked(panic),
                        ResponseSnapshot::new(StatusCode::INTERNAL_SERVER_ERROR),
                    );
                    match outcome.resume() {}
                }
            }
        })
    }
}
