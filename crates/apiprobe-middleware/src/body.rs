//! Body duplication for `http_body` hosts.
//!
//! [`TeeBody`] hands every response frame to the client untouched and keeps
//! a capped copy of the data frames. The request is finalised once the last
//! frame has gone out, when the body fails, or when it is dropped before its
//! end (the client went away).
//!
//! [`TeeRequestBody`] does the same for the request body on its way to the
//! handler.

use apiprobe_core::{
    CaptureBuffer, ErrorKind, HandlerOutcome, ProbeContext, ReportedError, RequestProbe,
    ResponseSnapshot, SharedCapture,
};
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

/// The in-flight half of a request whose response is still streaming.
pub struct ResponseCapture {
    probe: RequestProbe,
    response: ResponseSnapshot,
    buffer: Option<CaptureBuffer>,
}

impl ResponseCapture {
    /// Start capturing the response described by `parts`.
    ///
    /// Body bytes are only kept when the probe's configuration asks for them.
    pub fn new(probe: RequestProbe, parts: &http::response::Parts) -> Self {
        let config = probe.context().probe().config();
        let buffer = config
            .captures_response_body()
            .then(|| CaptureBuffer::new(config.get_max_body_size()));
        Self {
            response: ResponseSnapshot::from_parts(parts),
            buffer,
            probe,
        }
    }

    /// Copy a chunk of body data.
    pub fn record(&mut self, chunk: &[u8]) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.extend(chunk);
        }
    }

    /// The body ended normally.
    pub fn complete(self) {
        let ResponseCapture {
            probe,
            mut response,
            buffer,
        } = self;
        if let Some(buffer) = buffer {
            response.body = Some(buffer.finish());
        }
        probe.finish(HandlerOutcome::Completed(()), response);
    }

    /// The body failed while streaming.
    pub fn fail(self, error: impl fmt::Display) {
        tracing::debug!(
            parent: self.probe.context().span(),
            correlation_id = %self.probe.context().id(),
            error = %error,
            "response body failed"
        );
        self.probe.context().errors().push(ReportedError::message(
            ErrorKind::BodyStream,
            format!("response body error: {error}"),
        ));
        self.complete();
    }

    /// The body was dropped before its end.
    pub fn abandon(self) {
        self.probe.context().errors().push(ReportedError::message(
            ErrorKind::Cancelled,
            "response body dropped before end of stream",
        ));
        self.complete();
    }
}

impl fmt::Debug for ResponseCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCapture")
            .field("probe", &self.probe)
            .field("status", &self.response.status)
            .field("captured", &self.buffer.as_ref().map(CaptureBuffer::observed))
            .finish()
    }
}

pin_project! {
    /// A response body that copies its data frames as they are polled.
    pub struct TeeBody<B> {
        #[pin]
        inner: B,
        capture: Option<ResponseCapture>,
        ended: bool,
    }

    impl<B> PinnedDrop for TeeBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(capture) = this.capture.take() {
                if *this.ended {
                    capture.complete();
                } else {
                    capture.abandon();
                }
            }
        }
    }
}

impl<B> TeeBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: fmt::Display,
{
    /// Wrap `inner`, finalising through `capture`.
    pub fn new(inner: B, capture: ResponseCapture) -> Self {
        // hosts may drop a complete body without polling it
        let ended = inner.is_end_stream();
        Self {
            inner,
            capture: Some(capture),
            ended,
        }
    }

    /// Wrap `inner` without capturing anything.
    pub fn passthrough(inner: B) -> Self {
        Self {
            inner,
            capture: None,
            ended: false,
        }
    }

    /// Whether this body still has a request to finalise.
    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        let polled = match this.capture.as_ref() {
            Some(capture) => {
                let ctx = capture.probe.context();
                let _entered = ctx.span().enter();
                ctx.sync_scope(|| this.inner.as_mut().poll_frame(cx))
            }
            None => this.inner.as_mut().poll_frame(cx),
        };
        let result = ready!(polled);

        match &result {
            Some(Ok(frame)) => {
                if let (Some(capture), Some(data)) = (this.capture.as_mut(), frame.data_ref()) {
                    capture.record(data);
                }
                // the frame goes out first; the next poll or the drop finalises
                *this.ended = this.inner.is_end_stream();
            }
            Some(Err(error)) => {
                if let Some(capture) = this.capture.take() {
                    capture.fail(error);
                }
            }
            None => {
                *this.ended = true;
                if let Some(capture) = this.capture.take() {
                    capture.complete();
                }
            }
        }

        Poll::Ready(result)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: fmt::Debug> fmt::Debug for TeeBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeBody")
            .field("inner", &self.inner)
            .field("capture", &self.capture)
            .field("ended", &self.ended)
            .finish()
    }
}

pin_project! {
    /// A request body that copies its data frames as the handler reads them.
    ///
    /// Frames and errors reach the handler unchanged. A stream error is also
    /// recorded on the request.
    pub struct TeeRequestBody<B> {
        #[pin]
        inner: B,
        capture: Option<SharedCapture>,
        ctx: Option<ProbeContext>,
    }
}

impl<B> TeeRequestBody<B> {
    /// Wrap `inner`, reporting errors to `ctx` and copying data into
    /// `capture` when given.
    pub fn new(inner: B, ctx: ProbeContext, capture: Option<SharedCapture>) -> Self {
        Self {
            inner,
            capture,
            ctx: Some(ctx),
        }
    }

    /// Wrap `inner` without capturing anything.
    pub fn passthrough(inner: B) -> Self {
        Self {
            inner,
            capture: None,
            ctx: None,
        }
    }

    /// The wrapped body.
    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B> Body for TeeRequestBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let result = ready!(this.inner.poll_frame(cx));

        match &result {
            Some(Ok(frame)) => {
                if let (Some(capture), Some(data)) = (this.capture.as_ref(), frame.data_ref()) {
                    capture.extend(data);
                }
            }
            Some(Err(error)) => {
                if let Some(ctx) = this.ctx.take() {
                    tracing::debug!(
                        parent: ctx.span(),
                        correlation_id = %ctx.id(),
                        error = %error,
                        "request body failed"
                    );
                    ctx.errors().push(ReportedError::message(
                        ErrorKind::BodyStream,
                        format!("request body error: {error}"),
                    ));
                }
            }
            None => {}
        }

        Poll::Ready(result)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: fmt::Debug> fmt::Debug for TeeRequestBody<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeRequestBody")
            .field("inner", &self.inner)
            .field("captured", &self.capture.as_ref().map(SharedCapture::observed))
            .finish()
    }
}
