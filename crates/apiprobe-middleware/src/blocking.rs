//! Adapter for hosts that write responses through [`std::io::Write`].
//!
//! The handler runs on the calling thread. Everything it writes goes
//! straight to the host's body sink; a capped copy is kept for the payload.
//! The status and headers the handler sets come back in a
//! [`BlockingOutcome`] for the host to send.

use crate::route::MatchedRoute;
use apiprobe_core::{
    CaptureBuffer, CapturedBody, HandlerOutcome, Probe, RequestSnapshot, ResponseSnapshot,
    SdkKind, TeeWriter,
};
use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// The response a blocking handler writes to.
#[derive(Debug)]
pub struct BlockingResponse<W> {
    status: StatusCode,
    headers: HeaderMap,
    writer: TeeWriter<W>,
}

impl<W: Write> BlockingResponse<W> {
    fn new(sink: W, limit: usize) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            writer: TeeWriter::new(sink, limit),
        }
    }

    /// Set the status. Defaults to 200.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// The status set so far.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The headers set so far.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The host's sink.
    pub fn sink(&self) -> &W {
        self.writer.get_ref()
    }

    /// Bytes accepted by the sink so far.
    pub fn written(&self) -> usize {
        self.writer.written()
    }

    fn into_parts(self) -> (StatusCode, HeaderMap, W, CaptureBuffer) {
        let (sink, buffer) = self.writer.into_parts();
        (self.status, self.headers, sink, buffer)
    }
}

/// What the host sends after [`handle`] returns.
#[derive(Debug)]
pub struct BlockingOutcome<T, W> {
    /// The handler's return value.
    pub value: T,
    /// Status set by the handler.
    pub status: StatusCode,
    /// Headers set by the handler.
    pub headers: HeaderMap,
    /// The host's body sink.
    pub sink: W,
}

impl<W: Write> Write for BlockingResponse<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Run `handler` for `request`, capture the exchange and publish it.
///
/// Returns the handler's value with the status, headers and sink, exactly
/// as the handler left them. If the handler panics, the payload is published
/// with status 500 and the panic is then resumed.
///
/// ```rust,ignore
/// let outcome = apiprobe_middleware::blocking::handle(
///     &probe,
///     request,
///     MatchedRoute::new("/users/{id}").param("id", "42"),
///     stream,
///     |req, res| {
///         res.set_status(StatusCode::OK);
///         res.write_all(b"{\"id\":42}")
///     },
/// );
/// send_head(outcome.status, &outcome.headers, outcome.sink)?;
/// ```
pub fn handle<W, T, F>(
    probe: &Probe,
    request: Request<Bytes>,
    route: MatchedRoute,
    sink: W,
    handler: F,
) -> BlockingOutcome<T, W>
where
    W: Write,
    F: FnOnce(&Request<Bytes>, &mut BlockingResponse<W>) -> T,
{
    let config = probe.config();
    if !probe.should_capture(request.uri().path()) {
        let mut response = BlockingResponse::new(sink, 0);
        let value = handler(&request, &mut response);
        let (status, headers, sink, _) = response.into_parts();
        return BlockingOutcome {
            value,
            status,
            headers,
            sink,
        };
    }

    let mut request = request;
    let mut snapshot =
        RequestSnapshot::from_request(&request).with_route(route.template, route.params);
    if let Some(addr) = request.extensions().get::<SocketAddr>() {
        snapshot = snapshot.with_remote_addr(addr.ip().to_string());
    }
    if config.captures_request_body() {
        snapshot = snapshot.with_body(CapturedBody::from_bytes(
            request.body(),
            config.get_max_body_size(),
        ));
    }

    let probe_request = probe.begin(snapshot, SdkKind::Blocking);
    let ctx = probe_request.context().clone();
    request.extensions_mut().insert(ctx.clone());

    let limit = if config.captures_response_body() {
        config.get_max_body_size()
    } else {
        0
    };
    let mut response = BlockingResponse::new(sink, limit);
    let result = {
        let _entered = ctx.span().enter();
        ctx.sync_scope(|| catch_unwind(AssertUnwindSafe(|| handler(&request, &mut response))))
    };

    let (status, headers, sink, buffer) = response.into_parts();
    let mut snapshot = ResponseSnapshot::new(status).with_headers(headers.clone());
    if config.captures_response_body() {
        snapshot = snapshot.with_body(buffer.finish());
    }

    let outcome = probe_request.finish(HandlerOutcome::from_result(result), snapshot);
    BlockingOutcome {
        value: outcome.resume(),
        status,
        headers,
        sink,
    }
}
