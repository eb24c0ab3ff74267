//! Non-destructive duplication of body bytes.
//!
//! [`CaptureBuffer`] keeps a capped copy of every chunk it is shown and
//! remembers how many bytes it has seen in total. [`TeeWriter`] puts one in
//! front of any [`std::io::Write`] sink; the HTTP body variants live in the
//! middleware crate. [`SharedCapture`] is the handle a streaming request body
//! fills while the probe holds the other end.

use bytes::{Bytes, BytesMut};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// Default cap on captured body bytes (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// A growable copy of body bytes with an upper bound.
///
/// Bytes past `limit` are counted but not kept.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    bytes: BytesMut,
    limit: usize,
    observed: usize,
}

impl CaptureBuffer {
    /// Create a buffer that keeps at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: BytesMut::new(),
            limit,
            observed: 0,
        }
    }

    /// Record a chunk.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.observed = self.observed.saturating_add(chunk.len());
        let room = self.limit.saturating_sub(self.bytes.len());
        let keep = room.min(chunk.len());
        if keep > 0 {
            self.bytes.extend_from_slice(&chunk[..keep]);
        }
    }

    /// Bytes kept so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total bytes seen, including the ones past the cap.
    pub fn observed(&self) -> usize {
        self.observed
    }

    /// Whether some bytes were dropped because of the cap.
    pub fn is_truncated(&self) -> bool {
        self.observed > self.bytes.len()
    }

    /// Freeze into a [`CapturedBody`].
    pub fn finish(self) -> CapturedBody {
        let truncated = self.is_truncated();
        CapturedBody {
            size: self.observed,
            truncated,
            bytes: self.bytes.freeze(),
        }
    }
}

/// A finished body copy, ready for the payload builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedBody {
    /// Retained bytes (at most the configured cap).
    pub bytes: Bytes,
    /// Full size of the body as it flowed through.
    pub size: usize,
    /// Whether `bytes` is only a prefix of the body.
    pub truncated: bool,
}

impl CapturedBody {
    /// Capture an already complete body, keeping at most `limit` bytes.
    ///
    /// The retained prefix shares the allocation with `body`.
    pub fn from_bytes(body: &Bytes, limit: usize) -> Self {
        let keep = body.len().min(limit);
        Self {
            bytes: body.slice(..keep),
            size: body.len(),
            truncated: keep < body.len(),
        }
    }

    /// Whether the body had no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// A [`CaptureBuffer`] filled by one owner and read by another.
///
/// Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct SharedCapture {
    buffer: Arc<Mutex<CaptureBuffer>>,
}

impl SharedCapture {
    /// Create an empty shared buffer keeping at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(CaptureBuffer::new(limit))),
        }
    }

    /// Record a chunk.
    pub fn extend(&self, chunk: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(chunk);
    }

    /// Total bytes seen so far.
    pub fn observed(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observed()
    }

    /// Copy out what has been captured so far.
    pub fn snapshot(&self) -> CapturedBody {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .finish()
    }
}

/// A writer that forwards everything to `inner` and keeps a copy.
///
/// Only the bytes `inner` actually accepted are recorded, and every result
/// (count or error) is returned unchanged, so the wrapped sink behaves
/// exactly as before from the caller's side.
#[derive(Debug)]
pub struct TeeWriter<W> {
    inner: W,
    buffer: CaptureBuffer,
}

impl<W: Write> TeeWriter<W> {
    /// Wrap `inner`, keeping at most `limit` bytes.
    pub fn new(inner: W, limit: usize) -> Self {
        Self {
            inner,
            buffer: CaptureBuffer::new(limit),
        }
    }

    /// Bytes captured so far.
    pub fn captured(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    /// Total bytes written through the tee.
    pub fn written(&self) -> usize {
        self.buffer.observed()
    }

    /// Borrow the wrapped sink.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Split into the wrapped sink and the capture.
    pub fn into_parts(self) -> (W, CaptureBuffer) {
        (self.inner, self.buffer)
    }
}

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.buffer.extend(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
