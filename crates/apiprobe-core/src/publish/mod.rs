//! Fire-and-forget hand-off of payloads to an [`Exporter`].
//!
//! [`Publisher::background`] owns a bounded queue drained by a dedicated
//! worker thread. [`Publisher::send`] never blocks: when the queue is full
//! the payload is dropped and counted. Delivery is at-most-once.

mod export;

pub use export::{CompositeExporter, Exporter, FileExporter, MemoryExporter};
#[cfg(feature = "webhook")]
pub use export::{WebhookConfig, WebhookExporter};

use crate::error::{ProbeError, Result};
use crate::payload::Payload;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default queue capacity of a background publisher.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters describing what happened to sent payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    /// Payloads the exporter accepted.
    pub published: u64,
    /// Payloads dropped before reaching the exporter (queue full, shut down).
    pub dropped: u64,
    /// Payloads the exporter rejected.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PublishStats {
        PublishStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

enum Message {
    Payload(Box<Payload>),
    Flush(mpsc::Sender<()>),
    Shutdown(mpsc::Sender<()>),
}

enum Mode {
    Disabled,
    Inline(Arc<dyn Exporter>),
    Background {
        sender: SyncSender<Message>,
        worker: Mutex<Option<JoinHandle<()>>>,
    },
}

struct Inner {
    mode: Mode,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

/// Hands payloads to an exporter without delaying the request.
///
/// Cheap to clone; clones share the queue and counters.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    fn with_mode(mode: Mode, counters: Arc<Counters>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                counters,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A publisher that discards everything.
    pub fn disabled() -> Self {
        Self::with_mode(Mode::Disabled, Arc::default())
    }

    /// Export on the calling thread.
    ///
    /// Deterministic, meant for tests and for exporters that are themselves
    /// non-blocking.
    pub fn inline(exporter: impl Exporter) -> Self {
        Self::with_mode(Mode::Inline(Arc::new(exporter)), Arc::default())
    }

    /// Export on a worker thread fed by a queue of `capacity` payloads.
    pub fn background(exporter: impl Exporter, capacity: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let exporter: Arc<dyn Exporter> = Arc::new(exporter);

        let worker_counters = Arc::clone(&counters);
        let worker = std::thread::Builder::new()
            .name("apiprobe-publisher".into())
            .spawn(move || run_worker(receiver, exporter, worker_counters))
            .map_err(ProbeError::Worker)?;

        Ok(Self::with_mode(
            Mode::Background {
                sender,
                worker: Mutex::new(Some(worker)),
            },
            counters,
        ))
    }

    /// Hand off a payload. Never blocks and never fails.
    pub fn send(&self, payload: Payload) {
        let counters = &self.inner.counters;
        if self.inner.closed.load(Ordering::Acquire) {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(correlation_id = %payload.correlation_id, "publisher shut down; payload dropped");
            return;
        }

        match &self.inner.mode {
            Mode::Disabled => {}
            Mode::Inline(exporter) => export_one(exporter.as_ref(), &payload, counters),
            Mode::Background { sender, .. } => {
                let correlation_id = payload.correlation_id;
                match sender.try_send(Message::Payload(Box::new(payload))) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%correlation_id, "publish queue full; payload dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        counters.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%correlation_id, "publisher worker gone; payload dropped");
                    }
                }
            }
        }
    }

    /// Wait until every payload sent so far has reached the exporter, then
    /// flush it.
    pub fn flush(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ProbeError::PublisherClosed);
        }
        match &self.inner.mode {
            Mode::Disabled => Ok(()),
            Mode::Inline(exporter) => exporter.flush().map_err(ProbeError::from),
            Mode::Background { sender, .. } => {
                let (ack, done) = mpsc::channel();
                sender
                    .send(Message::Flush(ack))
                    .map_err(|_| ProbeError::PublisherClosed)?;
                done.recv_timeout(SHUTDOWN_TIMEOUT)
                    .map_err(|_| ProbeError::PublisherClosed)
            }
        }
    }

    /// Drain the queue, flush the exporter and stop the worker.
    ///
    /// Later sends are dropped. Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match &self.inner.mode {
            Mode::Disabled => Ok(()),
            Mode::Inline(exporter) => exporter.flush().map_err(ProbeError::from),
            Mode::Background { sender, worker } => {
                let (ack, done) = mpsc::channel();
                if sender.send(Message::Shutdown(ack)).is_ok() {
                    let _ = done.recv_timeout(SHUTDOWN_TIMEOUT);
                }
                let handle = worker
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(handle) = handle {
                    if handle.join().is_err() {
                        tracing::warn!("publisher worker panicked");
                    }
                }
                Ok(())
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PublishStats {
        self.inner.counters.snapshot()
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.inner.mode {
            Mode::Disabled => "disabled",
            Mode::Inline(_) => "inline",
            Mode::Background { .. } => "background",
        };
        f.debug_struct("Publisher")
            .field("mode", &mode)
            .field("stats", &self.stats())
            .finish()
    }
}

fn export_one(exporter: &dyn Exporter, payload: &Payload, counters: &Counters) {
    match exporter.export(payload) {
        Ok(()) => {
            counters.published.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, correlation_id = %payload.correlation_id, "payload export failed");
        }
    }
}

fn finish(exporter: &dyn Exporter) {
    if let Err(e) = exporter.flush() {
        tracing::warn!(error = %e, "final exporter flush failed");
    }
}

// Runs until a shutdown message arrives or every sender is gone.
fn run_worker(receiver: Receiver<Message>, exporter: Arc<dyn Exporter>, counters: Arc<Counters>) {
    tracing::debug!("publisher worker started");
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Payload(payload) => export_one(exporter.as_ref(), &payload, &counters),
            Message::Flush(ack) => {
                if let Err(e) = exporter.flush() {
                    tracing::warn!(error = %e, "exporter flush failed");
                }
                let _ = ack.send(());
            }
            Message::Shutdown(ack) => {
                finish(exporter.as_ref());
                let _ = ack.send(());
                tracing::debug!("publisher worker stopped");
                return;
            }
        }
    }
    finish(exporter.as_ref());
    tracing::debug!("publisher worker stopped");
}
