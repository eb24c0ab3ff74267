//! Delivery sinks for finished payloads.
//!
//! The transport is outside the probe's concern; an [`Exporter`] is the
//! boundary. Any `Fn(&Payload)` closure is an exporter. The sinks here cover
//! memory, JSON lines, fan-out, and an HTTP webhook behind the `webhook`
//! feature.

use crate::error::{ExportError, ExportResult};
use crate::payload::Payload;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Where finished payloads go.
///
/// `export` runs on the publisher's worker thread, or on the request's own
/// thread for an inline publisher. A returned error is logged and counted as
/// a failed payload; the request never sees it.
pub trait Exporter: Send + Sync + 'static {
    /// Deliver one payload.
    fn export(&self, payload: &Payload) -> ExportResult<()>;

    /// Push out anything held back. Called by [`Publisher::flush`] and once
    /// more when the publisher shuts down.
    ///
    /// [`Publisher::flush`]: super::Publisher::flush
    fn flush(&self) -> ExportResult<()> {
        Ok(())
    }
}

/// A closure receives every payload and cannot fail.
///
/// ```ignore
/// let publisher = Publisher::background(
///     |payload: &Payload| println!("{} {}", payload.request.method, payload.request.path),
///     1024,
/// )?;
/// ```
impl<F> Exporter for F
where
    F: Fn(&Payload) + Send + Sync + 'static,
{
    fn export(&self, payload: &Payload) -> ExportResult<()> {
        self(payload);
        Ok(())
    }
}

fn lock_sink<T>(mutex: &Mutex<T>) -> ExportResult<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| ExportError::Poisoned)
}

/// Keeps payloads in memory.
///
/// Clones share storage, so a test can hand one clone to the publisher and
/// inspect the other.
#[derive(Clone, Default)]
pub struct MemoryExporter {
    shared: Arc<(Mutex<Vec<Payload>>, Condvar)>,
}

impl MemoryExporter {
    /// Create an empty exporter.
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Payload>> {
        self.shared
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copies of every payload received so far.
    pub fn payloads(&self) -> Vec<Payload> {
        self.entries().clone()
    }

    /// Remove and return every payload received so far.
    pub fn take(&self) -> Vec<Payload> {
        std::mem::take(&mut *self.entries())
    }

    /// Number of payloads received.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether nothing was received.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until at least `count` payloads arrived or `timeout` elapsed,
    /// then return what is there.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Payload> {
        let deadline = Instant::now() + timeout;
        let (lock, ready) = &*self.shared;
        let mut entries = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while entries.len() < count {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            entries = match ready.wait_timeout(entries, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        entries.clone()
    }
}

impl Exporter for MemoryExporter {
    fn export(&self, payload: &Payload) -> ExportResult<()> {
        self.entries().push(payload.clone());
        self.shared.1.notify_all();
        Ok(())
    }
}

/// Appends payloads to a file as JSON lines.
///
/// ```ignore
/// use apiprobe_core::publish::FileExporter;
///
/// let exporter = FileExporter::new("./payloads.jsonl")?;
/// ```
#[derive(Clone)]
pub struct FileExporter {
    path: PathBuf,
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl FileExporter {
    /// Create or append to the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> ExportResult<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// The file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Exporter for FileExporter {
    fn export(&self, payload: &Payload) -> ExportResult<()> {
        let line = serde_json::to_string(payload)?;
        let mut writer = lock_sink(&self.writer)?;
        writeln!(writer, "{}", line)?;
        Ok(())
    }

    fn flush(&self) -> ExportResult<()> {
        lock_sink(&self.writer)?.flush()?;
        Ok(())
    }
}

/// Sends every payload to several exporters.
///
/// Every sink is tried even when an earlier one fails. If any failed, the
/// call returns [`ExportError::Sinks`] listing each failure, so the payload is
/// counted as failed although the other sinks received it.
#[derive(Default)]
pub struct CompositeExporter {
    sinks: Vec<Box<dyn Exporter>>,
}

impl CompositeExporter {
    /// Create an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with_exporter<E: Exporter>(mut self, exporter: E) -> Self {
        self.sinks.push(Box::new(exporter));
        self
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    fn each(&self, mut op: impl FnMut(&dyn Exporter) -> ExportResult<()>) -> ExportResult<()> {
        let failures: Vec<ExportError> = self
            .sinks
            .iter()
            .filter_map(|sink| op(sink.as_ref()).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExportError::Sinks {
                total: self.sinks.len(),
                failures,
            })
        }
    }
}

impl Exporter for CompositeExporter {
    fn export(&self, payload: &Payload) -> ExportResult<()> {
        self.each(|sink| sink.export(payload))
    }

    fn flush(&self) -> ExportResult<()> {
        self.each(|sink| sink.flush())
    }
}

#[cfg(feature = "webhook")]
pub use webhook::{WebhookConfig, WebhookExporter};

#[cfg(feature = "webhook")]
mod webhook {
    use super::{lock_sink, Exporter};
    use crate::error::{ExportError, ExportResult};
    use crate::payload::Payload;
    use std::sync::{mpsc, Arc, Mutex};
    use std::time::Duration;

    /// Webhook exporter configuration.
    #[derive(Clone, Debug)]
    pub struct WebhookConfig {
        /// URL payload batches are POSTed to.
        pub url: String,
        /// Optional `Authorization` header value.
        pub auth_header: Option<String>,
        /// Extra headers sent with every request.
        pub headers: Vec<(String, String)>,
        /// Payloads buffered before a POST.
        pub batch_size: usize,
        /// Request timeout in seconds.
        pub timeout_secs: u64,
    }

    impl WebhookConfig {
        /// Configuration for `url` with a batch size of 1.
        pub fn new(url: impl Into<String>) -> Self {
            Self {
                url: url.into(),
                auth_header: None,
                headers: Vec::new(),
                batch_size: 1,
                timeout_secs: 10,
            }
        }

        /// Set the `Authorization` header.
        pub fn auth(mut self, value: impl Into<String>) -> Self {
            self.auth_header = Some(value.into());
            self
        }

        /// Add a header.
        pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.headers.push((name.into(), value.into()));
            self
        }

        /// Set the batch size.
        pub fn batch_size(mut self, size: usize) -> Self {
            self.batch_size = size.max(1);
            self
        }

        /// Set the request timeout.
        pub fn timeout(mut self, secs: u64) -> Self {
            self.timeout_secs = secs;
            self
        }
    }

    /// POSTs payloads as a JSON array.
    #[derive(Clone)]
    pub struct WebhookExporter {
        config: WebhookConfig,
        buffer: Arc<Mutex<Vec<Payload>>>,
        client: reqwest::Client,
    }

    impl WebhookExporter {
        /// Create an exporter for `config`.
        pub fn new(config: WebhookConfig) -> ExportResult<Self> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .map_err(|e| ExportError::Transport(e.to_string()))?;

            Ok(Self {
                config,
                buffer: Arc::new(Mutex::new(Vec::new())),
                client,
            })
        }

        /// The configuration.
        pub fn config(&self) -> &WebhookConfig {
            &self.config
        }

        // Runs the request on its own thread and runtime, so it works both
        // from the publisher worker and from inside a tokio runtime.
        fn send(&self, payloads: Vec<Payload>) -> ExportResult<()> {
            let (tx, rx) = mpsc::channel();
            let client = self.client.clone();
            let config = self.config.clone();
            let wait = Duration::from_secs(self.config.timeout_secs + 1);

            std::thread::Builder::new()
                .name("apiprobe-webhook".into())
                .spawn(move || {
                    let result = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .map_err(|e| ExportError::Transport(e.to_string()))
                        .and_then(|rt| rt.block_on(post(&client, &config, &payloads)));
                    let _ = tx.send(result);
                })
                .map_err(|e| ExportError::Transport(e.to_string()))?;

            rx.recv_timeout(wait)
                .map_err(|_| ExportError::TimedOut(wait))?
        }
    }

    async fn post(client: &reqwest::Client, config: &WebhookConfig, payloads: &[Payload]) -> ExportResult<()> {
        let mut request = client.post(&config.url).json(payloads);
        if let Some(auth) = &config.auth_header {
            request = request.header("Authorization", auth);
        }
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ExportError::Rejected {
                status: status.as_u16(),
            })
        }
    }

    impl Exporter for WebhookExporter {
        fn export(&self, payload: &Payload) -> ExportResult<()> {
            let mut buffer = lock_sink(&self.buffer)?;
            buffer.push(payload.clone());
            if buffer.len() < self.config.batch_size {
                return Ok(());
            }
            let batch = std::mem::take(&mut *buffer);
            drop(buffer);
            self.send(batch)
        }

        fn flush(&self) -> ExportResult<()> {
            let batch = std::mem::take(&mut *lock_sink(&self.buffer)?);
            if batch.is_empty() {
                return Ok(());
            }
            self.send(batch)
        }
    }

}
