//! Per-request error reporting.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How an error entered the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Reported explicitly by handler code.
    Reported,
    /// The handler panicked.
    Panic,
    /// Reading the request body or streaming the response body failed.
    BodyStream,
    /// The wrapped service returned an error instead of a response.
    Service,
    /// The request was dropped before the handler finished.
    Cancelled,
}

/// One error attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
    /// When the error was reported (Unix milliseconds).
    pub timestamp: u64,
    /// Origin of the error.
    pub kind: ErrorKind,
    /// Rust type name of the reported error.
    pub error_type: String,
    /// `Display` of the error.
    pub message: String,
    /// `Display` of the deepest `source()`, when the error has a chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_error: Option<String>,
    /// Backtrace at the reporting site, when backtraces are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ReportedError {
    /// Describe an error value.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: StdError + ?Sized,
    {
        let mut root: Option<&dyn StdError> = None;
        let mut next = err.source();
        while let Some(source) = next {
            root = Some(source);
            next = source.source();
        }

        Self {
            timestamp: unix_millis(SystemTime::now()),
            kind: ErrorKind::Reported,
            error_type: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            root_error: root.map(|e| e.to_string()),
            stack_trace: capture_backtrace(),
        }
    }

    /// Describe a panic payload as caught by `catch_unwind`.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with a non-string payload".to_string()
        };

        Self {
            timestamp: unix_millis(SystemTime::now()),
            kind: ErrorKind::Panic,
            error_type: "panic".to_string(),
            message,
            root_error: None,
            stack_trace: capture_backtrace(),
        }
    }

    /// A plain message with no error value behind it.
    pub fn message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: unix_millis(SystemTime::now()),
            kind,
            error_type: "message".to_string(),
            message: message.into(),
            root_error: None,
            stack_trace: None,
        }
    }

    /// Override the kind.
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

fn capture_backtrace() -> Option<String> {
    let trace = Backtrace::capture();
    match trace.status() {
        BacktraceStatus::Captured => Some(trace.to_string()),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct Entries {
    errors: Vec<ReportedError>,
    sealed: bool,
}

/// Ordered list of errors for one request.
///
/// Appends keep their order. Once [`seal`](Self::seal) has been called the
/// list is frozen: later reports are dropped, so a payload never contains an
/// error reported after it was built.
#[derive(Debug, Default)]
pub struct ErrorCollector {
    entries: Mutex<Entries>,
}

impl ErrorCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    // A handler that panicked while holding the lock must not cost us the
    // errors it reported before that.
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Report an error value. Returns `false` if the collector is sealed.
    pub fn report<E>(&self, err: &E) -> bool
    where
        E: StdError + ?Sized,
    {
        self.push(ReportedError::from_error(err))
    }

    /// Append a prepared entry. Returns `false` if the collector is sealed.
    pub fn push(&self, error: ReportedError) -> bool {
        let mut entries = self.lock();
        if entries.sealed {
            tracing::debug!(message = %error.message, "error reported after the payload was built; dropped");
            return false;
        }
        entries.errors.push(error);
        true
    }

    /// The errors reported so far, in order.
    pub fn snapshot(&self) -> Vec<ReportedError> {
        self.lock().errors.clone()
    }

    /// Freeze the list and return its final contents.
    pub fn seal(&self) -> Vec<ReportedError> {
        let mut entries = self.lock();
        entries.sealed = true;
        entries.errors.clone()
    }

    /// Whether [`seal`](Self::seal) has been called.
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Number of errors reported.
    pub fn len(&self) -> usize {
        self.lock().errors.len()
    }

    /// Whether no error was reported.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
