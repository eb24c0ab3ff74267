//! Request-scoped correlation state.
//!
//! Every captured request gets one [`ProbeContext`]. Adapters hand it to the
//! handler twice: as a request extension, and as a task-local for the
//! duration of the handler future, so that library code with no access to
//! the request can still call [`report_error`].

use crate::probe::Probe;
use crate::report::{ErrorCollector, ErrorKind, ReportedError};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier of one captured request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.short())
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl serde::Serialize for CorrelationId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for CorrelationId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Uuid::deserialize(deserializer).map(Self)
    }
}

tokio::task_local! {
    static CURRENT: ProbeContext;
}

struct ContextInner {
    id: CorrelationId,
    parent_id: Option<CorrelationId>,
    errors: ErrorCollector,
    probe: Probe,
    span: tracing::Span,
}

/// Correlation id, error list and probe handle of one in-flight request.
///
/// Cheap to clone; all clones refer to the same request.
#[derive(Clone)]
pub struct ProbeContext {
    inner: Arc<ContextInner>,
}

impl ProbeContext {
    pub(crate) fn new(probe: Probe, parent_id: Option<CorrelationId>, span: tracing::Span) -> Self {
        let id = CorrelationId::new();
        span.record("correlation_id", tracing::field::display(id));
        Self {
            inner: Arc::new(ContextInner {
                id,
                parent_id,
                errors: ErrorCollector::new(),
                probe,
                span,
            }),
        }
    }

    /// The request's correlation id.
    pub fn id(&self) -> CorrelationId {
        self.inner.id
    }

    /// Id of the upstream request that made this call, if it sent one.
    pub fn parent_id(&self) -> Option<CorrelationId> {
        self.inner.parent_id
    }

    /// The request's error list.
    pub fn errors(&self) -> &ErrorCollector {
        &self.inner.errors
    }

    /// The probe that owns this request.
    pub fn probe(&self) -> &Probe {
        &self.inner.probe
    }

    /// The request span. Disabled when request tracing is off.
    pub fn span(&self) -> &tracing::Span {
        &self.inner.span
    }

    /// Attach an error to this request.
    ///
    /// Returns `false` if the payload was already built.
    pub fn report<E>(&self, err: &E) -> bool
    where
        E: StdError + ?Sized,
    {
        self.inner.errors.report(err)
    }

    /// Attach a plain message to this request.
    pub fn report_message(&self, message: impl Into<String>) -> bool {
        self.inner
            .errors
            .push(ReportedError::message(ErrorKind::Reported, message))
    }

    /// Run `fut` with this context installed as the current one.
    pub fn scope<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(self.clone(), fut)
    }

    /// Run `f` with this context installed as the current one.
    pub fn sync_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self.clone(), f)
    }

    /// The context of the request being handled on this task, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }
}

impl fmt::Debug for ProbeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeContext")
            .field("id", &self.inner.id)
            .field("parent_id", &self.inner.parent_id)
            .field("errors", &self.inner.errors.len())
            .finish()
    }
}

/// Attach an error to the request currently being handled on this task.
///
/// Returns `false` when called outside a captured request or after its
/// payload was built.
pub fn report_error<E>(err: &E) -> bool
where
    E: StdError + ?Sized,
{
    match ProbeContext::current() {
        Some(ctx) => ctx.report(err),
        None => {
            tracing::debug!(error = %err, "report_error called outside a captured request");
            false
        }
    }
}
