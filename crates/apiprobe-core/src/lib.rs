//! # apiprobe-core
//!
//! Framework-independent core of the apiprobe HTTP capture agent.
//!
//! The pieces, leaf first:
//!
//! - [`redact`]: masks sensitive headers, parameters and body fields in a copy
//!   of the data
//! - [`capture`]: duplicates bytes as they flow, with a size cap
//! - [`report`]: the ordered per-request error list
//! - [`context`]: correlation id and error list reachable from handler code
//! - [`payload`]: the normalized record and its builder
//! - [`publish`]: non-blocking hand-off to an exporter
//! - [`probe`]: the shared finalisation used by every adapter
//!
//! HTTP framework adapters live in `apiprobe-middleware`.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod capture;
pub mod config;
pub mod context;
pub mod error;
pub mod headers;
pub mod logging;
pub mod outgoing;
pub mod payload;
pub mod probe;
pub mod publish;
pub mod redact;
pub mod report;

pub use capture::{CaptureBuffer, CapturedBody, SharedCapture, TeeWriter, DEFAULT_MAX_BODY_SIZE};
pub use config::ProbeConfig;
pub use context::{report_error, CorrelationId, ProbeContext};
pub use error::{ExportError, ExportResult, ProbeError, Result};
pub use headers::HeaderList;
pub use logging::init_tracing;
pub use outgoing::PARENT_ID_HEADER;
pub use payload::{
    BodyRecord, Exchange, Payload, PayloadBuilder, RequestRecord, RequestSnapshot, ResponseRecord,
    ResponseSnapshot, SdkKind,
};
pub use probe::{HandlerOutcome, Probe, ProbeState, RequestProbe, CLIENT_CLOSED_REQUEST};
pub use publish::{Exporter, MemoryExporter, PublishStats, Publisher};
pub use redact::{FieldRule, Redactor, DEFAULT_MASK};
pub use report::{ErrorCollector, ErrorKind, ReportedError};
