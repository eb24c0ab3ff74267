//! Error types for apiprobe
//!
//! Nothing on the request path returns these to a handler or a client:
//! capture problems degrade and publishing is fire-and-forget. They surface
//! only from setup calls (building a [`Probe`](crate::Probe), parsing rules,
//! loading configuration, constructing exporters).

use thiserror::Error;

/// Result type alias for apiprobe operations
pub type Result<T, E = ProbeError> = std::result::Result<T, E>;

/// Errors raised while configuring or shutting down the probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// A redaction rule could not be parsed.
    #[error("invalid redaction rule `{rule}`: {reason}")]
    InvalidRule {
        /// The rule as written in the configuration.
        rule: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A route template could not be registered.
    #[error("invalid route template `{template}`: {reason}")]
    InvalidRoute {
        /// The offending template.
        template: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Configuration could not be loaded from the environment.
    #[cfg(feature = "config")]
    #[error("configuration error: {0}")]
    Env(#[from] envy::Error),

    /// The publisher was already shut down.
    #[error("publisher is shut down")]
    PublisherClosed,

    /// The background publisher thread could not be started.
    #[error("could not start publisher worker: {0}")]
    Worker(#[source] std::io::Error),

    /// An exporter failed while being set up or flushed.
    #[error(transparent)]
    Export(#[from] ExportError),
}

/// Why a payload did not reach its destination.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Writing to a local sink failed.
    #[error("payload write failed: {0}")]
    Write(#[from] std::io::Error),

    /// The payload could not be encoded as JSON.
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// The collector could not be reached.
    #[error("collector unreachable: {0}")]
    Transport(String),

    /// The collector answered with a non-success status.
    #[error("collector rejected payloads with status {status}")]
    Rejected {
        /// HTTP status returned by the collector.
        status: u16,
    },

    /// The collector did not answer in time.
    #[error("collector did not answer within {0:?}")]
    TimedOut(std::time::Duration),

    /// A sink's lock was poisoned by a panic during an earlier export.
    #[error("payload sink poisoned")]
    Poisoned,

    /// Some sinks of a fan-out failed; the others still received the payload.
    #[error("{} of {} payload sinks failed", .failures.len(), .total)]
    Sinks {
        /// Number of sinks tried.
        total: usize,
        /// One error per failed sink, in sink order.
        failures: Vec<ExportError>,
    },
}

/// Result type for export operations.
pub type ExportResult<T> = std::result::Result<T, ExportError>;
