//! # apiprobe
//!
//! Transparent HTTP request/response capture for Rust services.
//!
//! apiprobe sits in a server's request pipeline, records each exchange
//! without changing what the client sees, masks sensitive headers and body
//! fields, and hands a normalized [`Payload`] to an [`Exporter`] off the
//! request path.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use apiprobe::prelude::*;
//!
//! let config = ProbeConfig::new()
//!     .service_name("users-api")
//!     .redact_headers(["Authorization"])
//!     .redact_response_body(["ssn", "$.card.number"]);
//!
//! let publisher = Publisher::background(FileExporter::new("payloads.jsonl")?, 1024)?;
//! let probe = Probe::new(config, publisher)?;
//!
//! let app = Router::new()
//!     .route("/users/{id}", get(show_user))
//!     .layer(ProbeLayer::axum(probe.clone()));
//! ```
//!
//! Handlers attach errors to the current request with [`report_error`]:
//!
//! ```rust,ignore
//! if let Err(e) = db.load(id).await {
//!     apiprobe::report_error(&e);
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `axum` - route discovery from `MatchedPath` and the `Probed` extractor
//! - `config` - `ProbeConfig::from_env()` with `.env` support
//! - `webhook` - HTTP webhook exporter
//! - `full` - all of the above

pub use apiprobe_core::*;

pub use apiprobe_middleware::{
    blocking, body, match_template, normalize_template, route, route_fn, ExtensionRoute, FnRoute,
    MatchedRoute, ProbeLayer, ProbeService, ResponseCapture, RouteResolver, TeeBody,
    TeeRequestBody, TemplateRoutes,
};

#[cfg(feature = "axum")]
pub use apiprobe_middleware::{AxumRoute, Probed};

pub use apiprobe_core::publish::{CompositeExporter, FileExporter};

#[cfg(feature = "webhook")]
pub use apiprobe_core::publish::{WebhookConfig, WebhookExporter};

/// Commonly used types.
pub mod prelude {
    pub use apiprobe_core::{
        report_error, CorrelationId, ErrorKind, Exporter, MemoryExporter, Payload, Probe,
        ProbeConfig, ProbeContext, ProbeError, Publisher, ReportedError, SdkKind,
    };
    pub use apiprobe_core::publish::{CompositeExporter, FileExporter};
    pub use apiprobe_middleware::{MatchedRoute, ProbeLayer, RouteResolver, TemplateRoutes};

    #[cfg(feature = "axum")]
    pub use apiprobe_middleware::Probed;

    pub use serde_json::{json, Value};
}
