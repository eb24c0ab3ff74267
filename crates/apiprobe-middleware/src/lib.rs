//! # apiprobe-middleware
//!
//! HTTP framework adapters for [`apiprobe_core`].
//!
//! Each adapter only knows how to read the route, stream the request body to
//! the handler intact and intercept the response bytes. Capture, redaction,
//! payload building and publishing are shared through
//! [`apiprobe_core::Probe`].
//!
//! - [`tower`]: `ProbeLayer` for any `tower::Service<http::Request<B>>`
//! - [`blocking`]: hosts that write responses through `std::io::Write`
//! - `axum` (feature `axum`): route discovery via `MatchedPath` and a
//!   `Probed` extractor

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod blocking;
pub mod body;
pub mod route;
pub mod tower;

#[cfg(feature = "axum")]
pub mod axum;

pub use body::{ResponseCapture, TeeBody, TeeRequestBody};
pub use route::{
    match_template, normalize_template, route_fn, ExtensionRoute, FnRoute, MatchedRoute,
    RouteResolver, TemplateRoutes,
};
pub use self::tower::{ProbeLayer, ProbeService};

#[cfg(feature = "axum")]
pub use self::axum::{AxumRoute, Probed};
