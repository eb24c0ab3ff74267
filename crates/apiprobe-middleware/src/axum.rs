//! axum integration.
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/users/{id}", get(show_user))
//!     .layer(ProbeLayer::axum(probe));
//!
//! async fn show_user(Probed(ctx): Probed, Path(id): Path<u64>) -> Json<User> {
//!     if let Err(e) = audit(id).await {
//!         ctx.report(&e);
//!     }
//!     ...
//! }
//! ```
//!
//! The layer must be added with `Router::layer` (not around the whole
//! router) for the matched route to be visible.

use crate::route::{match_template, normalize_template, MatchedRoute, RouteResolver};
use crate::tower::ProbeLayer;
use apiprobe_core::{Probe, ProbeContext, SdkKind};
use axum::extract::{ConnectInfo, FromRequestParts, MatchedPath};
use http::request::Parts;
use http::StatusCode;
use std::net::SocketAddr;

/// Reads the route from axum's [`MatchedPath`] and the peer from
/// [`ConnectInfo`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AxumRoute;

impl RouteResolver for AxumRoute {
    fn resolve(&self, parts: &Parts) -> MatchedRoute {
        let Some(matched) = parts.extensions.get::<MatchedPath>() else {
            return parts
                .extensions
                .get::<MatchedRoute>()
                .cloned()
                .unwrap_or_default();
        };
        let template = normalize_template(matched.as_str());
        let params = match_template(&template, parts.uri.path()).unwrap_or_default();
        MatchedRoute {
            template: Some(template),
            params,
        }
    }

    fn remote_addr(&self, parts: &Parts) -> Option<String> {
        parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0)
            .or_else(|| parts.extensions.get::<SocketAddr>().copied())
            .map(|addr| addr.ip().to_string())
    }
}

impl ProbeLayer<AxumRoute> {
    /// A layer for `Router::layer`, tagging payloads as axum.
    pub fn axum(probe: Probe) -> Self {
        ProbeLayer::new(probe)
            .with_resolver(AxumRoute)
            .sdk(SdkKind::Axum)
    }
}

/// Extractor for the current request's [`ProbeContext`].
///
/// Rejects with 500 when the probe layer is not installed.
#[derive(Debug, Clone)]
pub struct Probed(pub ProbeContext);

impl<S> FromRequestParts<S> for Probed
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ProbeContext>()
            .cloned()
            .map(Probed)
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "apiprobe layer not installed"))
    }
}
