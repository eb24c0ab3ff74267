//! Configuration for the probe.
//!
//! [`ProbeConfig`] is a by-value builder. Every field has a default, so the
//! type can also be deserialized from a partial document or, with the
//! `config` feature, from `APIPROBE_*` environment variables.
//!
//! ```ignore
//! use apiprobe_core::ProbeConfig;
//!
//! let config = ProbeConfig::new()
//!     .service_name("billing")
//!     .service_version("1.4.2")
//!     .redact_headers(["Authorization", "Cookie"])
//!     .redact_response_body(["ssn", "$.card.number"])
//!     .max_body_size(64 * 1024)
//!     .skip_path("/health");
//! ```

use crate::capture::DEFAULT_MAX_BODY_SIZE;
use crate::error::Result;
use crate::redact::{parse_rules, DEFAULT_MASK};
use serde::{Deserialize, Serialize};

/// Probe configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Name of the service producing payloads.
    pub(crate) service_name: String,

    /// Version tag of the service.
    pub(crate) service_version: Option<String>,

    /// Free-form labels attached to every payload.
    pub(crate) tags: Vec<String>,

    /// Header names to mask (case-insensitive).
    pub(crate) redact_headers: Vec<String>,

    /// Request body field names or `$` paths to mask. Bare names also apply
    /// to query and path parameters.
    pub(crate) redact_request_body: Vec<String>,

    /// Response body field names or `$` paths to mask.
    pub(crate) redact_response_body: Vec<String>,

    /// Whether request bodies are captured. Default: true.
    pub(crate) capture_request_body: bool,

    /// Whether response bodies are captured. Default: true.
    pub(crate) capture_response_body: bool,

    /// Cap on retained body bytes, per body. Default: 1 MiB.
    pub(crate) max_body_size: usize,

    /// Replacement token for redacted values. Default: `[MASKED]`.
    pub(crate) mask: String,

    /// Whether each request gets an `apiprobe.request` span. Default: true.
    pub(crate) trace_requests: bool,

    /// Exact paths that bypass capture.
    pub(crate) skip_paths: Vec<String>,

    /// Path prefixes that bypass capture.
    pub(crate) skip_path_prefixes: Vec<String>,

    /// Log every published payload at debug level.
    pub(crate) debug: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeConfig {
    /// Create a configuration with default values.
    ///
    /// Defaults:
    /// - No redaction rules
    /// - Request and response bodies captured, up to 1 MiB each
    /// - Mask token `[MASKED]`
    /// - Request spans enabled
    pub fn new() -> Self {
        Self {
            service_name: String::new(),
            service_version: None,
            tags: Vec::new(),
            redact_headers: Vec::new(),
            redact_request_body: Vec::new(),
            redact_response_body: Vec::new(),
            capture_request_body: true,
            capture_response_body: true,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            mask: DEFAULT_MASK.to_string(),
            trace_requests: true,
            skip_paths: Vec::new(),
            skip_path_prefixes: Vec::new(),
            debug: false,
        }
    }

    /// Load configuration from `APIPROBE_*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first when present.
    /// List values are comma separated, e.g.
    /// `APIPROBE_REDACT_HEADERS=authorization,cookie`.
    #[cfg(feature = "config")]
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_env_prefixed("APIPROBE_")
    }

    /// Load configuration from environment variables with a custom prefix.
    #[cfg(feature = "config")]
    pub fn from_env_prefixed(prefix: &str) -> Result<Self> {
        let config: Self = envy::prefixed(prefix).from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every redaction rule parses.
    pub fn validate(&self) -> Result<()> {
        parse_rules(&self.redact_request_body)?;
        parse_rules(&self.redact_response_body)?;
        Ok(())
    }

    /// Set the service name.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the service version.
    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    /// Add a tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Replace the tag list.
    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the header names to mask.
    pub fn redact_headers(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.redact_headers = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the request body rules.
    pub fn redact_request_body(mut self, rules: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.redact_request_body = rules.into_iter().map(Into::into).collect();
        self
    }

    /// Set the response body rules.
    pub fn redact_response_body(mut self, rules: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.redact_response_body = rules.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable request body capture.
    ///
    /// When disabled the request body is not buffered at all.
    pub fn capture_request_body(mut self, capture: bool) -> Self {
        self.capture_request_body = capture;
        self
    }

    /// Enable or disable response body capture.
    pub fn capture_response_body(mut self, capture: bool) -> Self {
        self.capture_response_body = capture;
        self
    }

    /// Set the maximum number of body bytes retained per body.
    ///
    /// Larger bodies still reach the handler and the client in full; the
    /// payload marks them as truncated.
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Set the mask token.
    pub fn mask(mut self, mask: impl Into<String>) -> Self {
        self.mask = mask.into();
        self
    }

    /// Enable or disable per-request spans.
    pub fn trace_requests(mut self, enabled: bool) -> Self {
        self.trace_requests = enabled;
        self
    }

    /// Add an exact path to skip.
    pub fn skip_path(mut self, path: impl Into<String>) -> Self {
        self.skip_paths.push(path.into());
        self
    }

    /// Add a path prefix to skip.
    pub fn skip_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.skip_path_prefixes.push(prefix.into());
        self
    }

    /// Enable debug logging of published payloads.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Whether a path bypasses capture.
    pub fn should_skip_path(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| p == path)
            || self
                .skip_path_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// The service name.
    pub fn get_service_name(&self) -> &str {
        &self.service_name
    }

    /// The service version.
    pub fn get_service_version(&self) -> Option<&str> {
        self.service_version.as_deref()
    }

    /// The configured tags.
    pub fn get_tags(&self) -> &[String] {
        &self.tags
    }

    /// Whether request bodies are captured.
    pub fn captures_request_body(&self) -> bool {
        self.capture_request_body
    }

    /// Whether response bodies are captured.
    pub fn captures_response_body(&self) -> bool {
        self.capture_response_body
    }

    /// The body size cap.
    pub fn get_max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Whether request spans are created.
    pub fn traces_requests(&self) -> bool {
        self.trace_requests
    }

    /// Whether debug logging of payloads is on.
    pub fn is_debug(&self) -> bool {
        self.debug
    }
}
