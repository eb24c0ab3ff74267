use super::{BodyRecord, Payload, RequestRecord, RequestSnapshot, ResponseRecord, ResponseSnapshot, SdkKind};
use crate::capture::CapturedBody;
use crate::config::ProbeConfig;
use crate::context::CorrelationId;
use crate::error::Result;
use crate::headers::HeaderList;
use crate::redact::Redactor;
use crate::report::{unix_millis, ReportedError};
use base64::Engine as _;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderMap, Uri};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Everything the builder needs for one payload.
#[derive(Debug)]
pub struct Exchange {
    /// Integration that captured the exchange.
    pub sdk: SdkKind,
    /// The request's correlation id.
    pub correlation_id: CorrelationId,
    /// Upstream correlation id, if any.
    pub parent_id: Option<CorrelationId>,
    /// Raw request data.
    pub request: RequestSnapshot,
    /// Raw response data.
    pub response: ResponseSnapshot,
    /// Final error list.
    pub errors: Vec<ReportedError>,
    /// Extra data attached verbatim.
    pub extra: Option<Value>,
}

/// Turns raw exchanges into redacted payloads.
///
/// Building never fails: anything that cannot be parsed is reported as an
/// opaque, unredacted body.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    redactor: Redactor,
    service_name: String,
    service_version: Option<String>,
    tags: Vec<String>,
    capture_request_body: bool,
    capture_response_body: bool,
}

impl PayloadBuilder {
    /// Compile a builder from configuration.
    pub fn new(config: &ProbeConfig) -> Result<Self> {
        Ok(Self {
            redactor: Redactor::from_config(config)?,
            service_name: config.service_name.clone(),
            service_version: config.service_version.clone(),
            tags: config.tags.clone(),
            capture_request_body: config.capture_request_body,
            capture_response_body: config.capture_response_body,
        })
    }

    /// The redactor used for headers, params and bodies.
    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    /// Assemble the payload for one exchange.
    pub fn build(&self, exchange: Exchange) -> Payload {
        let Exchange {
            sdk,
            correlation_id,
            parent_id,
            request,
            response,
            errors,
            extra,
        } = exchange;

        let duration_ns = u64::try_from(request.started.elapsed().as_nanos()).unwrap_or(u64::MAX);

        Payload {
            correlation_id,
            parent_id,
            sdk,
            timestamp: unix_millis(request.started_at),
            duration_ns,
            service_name: self.service_name.clone(),
            service_version: self.service_version.clone(),
            tags: self.tags.clone(),
            request: self.request_record(&request, correlation_id),
            response: self.response_record(&response, correlation_id),
            errors,
            extra,
        }
    }

    fn request_record(&self, request: &RequestSnapshot, id: CorrelationId) -> RequestRecord {
        let mask = self.redactor.mask();
        let path = self.redacted_path(request);
        let raw_query = request.uri.query().unwrap_or("");

        let mut masked_any = false;
        let pairs: Vec<(String, String)> = parse_query(raw_query)
            .into_iter()
            .map(|(name, value)| {
                if self.redactor.is_sensitive_param(&name) {
                    masked_any = true;
                    (name, mask.to_string())
                } else {
                    (name, value)
                }
            })
            .collect();

        let query_string = if masked_any {
            serde_urlencoded::to_string(&pairs).unwrap_or_default()
        } else {
            raw_query.to_string()
        };

        let mut query_params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in pairs {
            query_params.entry(name).or_default().push(value);
        }

        let body = if self.capture_request_body {
            body_record(
                request.body.as_ref(),
                &request.headers,
                id,
                |value| self.redactor.request_body(value),
                |form| self.redactor.request_form(form),
            )
        } else {
            BodyRecord::Omitted
        };

        let host = self.host(&request.headers, &request.uri);
        let authority = request.uri.authority().map(|authority| {
            if self.redactor.is_sensitive_header(HOST.as_str()) {
                mask.to_string()
            } else {
                authority.to_string()
            }
        });

        RequestRecord {
            method: request.method.to_string(),
            url: build_url(request.uri.scheme_str(), authority.as_deref(), &path, &query_string),
            path,
            path_template: request.path_template.clone(),
            path_params: self
                .redactor
                .params(&request.path_params, |_, mask| mask.to_string()),
            query_string,
            query_params,
            headers: self.redactor.headers(&HeaderList::from(&request.headers)),
            body,
            host,
            client_ip: self.client_ip(&request.headers, request.remote_addr.as_deref()),
            http_version: format!("{:?}", request.version),
        }
    }

    /// The request path with sensitive path parameters masked.
    fn redacted_path(&self, request: &RequestSnapshot) -> String {
        let path = request.uri.path();
        let sensitive: Vec<&str> = request
            .path_params
            .iter()
            .filter(|(name, _)| self.redactor.is_sensitive_param(name))
            .map(|(_, value)| value.as_str())
            .collect();
        if sensitive.is_empty() {
            return path.to_string();
        }

        let mask = self.redactor.mask();
        request
            .path_template
            .as_deref()
            .and_then(|template| {
                mask_by_template(path, template, |name| self.redactor.is_sensitive_param(name), mask)
            })
            .unwrap_or_else(|| {
                // no usable template: mask segments equal to a sensitive value
                path.split('/')
                    .map(|segment| {
                        if !segment.is_empty() && sensitive.contains(&segment) {
                            mask
                        } else {
                            segment
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("/")
            })
    }

    fn host(&self, headers: &HeaderMap, uri: &Uri) -> String {
        if headers.contains_key(HOST) && self.redactor.is_sensitive_header(HOST.as_str()) {
            return self.redactor.mask().to_string();
        }
        headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default()
    }

    fn client_ip(&self, headers: &HeaderMap, remote_addr: Option<&str>) -> String {
        for name in ["x-forwarded-for", "x-real-ip"] {
            let ip = headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|ip| ip.parse::<IpAddr>().is_ok());
            if let Some(ip) = ip {
                if self.redactor.is_sensitive_header(name) {
                    return self.redactor.mask().to_string();
                }
                return ip.to_string();
            }
        }
        remote_addr.unwrap_or_default().to_string()
    }

    fn response_record(&self, response: &ResponseSnapshot, id: CorrelationId) -> ResponseRecord {
        let body = if self.capture_response_body {
            body_record(
                response.body.as_ref(),
                &response.headers,
                id,
                |value| self.redactor.response_body(value),
                |form| self.redactor.response_form(form),
            )
        } else {
            BodyRecord::Omitted
        };

        ResponseRecord {
            status: response.status.as_u16(),
            headers: self.redactor.headers(&HeaderList::from(&response.headers)),
            body,
        }
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    if query.is_empty() {
        return Vec::new();
    }
    serde_urlencoded::from_str(query).unwrap_or_else(|err| {
        tracing::debug!(error = %err, "query string did not decode; params left empty");
        Vec::new()
    })
}

fn build_url(scheme: Option<&str>, authority: Option<&str>, path: &str, query: &str) -> String {
    let mut url = match (scheme, authority) {
        (Some(scheme), Some(authority)) => format!("{scheme}://{authority}{path}"),
        _ => path.to_string(),
    };
    if !query.is_empty() {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Template parameter name of one segment: `{id}`, `{*rest}`, `:id`, `*rest`.
fn template_param(segment: &str) -> Option<(&str, bool)> {
    if let Some(inner) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        return Some(match inner.strip_prefix('*') {
            Some(name) => (name, true),
            None => (inner, false),
        });
    }
    if let Some(name) = segment.strip_prefix(':') {
        return Some((name, false));
    }
    segment.strip_prefix('*').map(|name| (name, true))
}

/// Rebuild `path` segment by segment against `template`, masking sensitive
/// parameters. `None` when the path does not line up with the template.
fn mask_by_template<'a>(
    path: &'a str,
    template: &str,
    sensitive: impl Fn(&str) -> bool,
    mask: &'a str,
) -> Option<String> {
    let mut segments = path.split('/');
    let mut out: Vec<&str> = Vec::new();

    for part in template.split('/') {
        match template_param(part) {
            Some((name, true)) => {
                if sensitive(name) {
                    segments.by_ref().for_each(drop);
                    out.push(mask);
                } else {
                    out.extend(segments.by_ref());
                }
            }
            Some((name, false)) => {
                let segment = segments.next()?;
                out.push(if sensitive(name) { mask } else { segment });
            }
            None => {
                let segment = segments.next()?;
                if segment != part {
                    return None;
                }
                out.push(segment);
            }
        }
    }

    if segments.next().is_some() {
        return None;
    }
    Some(out.join("/"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Structured,
    Form,
    Text,
    Binary,
}

fn media_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .filter(|ct| !ct.is_empty())
}

fn classify(media_type: Option<&str>, bytes: &[u8]) -> BodyKind {
    match media_type {
        Some(ct) if ct == "application/json" || ct == "text/json" || ct.ends_with("+json") => {
            BodyKind::Structured
        }
        Some(ct)
            if ct.starts_with("text/")
                || ct.ends_with("+xml")
                || ct == "application/xml"
                || ct == "application/javascript" =>
        {
            BodyKind::Text
        }
        Some("application/x-www-form-urlencoded") => BodyKind::Form,
        Some(_) => BodyKind::Binary,
        None => match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') | Some(b'[') => BodyKind::Structured,
            _ if std::str::from_utf8(bytes).is_ok() => BodyKind::Text,
            _ => BodyKind::Binary,
        },
    }
}

/// Longest valid UTF-8 prefix; a truncated body may end mid-character.
fn utf8_prefix(bytes: &[u8], truncated: bool) -> Option<&str> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(err) if truncated && err.error_len().is_none() => {
            std::str::from_utf8(&bytes[..err.valid_up_to()]).ok()
        }
        Err(_) => None,
    }
}

fn opaque(body: &CapturedBody) -> BodyRecord {
    BodyRecord::Opaque {
        base64: base64::engine::general_purpose::STANDARD.encode(&body.bytes),
        size: body.size,
        truncated: body.truncated,
    }
}

fn body_record(
    body: Option<&CapturedBody>,
    headers: &HeaderMap,
    id: CorrelationId,
    redact: impl Fn(&Value) -> Value,
    redact_form: impl Fn(&str) -> Option<String>,
) -> BodyRecord {
    let Some(body) = body else {
        return BodyRecord::Omitted;
    };
    if body.is_empty() {
        return BodyRecord::Empty;
    }

    let media_type = media_type(headers);
    match classify(media_type.as_deref(), &body.bytes) {
        BodyKind::Structured | BodyKind::Form if body.truncated => {
            tracing::debug!(correlation_id = %id, size = body.size, "structured body truncated; reported opaque");
            opaque(body)
        }
        BodyKind::Structured => match serde_json::from_slice::<Value>(&body.bytes) {
            Ok(value) => BodyRecord::Json {
                value: redact(&value),
                size: body.size,
            },
            Err(err) => {
                tracing::debug!(correlation_id = %id, error = %err, "structured body did not parse; reported opaque");
                opaque(body)
            }
        },
        BodyKind::Form => match std::str::from_utf8(&body.bytes).ok().and_then(|form| redact_form(form)) {
            Some(text) => BodyRecord::Text {
                text,
                size: body.size,
                truncated: false,
            },
            None => {
                tracing::debug!(correlation_id = %id, "form body did not decode; reported opaque");
                opaque(body)
            }
        },
        BodyKind::Text => match utf8_prefix(&body.bytes, body.truncated) {
            Some(text) => BodyRecord::Text {
                text: text.to_string(),
                size: body.size,
                truncated: body.truncated,
            },
            None => opaque(body),
        },
        BodyKind::Binary => opaque(body),
    }
}
