//! Redaction of sensitive headers, parameters and body fields.
//!
//! Redaction never touches the bytes that flow to the client or the handler:
//! every function here takes its input by reference and returns a masked
//! copy for the payload.
//!
//! Body rules come in two forms:
//!
//! - a bare field name (`password`) masks that key at any depth,
//! - a path starting with `$` (`$.user.card[*].number`) masks exactly the
//!   addressed values. Segments are `.key`, `.*` (every key), `[n]` and `[*]`
//!   (every element).
//!
//! Header names compare case-insensitively, body keys case-sensitively.

use crate::config::ProbeConfig;
use crate::error::{ProbeError, Result};
use crate::headers::HeaderList;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// Token that replaces redacted values unless configured otherwise.
pub const DEFAULT_MASK: &str = "[MASKED]";

/// One segment of a `$`-rooted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// A named object key.
    Key(String),
    /// Every value of an object.
    AnyKey,
    /// A fixed array position.
    Index(usize),
    /// Every element of an array.
    AnyIndex,
}

/// A compiled body redaction rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRule {
    /// Mask this key wherever it appears.
    Name(String),
    /// Mask the values addressed by this path.
    Path(Vec<PathSegment>),
}

impl FieldRule {
    /// Parse a rule as written in the configuration.
    pub fn parse(rule: &str) -> Result<Self> {
        let trimmed = rule.trim();
        if trimmed.is_empty() {
            return Err(invalid(rule, "rule is empty"));
        }
        if trimmed.starts_with('$') {
            parse_path(trimmed).map(FieldRule::Path)
        } else {
            Ok(FieldRule::Name(trimmed.to_string()))
        }
    }

    /// The field name for bare-name rules.
    pub fn name(&self) -> Option<&str> {
        match self {
            FieldRule::Name(name) => Some(name),
            FieldRule::Path(_) => None,
        }
    }
}

fn invalid(rule: &str, reason: &str) -> ProbeError {
    ProbeError::InvalidRule {
        rule: rule.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_path(rule: &str) -> Result<Vec<PathSegment>> {
    let mut rest = &rule[1..];
    let mut segments = Vec::new();

    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('.') {
            let end = tail.find(['.', '[']).unwrap_or(tail.len());
            let key = &tail[..end];
            if key.is_empty() {
                return Err(invalid(rule, "empty key"));
            }
            segments.push(if key == "*" {
                PathSegment::AnyKey
            } else {
                PathSegment::Key(key.to_string())
            });
            rest = &tail[end..];
        } else if let Some(tail) = rest.strip_prefix('[') {
            let end = tail.find(']').ok_or_else(|| invalid(rule, "unclosed `[`"))?;
            let index = tail[..end].trim();
            segments.push(if index == "*" {
                PathSegment::AnyIndex
            } else {
                let position = index
                    .parse()
                    .map_err(|_| invalid(rule, "array index must be a number or `*`"))?;
                PathSegment::Index(position)
            });
            rest = &tail[end + 1..];
        } else {
            return Err(invalid(rule, "expected `.` or `[` after `$`"));
        }
    }

    if segments.is_empty() {
        return Err(invalid(rule, "path selects the whole document"));
    }
    Ok(segments)
}

/// Parse a list of rules, failing on the first malformed one.
pub fn parse_rules<I, S>(rules: I) -> Result<Vec<FieldRule>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    rules
        .into_iter()
        .map(|rule| FieldRule::parse(rule.as_ref()))
        .collect()
}

/// Return a copy of `value` with every field matched by `rules` masked.
///
/// Object keys and array lengths are preserved.
pub fn redact_json(value: &Value, rules: &[FieldRule], mask: &str) -> Value {
    let mut out = value.clone();
    for rule in rules {
        match rule {
            FieldRule::Name(name) => mask_named(&mut out, name, mask),
            FieldRule::Path(path) => mask_path(&mut out, path, mask),
        }
    }
    out
}

fn mask_named(value: &mut Value, name: &str, mask: &str) {
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if key == name {
                    *child = Value::String(mask.to_string());
                } else {
                    mask_named(child, name, mask);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_named(item, name, mask);
            }
        }
        _ => {}
    }
}

fn mask_path(value: &mut Value, path: &[PathSegment], mask: &str) {
    let Some((head, tail)) = path.split_first() else {
        *value = Value::String(mask.to_string());
        return;
    };

    match (head, value) {
        (PathSegment::Key(key), Value::Object(map)) => {
            if let Some(child) = map.get_mut(key) {
                mask_path(child, tail, mask);
            }
        }
        (PathSegment::AnyKey, Value::Object(map)) => {
            for child in map.values_mut() {
                mask_path(child, tail, mask);
            }
        }
        (PathSegment::Index(i), Value::Array(items)) => {
            if let Some(child) = items.get_mut(*i) {
                mask_path(child, tail, mask);
            }
        }
        (PathSegment::AnyIndex, Value::Array(items)) => {
            for child in items {
                mask_path(child, tail, mask);
            }
        }
        _ => {}
    }
}

fn mask_form(form: &str, rules: &[FieldRule], mask: &str) -> Option<String> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(form).ok()?;
    let mut masked_any = false;
    let pairs: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(name, value)| {
            if rules.iter().any(|rule| rule.name() == Some(name.as_str())) {
                masked_any = true;
                (name, mask.to_string())
            } else {
                (name, value)
            }
        })
        .collect();

    if !masked_any {
        return Some(form.to_string());
    }
    serde_urlencoded::to_string(&pairs).ok()
}

fn header_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// Compiled redaction configuration.
///
/// Stateless after construction and shared read-only by every request.
#[derive(Debug, Clone)]
pub struct Redactor {
    headers: HashSet<String>,
    request_body: Vec<FieldRule>,
    response_body: Vec<FieldRule>,
    mask: String,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Redactor {
    /// A redactor with no rules and the default mask.
    pub fn new() -> Self {
        Self {
            headers: HashSet::new(),
            request_body: Vec::new(),
            response_body: Vec::new(),
            mask: DEFAULT_MASK.to_string(),
        }
    }

    /// Compile the three rule lists of a [`ProbeConfig`].
    pub fn from_config(config: &ProbeConfig) -> Result<Self> {
        Ok(Self {
            headers: config
                .redact_headers
                .iter()
                .map(|h| header_key(h))
                .collect(),
            request_body: parse_rules(&config.redact_request_body)?,
            response_body: parse_rules(&config.redact_response_body)?,
            mask: config.mask.clone(),
        })
    }

    /// Set the mask token.
    pub fn mask_with(mut self, mask: impl Into<String>) -> Self {
        self.mask = mask.into();
        self
    }

    /// Add a header name to mask.
    pub fn header(mut self, name: impl AsRef<str>) -> Self {
        self.headers.insert(header_key(name.as_ref()));
        self
    }

    /// Add a request body rule.
    pub fn request_field(mut self, rule: &str) -> Result<Self> {
        self.request_body.push(FieldRule::parse(rule)?);
        Ok(self)
    }

    /// Add a response body rule.
    pub fn response_field(mut self, rule: &str) -> Result<Self> {
        self.response_body.push(FieldRule::parse(rule)?);
        Ok(self)
    }

    /// The mask token.
    pub fn mask(&self) -> &str {
        &self.mask
    }

    /// Whether a header name is configured as sensitive.
    pub fn is_sensitive_header(&self, name: &str) -> bool {
        self.headers.contains(&header_key(name))
    }

    /// Whether a query or path parameter name matches a bare-name request
    /// body rule.
    pub fn is_sensitive_param(&self, name: &str) -> bool {
        self.request_body.iter().any(|rule| rule.name() == Some(name))
    }

    /// Masked copy of a header list (request or response).
    pub fn headers(&self, headers: &HeaderList) -> HeaderList {
        headers.map_values(|name, values| {
            if self.is_sensitive_header(name) {
                vec![self.mask.clone(); values.len()]
            } else {
                values.to_vec()
            }
        })
    }

    /// Masked copy of a parsed request body.
    pub fn request_body(&self, body: &Value) -> Value {
        redact_json(body, &self.request_body, &self.mask)
    }

    /// Masked copy of a parsed response body.
    pub fn response_body(&self, body: &Value) -> Value {
        redact_json(body, &self.response_body, &self.mask)
    }

    /// Masked copy of a url-encoded request form, or `None` when it does not
    /// decode. An untouched form keeps its original encoding.
    pub fn request_form(&self, form: &str) -> Option<String> {
        mask_form(form, &self.request_body, &self.mask)
    }

    /// Masked copy of a url-encoded response form.
    pub fn response_form(&self, form: &str) -> Option<String> {
        mask_form(form, &self.response_body, &self.mask)
    }

    /// Masked copy of query or path parameters.
    ///
    /// Parameters are flat, so only bare-name request body rules apply.
    pub fn params<V: Clone>(&self, params: &BTreeMap<String, V>, mask: impl Fn(&V, &str) -> V) -> BTreeMap<String, V> {
        params
            .iter()
            .map(|(name, value)| {
                let value = if self.is_sensitive_param(name) {
                    mask(value, &self.mask)
                } else {
                    value.clone()
                };
                (name.clone(), value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_parse_bare_name() {
        assert_eq!(
            FieldRule::parse(" password ").unwrap(),
            FieldRule::Name("password".to_string())
        );
    }

    #[test]
    fn test_parse_path() {
        let rule = FieldRule::parse("$.user.cards[*].number").unwrap();
        assert_eq!(
            rule,
            FieldRule::Path(vec![
                PathSegment::Key("user".to_string()),
                PathSegment::Key("cards".to_string()),
                PathSegment::AnyIndex,
                PathSegment::Key("number".to_string()),
            ])
        );

        let rule = FieldRule::parse("$.items[2].*").unwrap();
        assert_eq!(
            rule,
            FieldRule::Path(vec![
                PathSegment::Key("items".to_string()),
                PathSegment::Index(2),
                PathSegment::AnyKey,
            ])
        );
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        for rule in ["", "$", "$.", "$.a[", "$.a[x]", "$a", "$..a"] {
            assert!(FieldRule::parse(rule).is_err(), "{rule:?} should be rejected");
        }
    }

    #[test]
    fn test_redact_headers_case_insensitive() {
        let mut headers = HeaderList::new();
        headers.append("Authorization", "secret123");
        headers.append("Accept", "application/json");
        headers.append("Cookie", "a=1");
        headers.append("Cookie", "b=2");

        let redacted = Redactor::new()
            .header("authorization")
            .header(" COOKIE ")
            .headers(&headers);

        let names: Vec<_> = redacted.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["Authorization", "Accept", "Cookie"]);
        assert_eq!(redacted.get("authorization").unwrap(), &["[MASKED]".to_string()]);
        assert_eq!(redacted.get("accept").unwrap(), &["application/json".to_string()]);
        assert_eq!(redacted.get("cookie").unwrap().len(), 2);
        assert!(redacted.get("cookie").unwrap().iter().all(|v| v == "[MASKED]"));
        // the input is untouched
        assert_eq!(headers.get("authorization").unwrap(), &["secret123".to_string()]);
    }

    #[test]
    fn test_redact_named_field_at_any_depth() {
        let body = json!({
            "id": 42,
            "ssn": "555-00-1111",
            "spouse": {"name": "Ann", "ssn": "555-00-2222"},
            "children": [{"ssn": "1"}, {"name": "Bo"}]
        });
        let rules = parse_rules(["ssn"]).unwrap();

        let redacted = redact_json(&body, &rules, DEFAULT_MASK);

        assert_eq!(
            redacted,
            json!({
                "id": 42,
                "ssn": "[MASKED]",
                "spouse": {"name": "Ann", "ssn": "[MASKED]"},
                "children": [{"ssn": "[MASKED]"}, {"name": "Bo"}]
            })
        );
    }

    #[test]
    fn test_redact_object_valued_field() {
        let body = json!({"card": {"number": "4111", "exp": "12/30"}, "amount": 5});
        let redacted = redact_json(&body, &parse_rules(["card"]).unwrap(), "***");
        assert_eq!(redacted, json!({"card": "***", "amount": 5}));
    }

    #[test]
    fn test_redact_path() {
        let body = json!({
            "user": {"password": "p", "profile": {"password": "keep"}},
            "cards": [{"number": "1"}, {"number": "2"}]
        });
        let rules = parse_rules(["$.user.password", "$.cards[1].number"]).unwrap();

        let redacted = redact_json(&body, &rules, DEFAULT_MASK);

        assert_eq!(redacted["user"]["password"], "[MASKED]");
        assert_eq!(redacted["user"]["profile"]["password"], "keep");
        assert_eq!(redacted["cards"][0]["number"], "1");
        assert_eq!(redacted["cards"][1]["number"], "[MASKED]");
    }

    #[test]
    fn test_redact_path_wildcards() {
        let body = json!({"items": [{"a": 1, "b": 2}, {"a": 3}], "meta": {"x": 1, "y": [1]}});
        let rules = parse_rules(["$.items[*].a", "$.meta.*"]).unwrap();

        let redacted = redact_json(&body, &rules, "#");

        assert_eq!(
            redacted,
            json!({"items": [{"a": "#", "b": 2}, {"a": "#"}], "meta": {"x": "#", "y": "#"}})
        );
    }

    #[test]
    fn test_missing_path_is_noop() {
        let body = json!({"a": [1, 2]});
        let rules = parse_rules(["$.a[5]", "$.b.c", "$.a.x"]).unwrap();
        assert_eq!(redact_json(&body, &rules, DEFAULT_MASK), body);
    }

    #[test]
    fn test_body_keys_are_case_sensitive() {
        let body = json!({"SSN": "1", "ssn": "2"});
        let redacted = redact_json(&body, &parse_rules(["ssn"]).unwrap(), DEFAULT_MASK);
        assert_eq!(redacted, json!({"SSN": "1", "ssn": "[MASKED]"}));
    }

    #[test]
    fn test_redactor_params() {
        let redactor = Redactor::new()
            .request_field("token")
            .unwrap()
            .request_field("$.token")
            .unwrap();
        let mut params = BTreeMap::new();
        params.insert("token".to_string(), vec!["abc".to_string()]);
        params.insert("page".to_string(), vec!["2".to_string()]);

        let redacted = redactor.params(&params, |values: &Vec<String>, mask| {
            vec![mask.to_string(); values.len()]
        });

        assert_eq!(redacted["token"], vec!["[MASKED]".to_string()]);
        assert_eq!(redacted["page"], vec!["2".to_string()]);
    }

    #[test]
    fn test_form_fields_masked_by_bare_names() {
        let redactor = Redactor::new()
            .request_field("password")
            .unwrap()
            .request_field("$.user")
            .unwrap();

        assert_eq!(
            redactor.request_form("user=ann&password=hunter%202").as_deref(),
            Some("user=ann&password=%5BMASKED%5D")
        );
        assert_eq!(redactor.request_form("q=a%20b").as_deref(), Some("q=a%20b"));
        assert_eq!(redactor.response_form("password=x").as_deref(), Some("password=x"));
    }

    #[test]
    fn test_redactor_from_config() {
        let config = ProbeConfig::new()
            .redact_headers(["X-Api-Key"])
            .redact_request_body(["password"])
            .redact_response_body(["$.token"])
            .mask("<hidden>");
        let redactor = Redactor::from_config(&config).unwrap();

        assert!(redactor.is_sensitive_header("x-api-key"));
        assert_eq!(redactor.mask(), "<hidden>");
        assert_eq!(
            redactor.response_body(&json!({"token": "t", "password": "p"})),
            json!({"token": "<hidden>", "password": "p"})
        );
        assert_eq!(
            redactor.request_body(&json!({"token": "t", "password": "p"})),
            json!({"token": "t", "password": "<hidden>"})
        );
    }

    #[test]
    fn test_redactor_from_config_rejects_bad_rule() {
        let config = ProbeConfig::new().redact_response_body(["$.a["]);
        assert!(matches!(
            Redactor::from_config(&config),
            Err(ProbeError::InvalidRule { .. })
        ));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-c]{1,2}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn same_shape(a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Object(x), Value::Object(y)) => {
                x.len() == y.len()
                    && x.iter().all(|(k, v)| match y.get(k) {
                        Some(w) => w == &Value::String("[MASKED]".into()) || same_shape(v, w),
                        None => false,
                    })
            }
            (Value::Array(x), Value::Array(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(v, w)| same_shape(v, w))
            }
            (_, Value::String(s)) if s == "[MASKED]" => true,
            _ => a == b,
        }
    }

    proptest! {
        #[test]
        fn prop_redaction_preserves_shape(body in arb_json(), name in "[a-c]{1,2}") {
            let rules = vec![FieldRule::Name(name.clone())];
            let redacted = redact_json(&body, &rules, DEFAULT_MASK);
            prop_assert!(same_shape(&body, &redacted));
        }

        #[test]
        fn prop_header_redaction_preserves_count_and_order(
            entries in prop::collection::vec(("[a-e]{1,3}", "[ -~]{0,12}"), 0..12),
            rules in prop::collection::vec("[a-e]{1,3}", 0..3),
        ) {
            let mut headers = HeaderList::new();
            for (name, value) in &entries {
                headers.append(name.clone(), value.clone());
            }
            let redactor = rules.iter().fold(Redactor::new(), |r, name| r.header(name));
            let redacted = redactor.headers(&headers);

            prop_assert_eq!(redacted.len(), headers.len());
            for ((name, before), (redacted_name, after)) in headers.iter().zip(redacted.iter()) {
                prop_assert_eq!(name, redacted_name);
                prop_assert_eq!(before.len(), after.len());
                if rules.iter().any(|r| r.eq_ignore_ascii_case(name)) {
                    prop_assert!(after.iter().all(|v| v == DEFAULT_MASK));
                } else {
                    prop_assert_eq!(before, after);
                }
            }
        }
    }
}
