//! Route template and path parameter discovery.
//!
//! Only the host router knows which pattern matched a request. A
//! [`RouteResolver`] is the small capability an adapter needs from it. Route
//! templates are reported in `{name}` / `{*name}` form whatever syntax the
//! host uses.

use apiprobe_core::ProbeError;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// The route pattern and parameters of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchedRoute {
    /// Route pattern, e.g. `/users/{id}`.
    pub template: Option<String>,
    /// Parameter values by name.
    pub params: BTreeMap<String, String>,
}

impl MatchedRoute {
    /// A route with `template` and no parameters yet.
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: Some(template.into()),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Extracts routing information the payload needs from a request.
pub trait RouteResolver: Clone + Send + Sync + 'static {
    /// Route template and parameters.
    fn resolve(&self, parts: &http::request::Parts) -> MatchedRoute;

    /// Address of the connected peer, if the host recorded one.
    ///
    /// The default reads a [`SocketAddr`] request extension.
    fn remote_addr(&self, parts: &http::request::Parts) -> Option<String> {
        parts
            .extensions
            .get::<SocketAddr>()
            .map(|addr| addr.ip().to_string())
    }
}

/// Reads a [`MatchedRoute`] that the host inserted into the request
/// extensions. Requests without one are reported with no template.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionRoute;

impl RouteResolver for ExtensionRoute {
    fn resolve(&self, parts: &http::request::Parts) -> MatchedRoute {
        parts
            .extensions
            .get::<MatchedRoute>()
            .cloned()
            .unwrap_or_default()
    }
}

/// A fixed route table, for hosts that do not route with templates
/// themselves.
///
/// ```ignore
/// let routes = TemplateRoutes::new(["/users/{id}", "/files/{*path}"])?;
/// ```
#[derive(Clone)]
pub struct TemplateRoutes {
    router: Arc<matchit::Router<String>>,
    count: usize,
}

impl TemplateRoutes {
    /// Build the table. Fails on malformed or conflicting templates.
    pub fn new<I, S>(templates: I) -> Result<Self, ProbeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut router = matchit::Router::new();
        let mut count = 0;
        for template in templates {
            let template = template.as_ref();
            router
                .insert(to_matchit(template), normalize_template(template))
                .map_err(|e| ProbeError::InvalidRoute {
                    template: template.to_string(),
                    reason: e.to_string(),
                })?;
            count += 1;
        }
        Ok(Self {
            router: Arc::new(router),
            count,
        })
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Match a path against the table.
    pub fn match_path(&self, path: &str) -> Option<MatchedRoute> {
        let matched = self.router.at(path).ok()?;
        Some(MatchedRoute {
            template: Some(matched.value.clone()),
            params: matched
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }
}

impl RouteResolver for TemplateRoutes {
    fn resolve(&self, parts: &http::request::Parts) -> MatchedRoute {
        self.match_path(parts.uri.path())
            .or_else(|| parts.extensions.get::<MatchedRoute>().cloned())
            .unwrap_or_default()
    }
}

/// Adapts a closure into a [`RouteResolver`].
#[derive(Clone)]
pub struct FnRoute<F>(F);

/// Resolve routes with `f`.
pub fn route_fn<F>(f: F) -> FnRoute<F>
where
    F: Fn(&http::request::Parts) -> MatchedRoute + Clone + Send + Sync + 'static,
{
    FnRoute(f)
}

impl<F> RouteResolver for FnRoute<F>
where
    F: Fn(&http::request::Parts) -> MatchedRoute + Clone + Send + Sync + 'static,
{
    fn resolve(&self, parts: &http::request::Parts) -> MatchedRoute {
        (self.0)(parts)
    }
}

/// `{id}` -> `:id`, `{*rest}` -> `*rest`; the syntax `matchit` expects.
fn to_matchit(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push('*');
                } else {
                    out.push(':');
                }
            }
            '}' => {}
            _ => out.push(ch),
        }
    }
    out
}

/// `:id` -> `{id}`, `*rest` -> `{*rest}`. Braced templates are unchanged.
pub fn normalize_template(template: &str) -> String {
    template
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*') {
                format!("{{*{name}}}")
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Bind the parameters of `template` against `path`.
///
/// Accepts `{name}`, `{*name}`, `:name` and `*name` segments. Returns `None`
/// when the path does not fit the template.
pub fn match_template(template: &str, path: &str) -> Option<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    let mut path_segments = path.split('/');

    for (index, pattern) in template.split('/').enumerate() {
        let catch_all = pattern
            .strip_prefix("{*")
            .and_then(|p| p.strip_suffix('}'))
            .or_else(|| pattern.strip_prefix('*'));
        if let Some(name) = catch_all {
            let rest: Vec<&str> = path_segments.collect();
            if index > 0 && rest.is_empty() {
                return None;
            }
            params.insert(name.to_string(), rest.join("/"));
            return Some(params);
        }

        let segment = path_segments.next()?;
        let named = pattern
            .strip_prefix('{')
            .and_then(|p| p.strip_suffix('}'))
            .or_else(|| pattern.strip_prefix(':'));
        match named {
            Some(name) => {
                if segment.is_empty() {
                    return None;
                }
                params.insert(name.to_string(), segment.to_string());
            }
            None if pattern == segment => {}
            None => return None,
        }
    }

    match path_segments.next() {
        None => Some(params),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parts(path: &str) -> http::request::Parts {
        http::Request::builder()
            .uri(path)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[test]
    fn test_to_matchit() {
        assert_eq!(to_matchit("/users/{id}"), "/users/:id");
        assert_eq!(to_matchit("/files/{*path}"), "/files/*path");
        assert_eq!(to_matchit("/static"), "/static");
    }

    #[test]
    fn test_normalize_template() {
        assert_eq!(normalize_template("/users/:id/posts/:post"), "/users/{id}/posts/{post}");
        assert_eq!(normalize_template("/assets/*rest"), "/assets/{*rest}");
        assert_eq!(normalize_template("/users/{id}"), "/users/{id}");
    }

    #[test]
    fn test_template_routes() {
        let routes = TemplateRoutes::new(["/users/{id}", "/users/{id}/posts/{post}", "/files/{*path}"]).unwrap();
        assert_eq!(routes.len(), 3);

        let matched = routes.resolve(&parts("/users/42/posts/7?x=1"));
        assert_eq!(matched.template.as_deref(), Some("/users/{id}/posts/{post}"));
        assert_eq!(matched.params["id"], "42");
        assert_eq!(matched.params["post"], "7");

        let matched = routes.resolve(&parts("/files/a/b.txt"));
        assert_eq!(matched.template.as_deref(), Some("/files/{*path}"));
        assert_eq!(matched.params["path"], "a/b.txt");

        assert_eq!(routes.resolve(&parts("/nope")), MatchedRoute::default());
    }

    #[test]
    fn test_template_routes_reject_conflicts() {
        let err = TemplateRoutes::new(["/users/{id}", "/users/{name}"]).err().unwrap();
        assert!(matches!(err, ProbeError::InvalidRoute { .. }));
    }

    #[test]
    fn test_extension_route() {
        let mut parts = parts("/orders/9");
        assert_eq!(ExtensionRoute.resolve(&parts), MatchedRoute::default());

        parts
            .extensions
            .insert(MatchedRoute::new("/orders/{id}").param("id", "9"));
        let matched = ExtensionRoute.resolve(&parts);
        assert_eq!(matched.template.as_deref(), Some("/orders/{id}"));
        assert_eq!(matched.params["id"], "9");
    }

    #[test]
    fn test_default_remote_addr() {
        let mut parts = parts("/");
        assert_eq!(ExtensionRoute.remote_addr(&parts), None);
        parts
            .extensions
            .insert("192.0.2.10:5000".parse::<SocketAddr>().unwrap());
        assert_eq!(ExtensionRoute.remote_addr(&parts).as_deref(), Some("192.0.2.10"));
    }

    #[test]
    fn test_route_fn() {
        let resolver = route_fn(|parts: &http::request::Parts| {
            MatchedRoute::new("/any").param("path", parts.uri.path())
        });
        assert_eq!(resolver.resolve(&parts("/x")).params["path"], "/x");
    }

    #[test]
    fn test_match_template() {
        let params = match_template("/users/{id}", "/users/42").unwrap();
        assert_eq!(params["id"], "42");

        let params = match_template("/users/:id/posts/:post", "/users/1/posts/2").unwrap();
        assert_eq!(params["post"], "2");

        let params = match_template("/files/{*path}", "/files/a/b/c").unwrap();
        assert_eq!(params["path"], "a/b/c");

        assert!(match_template("/users/{id}", "/users").is_none());
        assert!(match_template("/users/{id}", "/users/1/extra").is_none());
        assert!(match_template("/users/{id}", "/accounts/1").is_none());
        assert!(match_template("/users/{id}", "/users/").is_none());
    }

    proptest! {
        #[test]
        fn prop_match_template_binds_segments(
            a in "[a-z0-9]{1,8}",
            b in "[a-z0-9]{1,8}",
        ) {
            let path = format!("/orgs/{a}/repos/{b}");
            let params = match_template("/orgs/{org}/repos/{repo}", &path).unwrap();
            prop_assert_eq!(&params["org"], &a);
            prop_assert_eq!(&params["repo"], &b);
        }
    }
}
