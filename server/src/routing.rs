//! Gateway route table.
//!
//! Routes are evaluated in order and the first prefix match wins. The
//! catch-all (`*`) entry, if present, must be the last one.
//!
//! # Text format
//!
//! `AUTHBUS_ROUTES` holds comma-separated entries of the form
//! `prefix=>target[=>rewrite][;session]`:
//!
//! ```text
//! /api/auth=>http://auth:3001,/api/feature=>http://feature:3002=>/api;session,*=>http://web:3000
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

const ROUTES_VAR: &str = "AUTHBUS_ROUTES";

/// Prefix that matches every path.
pub const CATCH_ALL: &str = "*";

/// Routes used when `AUTHBUS_ROUTES` is unset.
pub const DEFAULT_ROUTES: &str = "/api/auth=>http://127.0.0.1:3001,\
/api/main=>http://127.0.0.1:3001=>/api,\
/api/feature=>http://127.0.0.1:3002=>/api;session,\
/feature=>http://127.0.0.1:3001=>/;session,\
*=>http://127.0.0.1:3000";

/// Which paths a route covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPrefix {
    /// Matches `prefix` itself and anything below it on a segment boundary.
    Segment(String),
    CatchAll,
}

impl PathPrefix {
    fn matches(&self, path: &str) -> bool {
        match self {
            Self::CatchAll => true,
            Self::Segment(prefix) => match path.strip_prefix(prefix.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
                None => false,
            },
        }
    }
}

impl fmt::Display for PathPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CatchAll => f.write_str(CATCH_ALL),
            Self::Segment(prefix) => f.write_str(prefix),
        }
    }
}

/// One row of the route table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: PathPrefix,

    /// Upstream base URL, without a trailing slash.
    pub target: String,

    /// Replacement for the matched prefix. `None` forwards the path as is.
    pub rewrite: Option<String>,

    pub requires_session: bool,
}

impl Route {
    pub fn new(prefix: &str, target: impl Into<String>) -> Self {
        let prefix = if prefix == CATCH_ALL {
            PathPrefix::CatchAll
        } else {
            PathPrefix::Segment(prefix.to_string())
        };
        Self {
            prefix,
            target: target.into().trim_end_matches('/').to_string(),
            rewrite: None,
            requires_session: false,
        }
    }

    #[must_use]
    pub fn with_rewrite(mut self, rewrite: impl Into<String>) -> Self {
        self.rewrite = Some(rewrite.into());
        self
    }

    #[must_use]
    pub fn with_session(mut self) -> Self {
        self.requires_session = true;
        self
    }

    pub fn matches(&self, path: &str) -> bool {
        self.prefix.matches(path)
    }

    /// The path to request upstream for `path`, which must match this route.
    pub fn rewrite_path(&self, path: &str) -> String {
        let (PathPrefix::Segment(prefix), Some(replacement)) = (&self.prefix, &self.rewrite)
        else {
            return path.to_string();
        };
        let rest = path.strip_prefix(prefix.as_str()).unwrap_or(path);

        let joined = match (replacement.ends_with('/'), rest.starts_with('/')) {
            (true, true) => format!("{replacement}{}", &rest[1..]),
            (false, false) if !rest.is_empty() && !replacement.is_empty() => {
                format!("{replacement}/{rest}")
            }
            _ => format!("{replacement}{rest}"),
        };

        if joined.is_empty() {
            "/".to_string()
        } else {
            joined
        }
    }

    /// Full upstream URL for `path` and an optional raw query string.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        let path = self.rewrite_path(path);
        match query {
            Some(q) if !q.is_empty() => format!("{}{path}?{q}", self.target),
            _ => format!("{}{path}", self.target),
        }
    }
}

impl FromStr for Route {
    type Err = ConfigError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let (spec, flags) = match entry.split_once(';') {
            Some((spec, flags)) => (spec, Some(flags.trim())),
            None => (entry, None),
        };

        let mut parts = spec.split("=>").map(str::trim);
        let prefix = parts.next().unwrap_or_default();
        let target = parts.next().ok_or_else(|| {
            ConfigError::invalid(
                ROUTES_VAR,
                format!("expected 'prefix=>target', got '{entry}'"),
            )
        })?;
        let rewrite = parts.next();
        if parts.next().is_some() {
            return Err(ConfigError::invalid(
                ROUTES_VAR,
                format!("too many '=>' in '{entry}'"),
            ));
        }

        if prefix != CATCH_ALL && !prefix.starts_with('/') {
            return Err(ConfigError::invalid(
                ROUTES_VAR,
                format!("prefix must start with '/' or be '*', got '{prefix}'"),
            ));
        }
        if !target.starts_with("http://") && !target.starts_with("https://") {
            return Err(ConfigError::invalid(
                ROUTES_VAR,
                format!("target must be an http(s) URL, got '{target}'"),
            ));
        }

        let mut route = Route::new(prefix, target);
        if let Some(rewrite) = rewrite {
            if prefix == CATCH_ALL {
                return Err(ConfigError::invalid(
                    ROUTES_VAR,
                    "the catch-all route cannot rewrite paths",
                ));
            }
            route = route.with_rewrite(rewrite);
        }
        match flags {
            None => {}
            Some("session") => route = route.with_session(),
            Some(other) => {
                return Err(ConfigError::invalid(
                    ROUTES_VAR,
                    format!("unknown route flag '{other}'"),
                ))
            }
        }

        Ok(route)
    }
}

/// Resolves `.` and `..` segments, including percent-encoded dots, the way
/// URL parsing does, so routing sees the same path the upstream receives.
///
/// Returns `None` for paths that cannot be routed safely: ones not starting
/// with `/`, and ones with backslashes or encoded slashes, which parsers
/// disagree on.
pub fn normalize_path(path: &str) -> Option<String> {
    if !path.starts_with('/') || path.contains('\\') {
        return None;
    }
    let lowered = path.to_ascii_lowercase();
    if lowered.contains("%2f") || lowered.contains("%5c") {
        return None;
    }

    let mut segments: Vec<&str> = Vec::new();
    let mut raw = path[1..].split('/').peekable();
    while let Some(segment) = raw.next() {
        let last = raw.peek().is_none();
        match dot_segment(segment) {
            Some(Dot::Current) => {}
            Some(Dot::Parent) => {
                segments.pop();
            }
            None => {
                segments.push(segment);
                continue;
            }
        }
        // A trailing dot segment leaves a directory path behind.
        if last {
            segments.push("");
        }
    }
    Some(format!("/{}", segments.join("/")))
}

enum Dot {
    Current,
    Parent,
}

fn dot_segment(segment: &str) -> Option<Dot> {
    match segment.to_ascii_lowercase().replace("%2e", ".").as_str() {
        "." => Some(Dot::Current),
        ".." => Some(Dot::Parent),
        _ => None,
    }
}

/// Ordered, validated list of routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Builds a table, rejecting a catch-all that is not last or appears
    /// twice.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] when the ordering rule is
    /// broken or `routes` is empty.
    pub fn new(routes: Vec<Route>) -> Result<Self, ConfigError> {
        if routes.is_empty() {
            return Err(ConfigError::ValidationError(
                "route table must contain at least one route".to_string(),
            ));
        }

        let catch_alls = routes
            .iter()
            .filter(|r| r.prefix == PathPrefix::CatchAll)
            .count();
        if catch_alls > 1 {
            return Err(ConfigError::ValidationError(
                "only one catch-all route is allowed".to_string(),
            ));
        }
        if catch_alls == 1 && routes.last().map(|r| &r.prefix) != Some(&PathPrefix::CatchAll) {
            return Err(ConfigError::ValidationError(
                "the catch-all route must be last".to_string(),
            ));
        }

        Ok(Self { routes })
    }

    /// Parses the `AUTHBUS_ROUTES` text format.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for malformed entries or an invalid ordering.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let routes = raw
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Route>, _>>()?;
        Self::new(routes)
    }

    /// First route whose prefix covers `path`.
    pub fn select(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(path))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        // DEFAULT_ROUTES is covered by tests, so parsing it cannot fail.
        Self::parse(DEFAULT_ROUTES).unwrap_or_else(|_| Self {
            routes: vec![Route::new(CATCH_ALL, "http://127.0.0.1:3000")],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(vec![
            Route::new("/api/auth", "http://svc-a"),
            Route::new("/api/feature", "http://svc-b")
                .with_rewrite("/api")
                .with_session(),
            Route::new("*", "http://svc-c"),
        ])
        .unwrap()
    }

    #[test]
    fn normalizes_dot_segments() {
        assert_eq!(normalize_path("/").as_deref(), Some("/"));
        assert_eq!(normalize_path("/a/./b").as_deref(), Some("/a/b"));
        assert_eq!(normalize_path("/a/b/").as_deref(), Some("/a/b/"));
        assert_eq!(normalize_path("/a/b/..").as_deref(), Some("/a/"));
        assert_eq!(normalize_path("/../..").as_deref(), Some("/"));
        assert_eq!(
            normalize_path("/api/auth/../private/secret").as_deref(),
            Some("/api/private/secret")
        );
        assert_eq!(
            normalize_path("/api/auth/%2E%2e/private").as_deref(),
            Some("/api/private")
        );
        assert_eq!(normalize_path("/api/auth/.%2e/").as_deref(), Some("/api/"));
        assert_eq!(normalize_path("/files/..hidden").as_deref(), Some("/files/..hidden"));
    }

    #[test]
    fn rejects_ambiguous_paths() {
        assert!(normalize_path("relative").is_none());
        assert!(normalize_path("/api/auth\\..\\private").is_none());
        assert!(normalize_path("/api/auth/..%2Fprivate").is_none());
        assert!(normalize_path("/api/auth/..%5cprivate").is_none());
    }

    #[test]
    fn normalized_traversal_selects_target_route() {
        let table = table();
        let path = normalize_path("/api/auth/../feature/widgets").unwrap();
        let route = table.select(&path).unwrap();
        assert!(route.requires_session);
        assert_eq!(route.rewrite_path(&path), "/api/widgets");
    }

    #[test]
    fn first_prefix_match_wins() {
        let table = table();

        let route = table.select("/api/feature/widgets").unwrap();
        assert_eq!(route.target, "http://svc-b");
        assert!(route.requires_session);
        assert_eq!(route.rewrite_path("/api/feature/widgets"), "/api/widgets");

        assert_eq!(table.select("/api/auth/login").unwrap().target, "http://svc-a");
        assert_eq!(table.select("/index.html").unwrap().target, "http://svc-c");
    }

    #[test]
    fn prefix_respects_segment_boundaries() {
        let table = table();
        assert_eq!(table.select("/api/feature").unwrap().target, "http://svc-b");
        assert_eq!(table.select("/api/featureX").unwrap().target, "http://svc-c");
    }

    #[test]
    fn rewrite_joins_cleanly() {
        let to_root = Route::new("/feature", "http://x").with_rewrite("/");
        assert_eq!(to_root.rewrite_path("/feature"), "/");
        assert_eq!(to_root.rewrite_path("/feature/app.js"), "/app.js");

        let to_api = Route::new("/api/main", "http://x").with_rewrite("/api");
        assert_eq!(to_api.rewrite_path("/api/main"), "/api");
        assert_eq!(to_api.rewrite_path("/api/main/todos/1"), "/api/todos/1");

        let plain = Route::new("/api/auth", "http://x");
        assert_eq!(plain.rewrite_path("/api/auth/me"), "/api/auth/me");
    }

    #[test]
    fn upstream_url_keeps_query() {
        let route = Route::new("/api/feature", "http://svc-b/").with_rewrite("/api");
        assert_eq!(
            route.upstream_url("/api/feature/todos", Some("page=2")),
            "http://svc-b/api/todos?page=2"
        );
        assert_eq!(route.upstream_url("/api/feature", None), "http://svc-b/api");
    }

    #[test]
    fn catch_all_must_be_last_and_unique() {
        let not_last = RouteTable::new(vec![
            Route::new("*", "http://c"),
            Route::new("/api", "http://a"),
        ]);
        assert!(matches!(not_last, Err(ConfigError::ValidationError(_))));

        let twice = RouteTable::new(vec![Route::new("*", "http://c"), Route::new("*", "http://d")]);
        assert!(matches!(twice, Err(ConfigError::ValidationError(_))));

        assert!(RouteTable::new(Vec::new()).is_err());
    }

    #[test]
    fn table_without_catch_all_selects_nothing_for_unmatched() {
        let table = RouteTable::new(vec![Route::new("/api", "http://a")]).unwrap();
        assert!(table.select("/other").is_none());
    }

    #[test]
    fn parses_text_format() {
        let table = RouteTable::parse(
            "/api/auth=>http://a:3001, /api/feature=>http://b:3002=>/api;session, *=>http://c:3000",
        )
        .unwrap();

        assert_eq!(table.routes().len(), 3);
        let feature = &table.routes()[1];
        assert_eq!(feature.prefix, PathPrefix::Segment("/api/feature".to_string()));
        assert_eq!(feature.rewrite.as_deref(), Some("/api"));
        assert!(feature.requires_session);
        assert!(!table.routes()[0].requires_session);
        assert_eq!(table.routes()[2].prefix, PathPrefix::CatchAll);
    }

    #[test]
    fn rejects_malformed_entries() {
        for raw in [
            "/api",
            "api=>http://a",
            "/api=>ftp://a",
            "/api=>http://a;admin",
            "/api=>http://a=>/x=>/y",
            "*=>http://a=>/x",
        ] {
            assert!(
                matches!(RouteTable::parse(raw), Err(ConfigError::InvalidFormat { .. })),
                "accepted {raw}"
            );
        }
    }

    #[test]
    fn default_routes_parse() {
        let table = RouteTable::parse(DEFAULT_ROUTES).unwrap();
        assert_eq!(table, RouteTable::default());
        assert!(table.select("/api/feature/todos").unwrap().requires_session);
        assert!(!table.select("/api/auth/login").unwrap().requires_session);
        assert_eq!(table.select("/").unwrap().target, "http://127.0.0.1:3000");
    }
}
