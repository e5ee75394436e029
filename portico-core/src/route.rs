use serde::{Deserialize, Serialize};

/// A Route maps matching requests to an upstream plus a per-route filter set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Unique route identifier
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Priority (higher = matched first, default 0)
    #[serde(default)]
    pub priority: i32,

    /// Host header matching (literal, or one-level wildcard `*.domain`)
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Allowed HTTP methods (empty = all methods)
    #[serde(default)]
    pub methods: Vec<HttpMethod>,

    /// Path rules (OR match); each rule is exactly one of exact/prefix/regex
    pub paths: Vec<PathRule>,

    /// Request header predicates (all must match)
    #[serde(default)]
    pub headers: Vec<HeaderPredicate>,

    /// Upstream serving this route
    pub upstream_id: String,

    /// Per-route filter configuration
    #[serde(default)]
    pub filters: Vec<FilterSpec>,

    /// Total per-request timeout override (milliseconds)
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Retry attempts override
    #[serde(default)]
    pub retries: Option<u32>,

    /// Per-attempt timeout override (milliseconds)
    #[serde(default)]
    pub retry_timeout_ms: Option<u64>,

    /// Whether this route is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// HTTP methods a route can constrain on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Connect,
    Trace,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Trace => "TRACE",
        }
    }
}

/// Path matching rule. Exactly one variant per rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PathRule {
    /// Full-path equality
    Exact(String),
    /// Segment-boundary prefix: `/api` matches `/api` and `/api/...`
    Prefix(String),
    /// Regular expression matched against the decoded path (anchor
    /// explicitly for full-path matches)
    Regex(String),
}

impl PathRule {
    /// Length of the literal prefix this rule pins down (used for the
    /// specificity tie-break: exact > regex > prefix, then longest prefix).
    pub fn literal_len(&self) -> usize {
        match self {
            PathRule::Exact(p) => p.len(),
            PathRule::Prefix(p) => p.len(),
            PathRule::Regex(_) => 0,
        }
    }
}

/// Request-header predicate: equality when `value` is set, presence otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderPredicate {
    pub name: String,

    #[serde(default)]
    pub value: Option<String>,
}

impl HeaderPredicate {
    /// Evaluate against a request header map (names already lowercased).
    pub fn matches(&self, headers: &[(&str, &str)]) -> bool {
        let name = self.name.to_ascii_lowercase();
        let found = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&name))
            .map(|(_, v)| *v);
        match (&self.value, found) {
            (Some(want), Some(got)) => want == got,
            (None, Some(_)) => true,
            (_, None) => false,
        }
    }
}

/// Filter binding: a kind plus its kind-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Registered filter kind, e.g. "rate-limit", "auth", "cors"
    pub kind: String,

    /// Priority override (higher runs first); `None` uses the kind's default
    #[serde(default)]
    pub priority: Option<i32>,

    /// Whether this filter is active
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Kind-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Route {
    /// Check if a given HTTP method is allowed by this route.
    pub fn method_allowed(&self, method: &str) -> bool {
        if self.methods.is_empty() {
            return true;
        }
        self.methods.iter().any(|m| m.as_str() == method)
    }
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_rule_serde() {
        let yaml = r#"
type: prefix
value: /api
"#;
        let rule: PathRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rule, PathRule::Prefix("/api".into()));
        assert_eq!(rule.literal_len(), 4);
    }

    #[test]
    fn test_regex_rule_has_no_literal_prefix() {
        assert_eq!(PathRule::Regex("^/v[0-9]+/".into()).literal_len(), 0);
        assert_eq!(PathRule::Exact("/health".into()).literal_len(), 7);
    }

    #[test]
    fn test_method_allowed_empty_means_all() {
        let route: Route = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "paths": [{"type": "exact", "value": "/a"}],
            "upstream_id": "u1"
        }))
        .unwrap();
        assert!(route.method_allowed("GET"));
        assert!(route.method_allowed("DELETE"));
        assert!(route.enabled);
    }

    #[test]
    fn test_method_allowed_constrained() {
        let route: Route = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "paths": [{"type": "exact", "value": "/a"}],
            "methods": ["GET", "HEAD"],
            "upstream_id": "u1"
        }))
        .unwrap();
        assert!(route.method_allowed("GET"));
        assert!(!route.method_allowed("POST"));
    }

    #[test]
    fn test_header_predicate_equality_and_presence() {
        let eq = HeaderPredicate {
            name: "X-Api-Version".into(),
            value: Some("2".into()),
        };
        let present = HeaderPredicate {
            name: "x-trace-id".into(),
            value: None,
        };
        let headers = [("x-api-version", "2"), ("x-trace-id", "abc")];
        assert!(eq.matches(&headers));
        assert!(present.matches(&headers));
        assert!(!eq.matches(&[("x-api-version", "3")]));
        assert!(!present.matches(&[("host", "a")]));
    }

    #[test]
    fn test_filter_spec_defaults() {
        let spec: FilterSpec =
            serde_json::from_value(serde_json::json!({"kind": "cors"})).unwrap();
        assert!(spec.enabled);
        assert!(spec.priority.is_none());
        assert!(spec.config.is_null());
    }
}
