use async_trait::async_trait;
use portico_core::consumer::Consumer;
use portico_core::snapshot::ConfigSnapshot;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Filter execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    /// Modify the request before anything else runs
    Rewrite = 0,
    /// Authentication, authorization, rate limiting
    Access = 1,
    /// Just before forwarding to the upstream
    BeforeProxy = 2,
    /// Modify response headers from the upstream
    HeaderFilter = 3,
    /// Modify the (buffered) response body
    BodyFilter = 4,
    /// Post-response logging (never fails the request)
    Log = 5,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Rewrite => "rewrite",
            Phase::Access => "access",
            Phase::BeforeProxy => "before_proxy",
            Phase::HeaderFilter => "header_filter",
            Phase::BodyFilter => "body_filter",
            Phase::Log => "log",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of filter execution.
#[derive(Debug)]
pub enum FilterResult {
    /// Continue to the next filter / phase
    Continue,

    /// Short-circuit with a synthetic response (e.g. 401, 403, 429, 503)
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },

    /// Filter failure; the chain turns this into a 500
    Error(String),
}

/// Identity attached by the auth filter on success.
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    /// Authenticated principal (username or token subject)
    pub user: Option<String>,
    /// Matched consumer id, if any
    pub consumer_id: Option<String>,
    /// Verified claims (JWT payload, introspection fields, ...)
    pub claims: HashMap<String, Value>,
    /// Which authenticator accepted the request
    pub method: String,
}

/// Mutable per-request state threaded through the chain.
///
/// Holds the snapshot acquired at request entry for the whole request
/// lifetime, so every filter and the forwarder observe one consistent
/// configuration.
pub struct RequestContext {
    // --- Request data ---
    pub method: String,
    pub path: String,
    pub query: String,
    /// Request headers, keys lowercased
    pub request_headers: HashMap<String, String>,
    /// Buffered request body (None when streaming / absent)
    pub request_body: Option<Vec<u8>>,
    pub client_ip: String,

    // --- Routing ---
    pub route_id: String,
    pub upstream_id: String,

    // --- Response data (populated after the upstream responds) ---
    pub response_status: Option<u16>,
    pub response_headers: Vec<(String, String)>,
    /// Buffered response body (None when streamed)
    pub response_body: Option<Vec<u8>>,

    // --- Identity ---
    pub consumer: Option<Arc<Consumer>>,
    pub auth: Option<AuthInfo>,

    // --- Filter scratch space ---
    pub vars: HashMap<String, Value>,

    // --- Forwarding ---
    /// Selected target key (`host:port`), set by the forwarder
    pub selected_target: Option<String>,

    pub request_start: Instant,

    /// Snapshot acquired at request entry
    pub snapshot: Arc<ConfigSnapshot>,
}

impl RequestContext {
    pub fn new(
        method: String,
        uri: &str,
        request_headers: HashMap<String, String>,
        client_ip: String,
        route_id: String,
        upstream_id: String,
        snapshot: Arc<ConfigSnapshot>,
    ) -> Self {
        let (path, query) = match uri.find('?') {
            Some(pos) => (uri[..pos].to_string(), uri[pos + 1..].to_string()),
            None => (uri.to_string(), String::new()),
        };

        Self {
            method,
            path,
            query,
            request_headers,
            request_body: None,
            client_ip,
            route_id,
            upstream_id,
            response_status: None,
            response_headers: Vec::new(),
            response_body: None,
            consumer: None,
            auth: None,
            vars: HashMap::new(),
            selected_target: None,
            request_start: Instant::now(),
            snapshot,
        }
    }

    /// Get a request header (names are stored lowercased).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: String) {
        self.request_headers
            .insert(name.to_ascii_lowercase(), value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.request_headers.remove(&name.to_ascii_lowercase());
    }

    /// Get a query parameter value.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            (k == name).then_some(v)
        })
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a response header, replacing any existing value.
    pub fn set_response_header(&mut self, name: &str, value: String) {
        self.remove_response_header(name);
        self.response_headers.push((name.to_string(), value));
    }

    pub fn remove_response_header(&mut self, name: &str) {
        self.response_headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.request_start.elapsed().as_secs_f64() * 1000.0
    }

    pub fn set_var(&mut self, key: &str, value: Value) {
        self.vars.insert(key.to_string(), value);
    }

    pub fn get_var(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }
}

/// A configured filter instance, bound into a chain.
///
/// Instances are shared across worker threads and invoked concurrently on
/// distinct requests; any internal mutable state must be guarded.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Filter kind name
    fn name(&self) -> &str;

    /// Phases this filter participates in
    fn phases(&self) -> &[Phase] {
        &[Phase::Access]
    }

    /// Execute the filter at the given phase
    async fn execute(&self, phase: Phase, ctx: &mut RequestContext) -> FilterResult;
}

/// Factory for a filter kind: validates config and builds instances at
/// chain-assembly time (snapshot publish).
pub trait FilterFactory: Send + Sync {
    /// Registered kind name (must be unique)
    fn kind(&self) -> &str;

    /// Default priority (higher runs first) when the spec sets none
    fn default_priority(&self) -> i32 {
        0
    }

    /// Validate kind-specific configuration
    fn check_schema(&self, config: &Value) -> anyhow::Result<()> {
        let _ = config;
        Ok(())
    }

    /// Build a configured instance
    fn configure(&self, config: &Value) -> anyhow::Result<Arc<dyn Filter>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new(
            "GET".into(),
            "/items?page=2&sort=asc",
            HashMap::from([("host".to_string(), "example.com".to_string())]),
            "1.2.3.4".into(),
            "r1".into(),
            "us1".into(),
            Arc::new(ConfigSnapshot::empty()),
        )
    }

    #[test]
    fn test_uri_split() {
        let c = ctx();
        assert_eq!(c.path, "/items");
        assert_eq!(c.query, "page=2&sort=asc");
        assert_eq!(c.query_param("page"), Some("2"));
        assert_eq!(c.query_param("sort"), Some("asc"));
        assert_eq!(c.query_param("missing"), None);
    }

    #[test]
    fn test_header_access_case_insensitive() {
        let mut c = ctx();
        assert_eq!(c.get_header("Host"), Some("example.com"));
        c.set_header("X-Custom", "v".into());
        assert_eq!(c.get_header("x-custom"), Some("v"));
        c.remove_header("X-CUSTOM");
        assert_eq!(c.get_header("x-custom"), None);
    }

    #[test]
    fn test_response_header_set_replaces() {
        let mut c = ctx();
        c.response_headers.push(("Content-Type".into(), "text/plain".into()));
        c.set_response_header("content-type", "application/json".into());
        assert_eq!(c.response_header("Content-Type"), Some("application/json"));
        assert_eq!(
            c.response_headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .count(),
            1
        );
    }

    #[test]
    fn test_phase_ordering() {
        assert!(Phase::Rewrite < Phase::Access);
        assert!(Phase::Access < Phase::BeforeProxy);
        assert!(Phase::HeaderFilter < Phase::BodyFilter);
        assert_eq!(Phase::Log.as_str(), "log");
    }
}
