use async_trait::async_trait;
use portico_plugin::plugin::{Filter, FilterFactory, FilterResult, Phase, RequestContext};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct CorsConfig {
    #[serde(default = "default_origins")]
    allowed_origins: Vec<String>,

    #[serde(default = "default_methods")]
    allowed_methods: Vec<String>,

    #[serde(default = "default_headers")]
    allowed_headers: Vec<String>,

    #[serde(default)]
    expose_headers: Vec<String>,

    #[serde(default)]
    allow_credentials: bool,

    /// Preflight cache lifetime (seconds)
    #[serde(default = "default_max_age")]
    max_age: u64,
}

fn default_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"]
        .map(String::from)
        .to_vec()
}

fn default_headers() -> Vec<String> {
    vec!["content-type".into(), "authorization".into(), "apikey".into()]
}

fn default_max_age() -> u64 {
    3600
}

/// CORS: preflight short-circuit in Access, response headers in
/// HeaderFilter.
pub struct CorsFilter {
    config: CorsConfig,
}

impl CorsFilter {
    /// Resolve the Allow-Origin value for a request origin, if allowed.
    fn allow_origin(&self, origin: Option<&str>) -> Option<String> {
        let origin = origin?;
        if self.config.allowed_origins.iter().any(|o| o == "*") {
            // The wildcard cannot be combined with credentials
            if self.config.allow_credentials {
                return Some(origin.to_string());
            }
            return Some("*".to_string());
        }
        self.config
            .allowed_origins
            .iter()
            .find(|o| o.eq_ignore_ascii_case(origin))
            .cloned()
    }

    fn common_headers(&self, allow_origin: &str) -> Vec<(String, String)> {
        let mut headers = vec![
            ("access-control-allow-origin".into(), allow_origin.to_string()),
            ("vary".into(), "origin".into()),
        ];
        if self.config.allow_credentials {
            headers.push(("access-control-allow-credentials".into(), "true".into()));
        }
        headers
    }
}

#[async_trait]
impl Filter for CorsFilter {
    fn name(&self) -> &str {
        "cors"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Access, Phase::HeaderFilter]
    }

    async fn execute(&self, phase: Phase, ctx: &mut RequestContext) -> FilterResult {
        match phase {
            Phase::Access => {
                let is_preflight = ctx.method == "OPTIONS"
                    && ctx.get_header("origin").is_some()
                    && ctx.get_header("access-control-request-method").is_some();
                if !is_preflight {
                    return FilterResult::Continue;
                }
                let Some(allow_origin) = self.allow_origin(ctx.get_header("origin")) else {
                    return FilterResult::Respond {
                        status: 403,
                        headers: vec![],
                        body: None,
                    };
                };
                let mut headers = self.common_headers(&allow_origin);
                headers.push((
                    "access-control-allow-methods".into(),
                    self.config.allowed_methods.join(", "),
                ));
                headers.push((
                    "access-control-allow-headers".into(),
                    self.config.allowed_headers.join(", "),
                ));
                headers.push((
                    "access-control-max-age".into(),
                    self.config.max_age.to_string(),
                ));
                FilterResult::Respond {
                    status: 204,
                    headers,
                    body: None,
                }
            }
            Phase::HeaderFilter => {
                if let Some(allow_origin) = self.allow_origin(ctx.get_header("origin")) {
                    for (name, value) in self.common_headers(&allow_origin) {
                        ctx.set_response_header(&name, value);
                    }
                    if !self.config.expose_headers.is_empty() {
                        ctx.set_response_header(
                            "access-control-expose-headers",
                            self.config.expose_headers.join(", "),
                        );
                    }
                }
                FilterResult::Continue
            }
            _ => FilterResult::Continue,
        }
    }
}

pub struct CorsFactory;

impl FilterFactory for CorsFactory {
    fn kind(&self) -> &str {
        "cors"
    }

    fn default_priority(&self) -> i32 {
        4000
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
        let config: CorsConfig = serde_json::from_value(config.clone())?;
        Ok(Arc::new(CorsFilter { config }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_core::snapshot::ConfigSnapshot;
    use std::collections::HashMap;

    fn ctx(method: &str, headers: &[(&str, &str)]) -> RequestContext {
        let headers: HashMap<String, String> = headers
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_string()))
            .collect();
        RequestContext::new(
            method.into(),
            "/",
            headers,
            "1.1.1.1".into(),
            "r1".into(),
            "us1".into(),
            Arc::new(ConfigSnapshot::empty()),
        )
    }

    fn cors(config: serde_json::Value) -> Arc<dyn Filter> {
        CorsFactory.configure(&config).unwrap()
    }

    #[tokio::test]
    async fn test_preflight_short_circuits() {
        let f = cors(serde_json::json!({}));
        let mut c = ctx(
            "OPTIONS",
            &[
                ("origin", "https://app.example.com"),
                ("access-control-request-method", "POST"),
            ],
        );
        match f.execute(Phase::Access, &mut c).await {
            FilterResult::Respond { status, headers, .. } => {
                assert_eq!(status, 204);
                assert!(
                    headers
                        .iter()
                        .any(|(k, v)| k == "access-control-allow-origin" && v == "*")
                );
                assert!(headers.iter().any(|(k, _)| k == "access-control-allow-methods"));
            }
            other => panic!("expected preflight response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_plain_options_passes_through() {
        let f = cors(serde_json::json!({}));
        let mut c = ctx("OPTIONS", &[]);
        assert!(matches!(
            f.execute(Phase::Access, &mut c).await,
            FilterResult::Continue
        ));
    }

    #[tokio::test]
    async fn test_disallowed_origin_preflight_403() {
        let f = cors(serde_json::json!({"allowed_origins": ["https://good.example"]}));
        let mut c = ctx(
            "OPTIONS",
            &[
                ("origin", "https://evil.example"),
                ("access-control-request-method", "GET"),
            ],
        );
        assert!(matches!(
            f.execute(Phase::Access, &mut c).await,
            FilterResult::Respond { status: 403, .. }
        ));
    }

    #[tokio::test]
    async fn test_response_headers_added() {
        let f = cors(serde_json::json!({"expose_headers": ["x-request-id"]}));
        let mut c = ctx("GET", &[("origin", "https://app.example.com")]);
        let _ = f.execute(Phase::HeaderFilter, &mut c).await;
        assert_eq!(c.response_header("access-control-allow-origin"), Some("*"));
        assert_eq!(
            c.response_header("access-control-expose-headers"),
            Some("x-request-id")
        );
    }

    #[tokio::test]
    async fn test_credentials_echo_origin_instead_of_wildcard() {
        let f = cors(serde_json::json!({"allow_credentials": true}));
        let mut c = ctx("GET", &[("origin", "https://app.example.com")]);
        let _ = f.execute(Phase::HeaderFilter, &mut c).await;
        assert_eq!(
            c.response_header("access-control-allow-origin"),
            Some("https://app.example.com")
        );
        assert_eq!(
            c.response_header("access-control-allow-credentials"),
            Some("true")
        );
    }
}
