use async_trait::async_trait;
use portico_plugin::plugin::{Filter, FilterFactory, FilterResult, Phase, RequestContext};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default, Deserialize)]
struct HeaderRules {
    /// Set these headers (replacing existing values)
    #[serde(default)]
    set: HashMap<String, String>,

    /// Add only when absent
    #[serde(default)]
    add: HashMap<String, String>,

    #[serde(default)]
    remove: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct HeaderTransformConfig {
    #[serde(default)]
    request: HeaderRules,

    #[serde(default)]
    response: HeaderRules,
}

/// Request/response header rewriting.
pub struct HeaderTransformFilter {
    config: HeaderTransformConfig,
}

#[async_trait]
impl Filter for HeaderTransformFilter {
    fn name(&self) -> &str {
        "header-transform"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::BeforeProxy, Phase::HeaderFilter]
    }

    async fn execute(&self, phase: Phase, ctx: &mut RequestContext) -> FilterResult {
        match phase {
            Phase::BeforeProxy => {
                let rules = &self.config.request;
                for name in &rules.remove {
                    ctx.remove_header(name);
                }
                for (name, value) in &rules.set {
                    ctx.set_header(name, value.clone());
                }
                for (name, value) in &rules.add {
                    if ctx.get_header(name).is_none() {
                        ctx.set_header(name, value.clone());
                    }
                }
            }
            Phase::HeaderFilter => {
                let rules = &self.config.response;
                for name in &rules.remove {
                    ctx.remove_response_header(name);
                }
                for (name, value) in &rules.set {
                    ctx.set_response_header(name, value.clone());
                }
                for (name, value) in &rules.add {
                    if ctx.response_header(name).is_none() {
                        ctx.set_response_header(name, value.clone());
                    }
                }
            }
            _ => {}
        }
        FilterResult::Continue
    }
}

pub struct HeaderTransformFactory;

impl FilterFactory for HeaderTransformFactory {
    fn kind(&self) -> &str {
        "header-transform"
    }

    fn default_priority(&self) -> i32 {
        500
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
        let config: HeaderTransformConfig = serde_json::from_value(config.clone())?;
        Ok(Arc::new(HeaderTransformFilter { config }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_core::snapshot::ConfigSnapshot;

    fn ctx() -> RequestContext {
        RequestContext::new(
            "GET".into(),
            "/",
            HashMap::from([
                ("x-internal".to_string(), "1".to_string()),
                ("x-keep".to_string(), "orig".to_string()),
            ]),
            "1.1.1.1".into(),
            "r1".into(),
            "us1".into(),
            Arc::new(ConfigSnapshot::empty()),
        )
    }

    #[tokio::test]
    async fn test_request_rules() {
        let f = HeaderTransformFactory
            .configure(&serde_json::json!({
                "request": {
                    "remove": ["x-internal"],
                    "set": {"x-gateway": "portico"},
                    "add": {"x-keep": "ignored", "x-new": "v"}
                }
            }))
            .unwrap();
        let mut c = ctx();
        let _ = f.execute(Phase::BeforeProxy, &mut c).await;
        assert!(c.get_header("x-internal").is_none());
        assert_eq!(c.get_header("x-gateway"), Some("portico"));
        assert_eq!(c.get_header("x-keep"), Some("orig"), "add must not replace");
        assert_eq!(c.get_header("x-new"), Some("v"));
    }

    #[tokio::test]
    async fn test_response_rules() {
        let f = HeaderTransformFactory
            .configure(&serde_json::json!({
                "response": {
                    "remove": ["server"],
                    "set": {"x-frame-options": "DENY"}
                }
            }))
            .unwrap();
        let mut c = ctx();
        c.response_headers.push(("Server".into(), "hidden/1.0".into()));
        let _ = f.execute(Phase::HeaderFilter, &mut c).await;
        assert!(c.response_header("server").is_none());
        assert_eq!(c.response_header("x-frame-options"), Some("DENY"));
    }
}
