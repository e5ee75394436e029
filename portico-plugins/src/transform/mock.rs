use async_trait::async_trait;
use portico_plugin::plugin::{Filter, FilterFactory, FilterResult, Phase, RequestContext};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct MockResponseConfig {
    #[serde(default = "default_status")]
    status: u16,

    #[serde(default)]
    headers: HashMap<String, String>,

    /// Body: a JSON string is used verbatim, any other JSON value is
    /// serialized
    #[serde(default)]
    body: serde_json::Value,
}

fn default_status() -> u16 {
    200
}

/// Synthetic responses without upstream contact (stubbing, maintenance
/// pages).
pub struct MockResponseFilter {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

#[async_trait]
impl Filter for MockResponseFilter {
    fn name(&self) -> &str {
        "mock-response"
    }

    async fn execute(&self, _phase: Phase, _ctx: &mut RequestContext) -> FilterResult {
        FilterResult::Respond {
            status: self.status,
            headers: self.headers.clone(),
            body: Some(self.body.clone()),
        }
    }
}

pub struct MockResponseFactory;

impl FilterFactory for MockResponseFactory {
    fn kind(&self) -> &str {
        "mock-response"
    }

    fn default_priority(&self) -> i32 {
        50
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
        let cfg: MockResponseConfig = serde_json::from_value(config.clone())?;
        let (body, default_type) = match &cfg.body {
            serde_json::Value::String(s) => (s.clone().into_bytes(), "text/plain"),
            serde_json::Value::Null => (Vec::new(), "text/plain"),
            other => (serde_json::to_vec(other)?, "application/json"),
        };
        let mut headers: Vec<(String, String)> = cfg
            .headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        if !headers.iter().any(|(k, _)| k == "content-type") {
            headers.push(("content-type".into(), default_type.into()));
        }
        Ok(Arc::new(MockResponseFilter {
            status: cfg.status,
            headers,
            body,
        }))
    }
}
