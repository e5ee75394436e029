use crate::sidecar::{SidecarClient, SidecarRequest};
use async_trait::async_trait;
use futures_util::future::join_all;
use portico_plugin::plugin::{Filter, FilterFactory, FilterResult, Phase, RequestContext};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct Endpoint {
    name: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct AggregatorConfig {
    endpoints: Vec<Endpoint>,

    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Request aggregation: fan out to the configured endpoints concurrently,
/// merge their JSON bodies into one object keyed by endpoint name, and
/// answer without contacting the route's upstream.
pub struct AggregatorFilter {
    endpoints: Vec<Endpoint>,
    timeout_ms: u64,
    sidecar: Arc<SidecarClient>,
}

#[async_trait]
impl Filter for AggregatorFilter {
    fn name(&self) -> &str {
        "aggregator"
    }

    async fn execute(&self, _phase: Phase, ctx: &mut RequestContext) -> FilterResult {
        let auth_header = ctx.get_header("authorization").map(str::to_string);
        let calls = self.endpoints.iter().map(|endpoint| {
            let mut headers = vec![("accept".to_string(), "application/json".to_string())];
            if let Some(ref auth) = auth_header {
                headers.push(("authorization".to_string(), auth.clone()));
            }
            let request = SidecarRequest {
                method: "GET".into(),
                url: endpoint.url.clone(),
                headers,
                body: None,
                timeout_ms: self.timeout_ms,
            };
            async move { (endpoint.name.as_str(), self.sidecar.call(request).await) }
        });

        let mut merged = serde_json::Map::new();
        for (name, result) in join_all(calls).await {
            let value = match result {
                Ok(response) if response.status < 400 => {
                    serde_json::from_slice::<serde_json::Value>(&response.body)
                        .unwrap_or_else(|_| {
                            serde_json::Value::String(
                                String::from_utf8_lossy(&response.body).into_owned(),
                            )
                        })
                }
                Ok(response) => serde_json::json!({"error": response.status}),
                Err(e) => serde_json::json!({"error": e}),
            };
            merged.insert(name.to_string(), value);
        }

        let body = serde_json::to_vec(&serde_json::Value::Object(merged))
            .unwrap_or_else(|_| b"{}".to_vec());
        FilterResult::Respond {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Some(body),
        }
    }
}

pub struct AggregatorFactory {
    pub sidecar: Arc<SidecarClient>,
}

impl FilterFactory for AggregatorFactory {
    fn kind(&self) -> &str {
        "aggregator"
    }

    fn default_priority(&self) -> i32 {
        60
    }

    fn check_schema(&self, config: &serde_json::Value) -> anyhow::Result<()> {
        let cfg: AggregatorConfig = serde_json::from_value(config.clone())?;
        if cfg.endpoints.is_empty() {
            anyhow::bail!("aggregator needs at least one endpoint");
        }
        Ok(())
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
        let cfg: AggregatorConfig = serde_json::from_value(config.clone())?;
        Ok(Arc::new(AggregatorFilter {
            endpoints: cfg.endpoints,
            timeout_ms: cfg.timeout_ms,
            sidecar: Arc::clone(&self.sidecar),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_core::snapshot::ConfigSnapshot;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_merges_per_endpoint_results() {
        // Disconnected sidecar: every endpoint reports an error entry, but
        // the aggregate response still forms.
        let f = AggregatorFactory {
            sidecar: Arc::new(SidecarClient::disconnected()),
        }
        .configure(&serde_json::json!({
            "endpoints": [
                {"name": "users", "url": "http://users.internal/u"},
                {"name": "orders", "url": "http://orders.internal/o"}
            ]
        }))
        .unwrap();
        let mut c = RequestContext::new(
            "GET".into(),
            "/dashboard",
            HashMap::new(),
            "1.1.1.1".into(),
            "r1".into(),
            "us1".into(),
            Arc::new(ConfigSnapshot::empty()),
        );
        match f.execute(Phase::Access, &mut c).await {
            FilterResult::Respond { status, body, .. } => {
                assert_eq!(status, 200);
                let parsed: serde_json::Value =
                    serde_json::from_slice(&body.unwrap()).unwrap();
                assert!(parsed.get("users").is_some());
                assert!(parsed.get("orders").is_some());
            }
            other => panic!("expected aggregate response, got {other:?}"),
        }
    }

    #[test]
    fn test_schema_requires_endpoints() {
        let factory = AggregatorFactory {
            sidecar: Arc::new(SidecarClient::disconnected()),
        };
        assert!(factory.check_schema(&serde_json::json!({"endpoints": []})).is_err());
    }
}
