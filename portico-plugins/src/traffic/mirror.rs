use crate::sidecar::{SidecarClient, SidecarRequest};
use async_trait::async_trait;
use portico_plugin::plugin::{Filter, FilterFactory, FilterResult, Phase, RequestContext};
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct MirrorConfig {
    /// Mirror authority, e.g. "shadow.internal:8080"
    target: String,

    #[serde(default = "default_scheme")]
    scheme: String,

    /// Sampling percentage [0, 100]
    #[serde(default = "default_percentage")]
    percentage: u8,

    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
}

fn default_scheme() -> String {
    "http".into()
}

fn default_percentage() -> u8 {
    100
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Fire-and-forget traffic mirroring. The copy is handed to the background
/// sidecar; the primary request never waits on the mirror and mirror
/// failures are invisible to the client.
pub struct MirrorFilter {
    config: MirrorConfig,
    sidecar: Arc<SidecarClient>,
}

#[async_trait]
impl Filter for MirrorFilter {
    fn name(&self) -> &str {
        "traffic-mirror"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::BeforeProxy]
    }

    async fn execute(&self, _phase: Phase, ctx: &mut RequestContext) -> FilterResult {
        if self.config.percentage < 100
            && rand::thread_rng().gen_range(0..100) >= self.config.percentage
        {
            return FilterResult::Continue;
        }

        let query = if ctx.query.is_empty() {
            String::new()
        } else {
            format!("?{}", ctx.query)
        };
        let url = format!(
            "{}://{}{}{}",
            self.config.scheme, self.config.target, ctx.path, query
        );
        let headers = ctx
            .request_headers
            .iter()
            .filter(|(name, _)| *name != "host" && *name != "content-length")
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        self.sidecar.send(SidecarRequest {
            method: ctx.method.clone(),
            url,
            headers,
            body: ctx.request_body.clone(),
            timeout_ms: self.config.timeout_ms,
        });
        FilterResult::Continue
    }
}

pub struct MirrorFactory {
    pub sidecar: Arc<SidecarClient>,
}

impl FilterFactory for MirrorFactory {
    fn kind(&self) -> &str {
        "traffic-mirror"
    }

    fn default_priority(&self) -> i32 {
        100
    }

    fn check_schema(&self, config: &serde_json::Value) -> anyhow::Result<()> {
        let cfg: MirrorConfig = serde_json::from_value(config.clone())?;
        if cfg.target.is_empty() {
            anyhow::bail!("mirror target must be set");
        }
        if cfg.percentage > 100 {
            anyhow::bail!("percentage must be within [0, 100]");
        }
        Ok(())
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
        let config: MirrorConfig = serde_json::from_value(config.clone())?;
        Ok(Arc::new(MirrorFilter {
            config,
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
    async fn test_mirror_never_blocks_request() {
        let f = MirrorFactory {
            sidecar: Arc::new(SidecarClient::disconnected()),
        }
        .configure(&serde_json::json!({"target": "shadow.internal:9999"}))
        .unwrap();
        let mut c = RequestContext::new(
            "POST".into(),
            "/orders?id=1",
            HashMap::from([("host".to_string(), "gw".to_string())]),
            "1.1.1.1".into(),
            "r1".into(),
            "us1".into(),
            Arc::new(ConfigSnapshot::empty()),
        );
        c.request_body = Some(b"{}".to_vec());
        assert!(matches!(
            f.execute(Phase::BeforeProxy, &mut c).await,
            FilterResult::Continue
        ));
    }

    #[test]
    fn test_schema_validation() {
        let factory = MirrorFactory {
            sidecar: Arc::new(SidecarClient::disconnected()),
        };
        assert!(factory.check_schema(&serde_json::json!({"target": ""})).is_err());
        assert!(
            factory
                .check_schema(&serde_json::json!({"target": "x:1", "percentage": 101}))
                .is_err()
        );
        assert!(
            factory
                .check_schema(&serde_json::json!({"target": "x:1", "percentage": 50}))
                .is_ok()
        );
    }
}
