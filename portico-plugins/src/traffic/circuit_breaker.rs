use async_trait::async_trait;
use portico_balance::breaker::BreakerRegistry;
use portico_plugin::plugin::{Filter, FilterFactory, FilterResult, Phase, RequestContext};
use std::sync::Arc;

/// Circuit-breaker admission gate.
///
/// The per-target gate itself lives in the forwarder (`can_execute` before
/// each attempt); this filter rejects early, without consuming a balancer
/// selection, when the route's upstream has no admissible target left.
pub struct CircuitBreakerFilter {
    breakers: Arc<BreakerRegistry>,
}

#[async_trait]
impl Filter for CircuitBreakerFilter {
    fn name(&self) -> &str {
        "circuit-breaker"
    }

    async fn execute(&self, _phase: Phase, ctx: &mut RequestContext) -> FilterResult {
        let Some(upstream) = ctx.snapshot.upstream(&ctx.upstream_id) else {
            return FilterResult::Continue;
        };
        let addrs = upstream.target_addrs();
        if self.breakers.any_admissible(&ctx.upstream_id, &addrs) {
            return FilterResult::Continue;
        }
        FilterResult::Respond {
            status: 503,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Some(
                format!(
                    r#"{{"error":"Circuit open for upstream {}","status":503}}"#,
                    ctx.upstream_id
                )
                .into_bytes(),
            ),
        }
    }
}

pub struct CircuitBreakerFactory {
    pub breakers: Arc<BreakerRegistry>,
}

impl FilterFactory for CircuitBreakerFactory {
    fn kind(&self) -> &str {
        "circuit-breaker"
    }

    fn default_priority(&self) -> i32 {
        900
    }

    fn configure(&self, _config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
        Ok(Arc::new(CircuitBreakerFilter {
            breakers: Arc::clone(&self.breakers),
        }))
    }
}
