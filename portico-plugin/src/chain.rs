use crate::plugin::{Filter, FilterResult, Phase, RequestContext};
use crate::registry::FilterRegistry;
use arc_swap::ArcSwap;
use futures_util::FutureExt;
use portico_core::GatewayError;
use portico_core::route::FilterSpec;
use portico_core::snapshot::ConfigSnapshot;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// An immutable, priority-ordered chain of configured filters.
///
/// Chains are assembled once per snapshot publish and shared by all workers;
/// requests already in flight keep the chain they started with.
pub struct FilterChain {
    phases: HashMap<Phase, Vec<ChainEntry>>,
    count: usize,
    needs_response_body: bool,
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("phases", &self.phases)
            .field("count", &self.count)
            .field("needs_response_body", &self.needs_response_body)
            .finish()
    }
}

struct ChainEntry {
    filter: Arc<dyn Filter>,
    name: String,
}

impl std::fmt::Debug for ChainEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainEntry").field("name", &self.name).finish()
    }
}

impl FilterChain {
    /// Build a chain from configured instances with resolved priorities.
    pub fn build(mut entries: Vec<(Arc<dyn Filter>, i32)>) -> Self {
        // Descending priority; stable sort keeps spec order for ties.
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        let mut phases: HashMap<Phase, Vec<ChainEntry>> = HashMap::new();
        let mut needs_response_body = false;
        let count = entries.len();

        for (filter, _) in entries {
            for phase in filter.phases() {
                if *phase == Phase::BodyFilter {
                    needs_response_body = true;
                }
                phases.entry(*phase).or_default().push(ChainEntry {
                    name: filter.name().to_string(),
                    filter: Arc::clone(&filter),
                });
            }
        }

        Self {
            phases,
            count,
            needs_response_body,
        }
    }

    pub fn empty() -> Self {
        Self::build(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// True when any filter wants the BodyFilter phase, which requires the
    /// forwarder to buffer the response body instead of streaming it.
    pub fn needs_response_body(&self) -> bool {
        self.needs_response_body
    }

    /// Execute all filters registered for one phase.
    ///
    /// Short-circuits on `Respond` and `Error`. A panicking filter is
    /// contained here and reported as an `Error` (the caller maps it to a
    /// 500) without poisoning the chain for other requests.
    pub async fn execute_phase(&self, phase: Phase, ctx: &mut RequestContext) -> FilterResult {
        let Some(entries) = self.phases.get(&phase) else {
            return FilterResult::Continue;
        };

        for entry in entries {
            debug!(filter = %entry.name, phase = %phase, "Executing filter");

            let outcome = AssertUnwindSafe(entry.filter.execute(phase, ctx))
                .catch_unwind()
                .await;

            match outcome {
                Ok(FilterResult::Continue) => {}
                Ok(FilterResult::Respond {
                    status,
                    headers,
                    body,
                }) => {
                    debug!(
                        filter = %entry.name,
                        phase = %phase,
                        status,
                        "Filter short-circuited"
                    );
                    return FilterResult::Respond {
                        status,
                        headers,
                        body,
                    };
                }
                Ok(FilterResult::Error(msg)) => {
                    error!(filter = %entry.name, phase = %phase, error = %msg, "Filter error");
                    return FilterResult::Error(msg);
                }
                Err(_) => {
                    error!(filter = %entry.name, phase = %phase, "Filter panicked");
                    return FilterResult::Error(format!("filter {} panicked", entry.name));
                }
            }
        }

        FilterResult::Continue
    }

    /// Pre-proxy phases in order: Rewrite → Access → BeforeProxy.
    pub async fn run_request_phases(&self, ctx: &mut RequestContext) -> FilterResult {
        for phase in [Phase::Rewrite, Phase::Access, Phase::BeforeProxy] {
            match self.execute_phase(phase, ctx).await {
                FilterResult::Continue => {}
                other => return other,
            }
        }
        FilterResult::Continue
    }

    /// Response phases: HeaderFilter → BodyFilter.
    pub async fn run_response_phases(&self, ctx: &mut RequestContext) -> FilterResult {
        for phase in [Phase::HeaderFilter, Phase::BodyFilter] {
            match self.execute_phase(phase, ctx).await {
                FilterResult::Continue => {}
                other => return other,
            }
        }
        FilterResult::Continue
    }

    /// Log phase: always runs, failures are logged and swallowed.
    pub async fn run_log_phase(&self, ctx: &mut RequestContext) {
        let Some(entries) = self.phases.get(&Phase::Log) else {
            return;
        };
        for entry in entries {
            let outcome = AssertUnwindSafe(entry.filter.execute(Phase::Log, ctx))
                .catch_unwind()
                .await;
            if let Ok(FilterResult::Error(msg)) = outcome {
                warn!(filter = %entry.name, error = %msg, "Log phase filter error (non-fatal)");
            } else if outcome.is_err() {
                warn!(filter = %entry.name, "Log phase filter panicked (non-fatal)");
            }
        }
    }
}

/// Assemble the per-route chain map for a snapshot.
///
/// Global filters apply to every route; a route-level spec of the same kind
/// overrides (or, when disabled, removes) the global one. Unknown kinds and
/// invalid filter configs reject the snapshot.
pub fn assemble_chains(
    registry: &FilterRegistry,
    snapshot: &ConfigSnapshot,
) -> Result<HashMap<String, Arc<FilterChain>>, GatewayError> {
    let mut chains = HashMap::with_capacity(snapshot.routes.len());

    for route in &snapshot.routes {
        if !route.enabled {
            continue;
        }

        // kind → spec, route-level last so it wins
        let mut merged: Vec<(&str, &FilterSpec)> = Vec::new();
        for spec in snapshot.global_filters.iter().chain(route.filters.iter()) {
            merged.retain(|(kind, _)| *kind != spec.kind.as_str());
            merged.push((spec.kind.as_str(), spec));
        }

        let mut entries: Vec<(Arc<dyn Filter>, i32)> = Vec::with_capacity(merged.len());
        for (kind, spec) in merged {
            if !spec.enabled {
                continue;
            }
            let factory = registry.get(kind).ok_or_else(|| {
                GatewayError::ConfigInvalid(format!(
                    "route {} references unknown filter kind: {}",
                    route.id, kind
                ))
            })?;
            factory.check_schema(&spec.config).map_err(|e| {
                GatewayError::ConfigInvalid(format!(
                    "route {} filter {} config: {}",
                    route.id, kind, e
                ))
            })?;
            let filter = factory.configure(&spec.config).map_err(|e| {
                GatewayError::ConfigInvalid(format!(
                    "route {} filter {}: {}",
                    route.id, kind, e
                ))
            })?;
            let priority = spec.priority.unwrap_or_else(|| factory.default_priority());
            entries.push((filter, priority));
        }

        chains.insert(route.id.clone(), Arc::new(FilterChain::build(entries)));
    }

    Ok(chains)
}

/// Atomically published route → chain map.
pub struct ChainManager {
    chains: ArcSwap<HashMap<String, Arc<FilterChain>>>,
    empty: Arc<FilterChain>,
}

impl ChainManager {
    pub fn new() -> Self {
        Self {
            chains: ArcSwap::new(Arc::new(HashMap::new())),
            empty: Arc::new(FilterChain::empty()),
        }
    }

    /// Rebuild all chains for a snapshot and swap them in.
    pub fn rebuild(
        &self,
        registry: &FilterRegistry,
        snapshot: &ConfigSnapshot,
    ) -> Result<(), GatewayError> {
        let chains = assemble_chains(registry, snapshot)?;
        let count = chains.len();
        self.chains.store(Arc::new(chains));
        info!(chains = count, "Filter chains rebuilt");
        Ok(())
    }

    /// Chain for a route; routes without filters get the shared empty chain.
    pub fn get(&self, route_id: &str) -> Arc<FilterChain> {
        self.chains
            .load()
            .get(route_id)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.empty))
    }
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Filter, FilterResult, Phase, RequestContext};
    use async_trait::async_trait;
    use portico_core::snapshot::GatewayState;

    struct TagFilter {
        name: String,
        tag: &'static str,
    }

    #[async_trait]
    impl Filter for TagFilter {
        fn name(&self) -> &str {
            &self.name
        }
        async fn execute(&self, _phase: Phase, ctx: &mut RequestContext) -> FilterResult {
            let mut order = ctx
                .get_var("order")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            order.push_str(self.tag);
            ctx.set_var("order", serde_json::Value::String(order));
            FilterResult::Continue
        }
    }

    struct RejectFilter;

    #[async_trait]
    impl Filter for RejectFilter {
        fn name(&self) -> &str {
            "reject"
        }
        async fn execute(&self, _phase: Phase, _ctx: &mut RequestContext) -> FilterResult {
            FilterResult::Respond {
                status: 403,
                headers: vec![],
                body: None,
            }
        }
    }

    struct PanicFilter;

    #[async_trait]
    impl Filter for PanicFilter {
        fn name(&self) -> &str {
            "boom"
        }
        async fn execute(&self, _phase: Phase, _ctx: &mut RequestContext) -> FilterResult {
            panic!("filter bug");
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new(
            "GET".into(),
            "/",
            HashMap::new(),
            "1.1.1.1".into(),
            "r1".into(),
            "us1".into(),
            Arc::new(ConfigSnapshot::empty()),
        )
    }

    #[tokio::test]
    async fn test_priority_order() {
        let chain = FilterChain::build(vec![
            (
                Arc::new(TagFilter {
                    name: "low".into(),
                    tag: "b",
                }) as Arc<dyn Filter>,
                10,
            ),
            (
                Arc::new(TagFilter {
                    name: "high".into(),
                    tag: "a",
                }) as Arc<dyn Filter>,
                100,
            ),
        ]);
        let mut c = ctx();
        let result = chain.execute_phase(Phase::Access, &mut c).await;
        assert!(matches!(result, FilterResult::Continue));
        assert_eq!(c.get_var("order").unwrap().as_str().unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_short_circuit_stops_chain() {
        let chain = FilterChain::build(vec![
            (Arc::new(RejectFilter) as Arc<dyn Filter>, 100),
            (
                Arc::new(TagFilter {
                    name: "after".into(),
                    tag: "x",
                }) as Arc<dyn Filter>,
                10,
            ),
        ]);
        let mut c = ctx();
        match chain.execute_phase(Phase::Access, &mut c).await {
            FilterResult::Respond { status, .. } => assert_eq!(status, 403),
            other => panic!("expected Respond, got {:?}", other),
        }
        assert!(c.get_var("order").is_none(), "later filter must not run");
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let chain = FilterChain::build(vec![(Arc::new(PanicFilter) as Arc<dyn Filter>, 0)]);
        let mut c = ctx();
        match chain.execute_phase(Phase::Access, &mut c).await {
            FilterResult::Error(msg) => assert!(msg.contains("panicked")),
            other => panic!("expected Error, got {:?}", other),
        }
        // Chain stays usable after the panic
        let mut c2 = ctx();
        let _ = chain.run_log_phase(&mut c2).await;
    }

    #[tokio::test]
    async fn test_identity_filter_is_transparent() {
        let base = FilterChain::build(vec![(
            Arc::new(TagFilter {
                name: "t".into(),
                tag: "t",
            }) as Arc<dyn Filter>,
            5,
        )]);
        let with_noop = FilterChain::build(vec![
            (
                Arc::new(TagFilter {
                    name: "t".into(),
                    tag: "t",
                }) as Arc<dyn Filter>,
                5,
            ),
            (
                Arc::new(TagFilter {
                    name: "noop".into(),
                    tag: "",
                }) as Arc<dyn Filter>,
                50,
            ),
        ]);
        let mut c1 = ctx();
        let mut c2 = ctx();
        let _ = base.run_request_phases(&mut c1).await;
        let _ = with_noop.run_request_phases(&mut c2).await;
        assert_eq!(
            c1.get_var("order").unwrap(),
            c2.get_var("order").unwrap(),
            "identity filter must not change observable output"
        );
    }

    // ── assembly ─────────────────────────────────────────────────

    struct CountingFactory;

    impl crate::plugin::FilterFactory for CountingFactory {
        fn kind(&self) -> &str {
            "tag"
        }
        fn default_priority(&self) -> i32 {
            7
        }
        fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
            let tag = config
                .get("tag")
                .and_then(|v| v.as_str())
                .unwrap_or("?")
                .to_string();
            Ok(Arc::new(TagFilter {
                name: format!("tag:{tag}"),
                tag: Box::leak(tag.into_boxed_str()),
            }))
        }
    }

    fn snapshot(yaml: &str) -> ConfigSnapshot {
        let state: GatewayState = serde_yaml::from_str(yaml).unwrap();
        ConfigSnapshot::from_state(state, 1).unwrap()
    }

    #[test]
    fn test_assemble_unknown_kind_rejected() {
        let reg = FilterRegistry::new();
        let snap = snapshot(
            r#"
upstreams:
  - id: us1
    targets: [{host: a, port: 80}]
routes:
  - id: r1
    paths: [{type: exact, value: /a}]
    upstream_id: us1
    filters:
      - kind: does-not-exist
"#,
        );
        let err = assemble_chains(&reg, &snap).unwrap_err();
        assert!(matches!(err, GatewayError::ConfigInvalid(_)));
    }

    #[test]
    fn test_assemble_route_overrides_global_and_disabled_removes() {
        let mut reg = FilterRegistry::new();
        reg.register(Arc::new(CountingFactory));
        let snap = snapshot(
            r#"
global_filters:
  - kind: tag
    config: {tag: global}
upstreams:
  - id: us1
    targets: [{host: a, port: 80}]
routes:
  - id: with-override
    paths: [{type: exact, value: /a}]
    upstream_id: us1
    filters:
      - kind: tag
        config: {tag: local}
  - id: with-global
    paths: [{type: exact, value: /b}]
    upstream_id: us1
  - id: opted-out
    paths: [{type: exact, value: /c}]
    upstream_id: us1
    filters:
      - kind: tag
        enabled: false
"#,
        );
        let chains = assemble_chains(&reg, &snap).unwrap();
        assert_eq!(chains["with-override"].len(), 1);
        assert_eq!(chains["with-global"].len(), 1);
        assert_eq!(chains["opted-out"].len(), 0);
    }

    #[test]
    fn test_chain_manager_returns_empty_for_unknown_route() {
        let mgr = ChainManager::new();
        assert!(mgr.get("nope").is_empty());
    }
}
