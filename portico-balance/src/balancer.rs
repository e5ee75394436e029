use crate::active_health::HealthView;
use crate::breaker::BreakerRegistry;
use crate::passive_health::PassiveHealthChecker;
use crate::ring::{DEFAULT_REPLICAS, HashRing};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use portico_core::GatewayError;
use portico_core::snapshot::ConfigSnapshot;
use portico_core::upstream::{Algorithm, Upstream};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Per-upstream balancing state.
///
/// Replaced wholesale when the upstream definition changes; readers always
/// see either the old or the new record, never a partial mutation. The ring
/// is itself swapped atomically on health changes.
struct UpstreamState {
    upstream: Arc<Upstream>,
    addrs: Vec<String>,
    addr_index: HashMap<String, usize>,
    rr_cursor: AtomicUsize,
    /// Smooth weighted round-robin accumulators, aligned to targets
    current_weights: Mutex<Vec<i64>>,
    /// In-flight request counters, aligned to targets
    inflight: Vec<AtomicU32>,
    ring: ArcSwap<HashRing>,
}

impl UpstreamState {
    fn new(upstream: Arc<Upstream>, replicas: usize) -> Self {
        let addrs = upstream.target_addrs();
        let addr_index = addrs
            .iter()
            .enumerate()
            .map(|(i, a)| (a.clone(), i))
            .collect();
        let ring = HashRing::build(&addrs, replicas);
        Self {
            addr_index,
            rr_cursor: AtomicUsize::new(0),
            current_weights: Mutex::new(vec![0; upstream.targets.len()]),
            inflight: (0..upstream.targets.len()).map(|_| AtomicU32::new(0)).collect(),
            ring: ArcSwap::new(Arc::new(ring)),
            addrs,
            upstream,
        }
    }
}

/// A selected target. Holds an in-flight slot that is released on drop, on
/// every exit path including cancellation.
pub struct Selection {
    pub addr: String,
    pub upstream: Arc<Upstream>,
    state: Arc<UpstreamState>,
    index: usize,
}

impl Selection {
    pub fn inflight(&self) -> u32 {
        self.state.inflight[self.index].load(Ordering::Relaxed)
    }
}

impl Drop for Selection {
    fn drop(&mut self) {
        self.state.inflight[self.index].fetch_sub(1, Ordering::Relaxed);
    }
}

/// Target selection across upstreams, consulting the active and passive
/// health views and circuit-breaker state.
///
/// A target is selectable iff it is actively healthy AND not passively
/// isolated AND its breaker is not Open (recovery-expired Open counts as
/// selectable so admission can move it to HalfOpen).
pub struct LoadBalancer {
    states: DashMap<String, Arc<UpstreamState>>,
    health: Arc<HealthView>,
    passive: Arc<PassiveHealthChecker>,
    breakers: Arc<BreakerRegistry>,
    replicas: usize,
}

impl LoadBalancer {
    pub fn new(
        health: Arc<HealthView>,
        passive: Arc<PassiveHealthChecker>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            states: DashMap::new(),
            health,
            passive,
            breakers,
            replicas: DEFAULT_REPLICAS,
        }
    }

    /// Align per-upstream state with a published snapshot. Unchanged
    /// upstreams keep their state (cursors, inflight counts, ring).
    pub fn reconcile(&self, snapshot: &ConfigSnapshot) {
        for upstream in snapshot.upstreams.values() {
            let unchanged = self
                .states
                .get(&upstream.id)
                .map(|s| *s.upstream == **upstream)
                .unwrap_or(false);
            if !unchanged {
                debug!(upstream = %upstream.id, "Balancer state rebuilt");
                self.states.insert(
                    upstream.id.clone(),
                    Arc::new(UpstreamState::new(Arc::clone(upstream), self.replicas)),
                );
            }
        }
        self.states
            .retain(|id, _| snapshot.upstreams.contains_key(id));
        info!(upstreams = self.states.len(), "Balancer reconciled");
    }

    /// Rebuild an upstream's hash ring from its current healthy set.
    /// Invoked by health-change callbacks; never mutates the old ring.
    pub fn rebuild_ring(&self, upstream_id: &str) {
        let Some(state) = self.states.get(upstream_id).map(|s| Arc::clone(&s)) else {
            return;
        };
        let members = self.ring_members(upstream_id, &state);
        state
            .ring
            .store(Arc::new(HashRing::build(&members, self.replicas)));
        debug!(upstream = %upstream_id, members = members.len(), "Hash ring rebuilt");
    }

    /// Ring membership: active-healthy and not isolated. Breaker state is
    /// checked at selection time instead, so breaker flaps do not churn
    /// the ring.
    fn ring_members(&self, upstream_id: &str, state: &UpstreamState) -> Vec<String> {
        state
            .addrs
            .iter()
            .filter(|addr| {
                self.health.is_healthy(upstream_id, addr)
                    && !self.passive.is_isolated(upstream_id, addr)
            })
            .cloned()
            .collect()
    }

    fn selectable(&self, upstream_id: &str, addr: &str) -> bool {
        self.health.is_healthy(upstream_id, addr)
            && !self.passive.is_isolated(upstream_id, addr)
            && self.breakers.is_selectable(upstream_id, addr)
    }

    /// Select a target for one attempt. `exclude` carries the targets
    /// already tried by this request's earlier attempts.
    pub fn select(
        &self,
        upstream_id: &str,
        client_ip: &str,
        exclude: &[String],
    ) -> Result<Selection, GatewayError> {
        let state = self
            .states
            .get(upstream_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| GatewayError::UpstreamNotFound(upstream_id.to_string()))?;

        let healthy: Vec<usize> = (0..state.addrs.len())
            .filter(|&i| {
                let addr = &state.addrs[i];
                !exclude.contains(addr) && self.selectable(upstream_id, addr)
            })
            .collect();

        if healthy.is_empty() {
            return Err(GatewayError::NoHealthyTarget(upstream_id.to_string()));
        }

        let index = match state.upstream.algorithm {
            Algorithm::RoundRobin => {
                let n = state.rr_cursor.fetch_add(1, Ordering::Relaxed);
                healthy[n % healthy.len()]
            }
            Algorithm::Weighted => smooth_weighted_pick(&state, &healthy),
            Algorithm::LeastConn => *healthy
                .iter()
                .min_by_key(|&&i| {
                    (state.inflight[i].load(Ordering::Relaxed), &state.addrs[i])
                })
                .unwrap(),
            Algorithm::IpHash => self.ip_hash_pick(upstream_id, &state, &healthy, client_ip),
        };

        state.inflight[index].fetch_add(1, Ordering::Relaxed);
        Ok(Selection {
            addr: state.addrs[index].clone(),
            upstream: Arc::clone(&state.upstream),
            index,
            state,
        })
    }

    fn ip_hash_pick(
        &self,
        upstream_id: &str,
        state: &Arc<UpstreamState>,
        healthy: &[usize],
        client_ip: &str,
    ) -> usize {
        let members = self.ring_members(upstream_id, state);
        let mut ring = state.ring.load_full();

        // The callback-driven rebuild may not have landed yet; refresh the
        // ring here when its membership is stale.
        if ring.addrs() != members.as_slice() {
            let rebuilt = Arc::new(HashRing::build(&members, self.replicas));
            state.ring.store(Arc::clone(&rebuilt));
            ring = rebuilt;
        }

        if let Some(addr) = ring.select(client_ip)
            && let Some(&i) = state.addr_index.get(addr)
            && healthy.contains(&i)
        {
            return i;
        }
        // Ring pick was excluded (retry) or breaker-gated: deterministic
        // fallback to the first selectable target.
        healthy[0]
    }

    /// Current inflight count for a target (observability).
    pub fn inflight(&self, upstream_id: &str, target_addr: &str) -> u32 {
        self.states
            .get(upstream_id)
            .and_then(|s| {
                s.addr_index
                    .get(target_addr)
                    .map(|&i| s.inflight[i].load(Ordering::Relaxed))
            })
            .unwrap_or(0)
    }
}

/// Smooth weighted round robin: add each effective weight to its
/// accumulator, pick the max, subtract the healthy total from the winner.
fn smooth_weighted_pick(state: &UpstreamState, healthy: &[usize]) -> usize {
    let mut weights = state.current_weights.lock().unwrap();
    let mut total: i64 = 0;
    for &i in healthy {
        let w = state.upstream.targets[i].weight as i64;
        weights[i] += w;
        total += w;
    }
    let mut best = healthy[0];
    for &i in &healthy[1..] {
        if weights[i] > weights[best] {
            best = i;
        }
    }
    weights[best] -= total;
    best
}
