use crate::passive_health::HealthChangeCallback;
use dashmap::DashMap;
use portico_core::snapshot::ConfigSnapshot;
use portico_core::upstream::{ActiveHealthSpec, Upstream};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared active-health flags, read by the load balancer on every selection.
///
/// Targets with no probe configured (or not probed yet) read as healthy.
pub struct HealthView {
    statuses: DashMap<String, bool>,
}

impl HealthView {
    pub fn new() -> Self {
        Self {
            statuses: DashMap::new(),
        }
    }

    pub fn is_healthy(&self, upstream_id: &str, target_addr: &str) -> bool {
        self.statuses
            .get(&view_key(upstream_id, target_addr))
            .map(|v| *v)
            .unwrap_or(true)
    }

    pub fn set(&self, upstream_id: &str, target_addr: &str, healthy: bool) {
        self.statuses
            .insert(view_key(upstream_id, target_addr), healthy);
    }

    /// Drop flags for targets that no longer exist.
    pub fn retain_targets(&self, live: &std::collections::HashSet<String>) {
        self.statuses.retain(|key, _| live.contains(key));
    }
}

impl Default for HealthView {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn view_key(upstream_id: &str, target_addr: &str) -> String {
    format!("{upstream_id}/{target_addr}")
}

/// Consecutive-threshold state machine for one probed target.
///
/// Transitions are idempotent: `record` returns `Some(healthy)` only when
/// the flag flips, so duplicate callbacks are suppressed by construction.
#[derive(Debug)]
pub struct ProbeTracker {
    healthy: bool,
    successes: u32,
    failures: u32,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl ProbeTracker {
    pub fn new(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            healthy: true,
            successes: 0,
            failures: 0,
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Record one probe result; returns the new state when it changes.
    pub fn record(&mut self, success: bool) -> Option<bool> {
        if success {
            self.failures = 0;
            self.successes += 1;
            if !self.healthy && self.successes >= self.healthy_threshold {
                self.healthy = true;
                return Some(true);
            }
        } else {
            self.successes = 0;
            self.failures += 1;
            if self.healthy && self.failures >= self.unhealthy_threshold {
                self.healthy = false;
                return Some(false);
            }
        }
        None
    }
}

/// Probe-driven health checking: one periodic task per upstream.
///
/// Tasks run on the background tokio runtime; `reconcile` must be called
/// from that runtime. An upstream's task is kept across publishes when its
/// probe config and target set are unchanged, so probe counters survive
/// unrelated config edits.
pub struct ActiveHealthChecker {
    view: Arc<HealthView>,
    tasks: Mutex<HashMap<String, ProbeTask>>,
    callbacks: Arc<Mutex<Vec<HealthChangeCallback>>>,
}

struct ProbeTask {
    fingerprint: String,
    handle: tokio::task::JoinHandle<()>,
}

impl ActiveHealthChecker {
    pub fn new(view: Arc<HealthView>) -> Self {
        Self {
            view,
            tasks: Mutex::new(HashMap::new()),
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn on_change(&self, cb: HealthChangeCallback) {
        self.callbacks.lock().unwrap().push(cb);
    }

    /// Align probe tasks with a published snapshot: abort tasks for removed
    /// or reconfigured upstreams, spawn tasks for new probe configs.
    pub fn reconcile(&self, snapshot: &ConfigSnapshot) {
        let mut tasks = self.tasks.lock().unwrap();
        let mut live_targets = std::collections::HashSet::new();

        let mut wanted: HashMap<String, (Arc<Upstream>, ActiveHealthSpec, String)> =
            HashMap::new();
        for upstream in snapshot.upstreams.values() {
            for target in &upstream.targets {
                live_targets.insert(view_key(&upstream.id, &target.addr()));
            }
            if let Some(spec) = upstream.health.as_ref().and_then(|h| h.active.clone()) {
                let fingerprint = serde_json::to_string(&(&spec, upstream.target_addrs()))
                    .unwrap_or_default();
                wanted.insert(upstream.id.clone(), (Arc::clone(upstream), spec, fingerprint));
            }
        }

        // Abort stale tasks
        tasks.retain(|upstream_id, task| {
            let keep = wanted
                .get(upstream_id)
                .map(|(_, _, fp)| *fp == task.fingerprint)
                .unwrap_or(false);
            if !keep {
                debug!(upstream = %upstream_id, "Stopping probe task");
                task.handle.abort();
            }
            keep
        });

        // Spawn missing tasks
        for (upstream_id, (upstream, spec, fingerprint)) in wanted {
            if tasks.contains_key(&upstream_id) {
                continue;
            }
            let handle = spawn_probe_task(
                upstream,
                spec,
                Arc::clone(&self.view),
                Arc::clone(&self.callbacks),
            );
            tasks.insert(
                upstream_id,
                ProbeTask {
                    fingerprint,
                    handle,
                },
            );
        }

        self.view.retain_targets(&live_targets);
    }

    /// Abort all probe tasks (shutdown).
    pub fn stop(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, task) in tasks.drain() {
            task.handle.abort();
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

fn spawn_probe_task(
    upstream: Arc<Upstream>,
    spec: ActiveHealthSpec,
    view: Arc<HealthView>,
    callbacks: Arc<Mutex<Vec<HealthChangeCallback>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(spec.timeout_secs))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(upstream = %upstream.id, error = %e, "Probe client build failed");
                return;
            }
        };

        // Jittered start so probe bursts do not align across upstreams
        let interval_ms = spec.interval_secs.max(1) * 1000;
        let jitter = rand::thread_rng().gen_range(0..interval_ms);
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        let mut trackers: HashMap<String, ProbeTracker> = upstream
            .targets
            .iter()
            .map(|t| {
                (
                    t.addr(),
                    ProbeTracker::new(spec.healthy_threshold, spec.unhealthy_threshold),
                )
            })
            .collect();

        let mut tick = tokio::time::interval(Duration::from_secs(spec.interval_secs.max(1)));
        info!(
            upstream = %upstream.id,
            targets = upstream.targets.len(),
            interval = spec.interval_secs,
            "Active health checking started"
        );

        loop {
            tick.tick().await;

            for target in &upstream.targets {
                let addr = target.addr();
                let url = format!("http://{}{}", addr, spec.http_path);

                // A probe that does not complete within the timeout counts
                // as one failure.
                let success = match client.get(&url).send().await {
                    Ok(resp) => spec.healthy_statuses.contains(&resp.status().as_u16()),
                    Err(_) => false,
                };

                let tracker = trackers
                    .entry(addr.clone())
                    .or_insert_with(|| {
                        ProbeTracker::new(spec.healthy_threshold, spec.unhealthy_threshold)
                    });
                if let Some(healthy) = tracker.record(success) {
                    if healthy {
                        info!(upstream = %upstream.id, target = %addr, "Target healthy");
                    } else {
                        warn!(upstream = %upstream.id, target = %addr, "Target unhealthy");
                    }
                    view.set(&upstream.id, &addr, healthy);
                    let cbs = callbacks.lock().unwrap().clone();
                    for cb in cbs {
                        cb(&upstream.id, &addr, healthy);
                    }
                }
            }
        }
    })
}
