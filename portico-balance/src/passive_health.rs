use crate::outcome::UpstreamOutcome;
use dashmap::DashMap;
use portico_core::snapshot::ConfigSnapshot;
use portico_core::upstream::PassiveHealthSpec;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Fired on isolation and recovery: `(upstream_id, target_addr, healthy)`.
pub type HealthChangeCallback = Arc<dyn Fn(&str, &str, bool) + Send + Sync>;

/// Point-in-time view of one target's passive record.
#[derive(Debug, Clone)]
pub struct PassiveStats {
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub isolated: bool,
    pub recovering: bool,
    pub total_failures: u64,
    pub total_successes: u64,
}

#[derive(Debug)]
struct TargetRecord {
    consecutive_failures: u32,
    consecutive_successes: u32,
    isolated: bool,
    isolated_until: Option<Instant>,
    /// Isolation has ended but the clearance run is not complete yet
    recovering: bool,
    total_failures: u64,
    total_successes: u64,
}

impl TargetRecord {
    fn new() -> Self {
        Self {
            consecutive_failures: 0,
            consecutive_successes: 0,
            isolated: false,
            isolated_until: None,
            recovering: false,
            total_failures: 0,
            total_successes: 0,
        }
    }
}

/// Outcome-driven target isolation.
///
/// Driven by the forwarder's recorded outcomes, not by probes. Once
/// `consecutive_failures` reaches the configured threshold the target is
/// isolated for `isolation_duration`; after expiry it becomes selectable in
/// probing mode, where a single success ends isolation (and fires the
/// recovery callback) and a failure re-arms it. Full clearance additionally
/// requires `consecutive_successes` successful outcomes.
pub struct PassiveHealthChecker {
    records: DashMap<String, Mutex<TargetRecord>>,
    specs: DashMap<String, Arc<PassiveHealthSpec>>,
    callbacks: Mutex<Vec<HealthChangeCallback>>,
    default_spec: PassiveHealthSpec,
}

impl PassiveHealthChecker {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            specs: DashMap::new(),
            callbacks: Mutex::new(Vec::new()),
            default_spec: PassiveHealthSpec::default(),
        }
    }

    pub fn on_change(&self, cb: HealthChangeCallback) {
        self.callbacks.lock().unwrap().push(cb);
    }

    /// Install per-upstream specs and drop records for vanished targets.
    pub fn reconcile(&self, snapshot: &ConfigSnapshot) {
        let mut live = std::collections::HashSet::new();
        for upstream in snapshot.upstreams.values() {
            let spec = upstream
                .health
                .as_ref()
                .and_then(|h| h.passive.clone())
                .unwrap_or_default();
            self.specs.insert(upstream.id.clone(), Arc::new(spec));
            for target in &upstream.targets {
                live.insert(record_key(&upstream.id, &target.addr()));
            }
        }
        self.specs
            .retain(|id, _| snapshot.upstreams.contains_key(id));
        self.records.retain(|key, _| live.contains(key));
    }

    /// Record one forwarded outcome for a target.
    pub fn record(&self, upstream_id: &str, target_addr: &str, outcome: &UpstreamOutcome) {
        let spec = self
            .specs
            .get(upstream_id)
            .map(|s| Arc::clone(&s))
            .unwrap_or_else(|| Arc::new(self.default_spec.clone()));
        let failure =
            outcome.is_failure(&spec.failure_status_codes, spec.timeout_as_failure);

        let key = record_key(upstream_id, target_addr);
        let entry = self
            .records
            .entry(key)
            .or_insert_with(|| Mutex::new(TargetRecord::new()));

        let mut fire_healthy: Option<bool> = None;
        {
            let mut record = entry.lock().unwrap();
            let now = Instant::now();
            let isolation = Duration::from_millis(spec.isolation_duration_ms);

            if failure {
                record.total_failures += 1;
                record.consecutive_failures += 1;
                record.consecutive_successes = 0;

                if record.isolated {
                    let expired = record.isolated_until.map(|t| now >= t).unwrap_or(true);
                    if expired {
                        // Probing failure: re-arm isolation for another round
                        record.isolated_until = Some(now + isolation);
                        warn!(
                            upstream = upstream_id,
                            target = target_addr,
                            "Probing failure, isolation re-armed"
                        );
                    }
                } else if record.consecutive_failures >= spec.consecutive_failures {
                    record.isolated = true;
                    record.isolated_until = Some(now + isolation);
                    record.recovering = false;
                    fire_healthy = Some(false);
                    warn!(
                        upstream = upstream_id,
                        target = target_addr,
                        failures = record.consecutive_failures,
                        "Target isolated"
                    );
                }
            } else {
                record.total_successes += 1;
                record.consecutive_successes += 1;
                record.consecutive_failures = 0;

                if record.isolated {
                    let expired = record.isolated_until.map(|t| now >= t).unwrap_or(true);
                    if expired {
                        record.isolated = false;
                        record.isolated_until = None;
                        record.recovering = true;
                        fire_healthy = Some(true);
                        info!(
                            upstream = upstream_id,
                            target = target_addr,
                            "Target recovered from isolation"
                        );
                    }
                }
                if record.recovering
                    && record.consecutive_successes >= spec.consecutive_successes
                {
                    record.recovering = false;
                }
            }
        }

        // Release the map guard before callbacks: they may read this
        // checker again (ring rebuilds consult isolation state).
        drop(entry);
        if let Some(healthy) = fire_healthy {
            let callbacks = self.callbacks.lock().unwrap().clone();
            for cb in callbacks {
                cb(upstream_id, target_addr, healthy);
            }
        }
    }

    /// True while the target must be excluded from selection. Expired
    /// isolation reads as selectable so probing traffic can reach it.
    pub fn is_isolated(&self, upstream_id: &str, target_addr: &str) -> bool {
        let key = record_key(upstream_id, target_addr);
        let Some(entry) = self.records.get(&key) else {
            return false;
        };
        let record = entry.lock().unwrap();
        record.isolated
            && record
                .isolated_until
                .map(|t| Instant::now() < t)
                .unwrap_or(false)
    }

    pub fn stats(&self, upstream_id: &str, target_addr: &str) -> Option<PassiveStats> {
        let key = record_key(upstream_id, target_addr);
        self.records.get(&key).map(|entry| {
            let record = entry.lock().unwrap();
            PassiveStats {
                consecutive_failures: record.consecutive_failures,
                consecutive_successes: record.consecutive_successes,
                isolated: record.isolated,
                recovering: record.recovering,
                total_failures: record.total_failures,
                total_successes: record.total_successes,
            }
        })
    }
}

impl Default for PassiveHealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

fn record_key(upstream_id: &str, target_addr: &str) -> String {
    format!("{upstream_id}/{target_addr}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FAIL: UpstreamOutcome = UpstreamOutcome::Status(500);
    const OK: UpstreamOutcome = UpstreamOutcome::Status(200);

    fn checker(consecutive_failures: u32, isolation_ms: u64) -> PassiveHealthChecker {
        let checker = PassiveHealthChecker::new();
        checker.specs.insert(
            "us1".to_string(),
            Arc::new(PassiveHealthSpec {
                consecutive_failures,
                consecutive_successes: 2,
                isolation_duration_ms: isolation_ms,
                ..PassiveHealthSpec::default()
            }),
        );
        checker
    }

    #[test]
    fn test_isolation_at_exact_threshold() {
        let c = checker(2, 60_000);
        c.record("us1", "a:80", &FAIL);
        assert!(!c.is_isolated("us1", "a:80"), "one failure below threshold");
        c.record("us1", "a:80", &FAIL);
        assert!(c.is_isolated("us1", "a:80"), "second failure isolates");
    }

    #[test]
    fn test_success_resets_failure_run() {
        let c = checker(3, 60_000);
        c.record("us1", "a:80", &FAIL);
        c.record("us1", "a:80", &FAIL);
        c.record("us1", "a:80", &OK);
        c.record("us1", "a:80", &FAIL);
        c.record("us1", "a:80", &FAIL);
        assert!(!c.is_isolated("us1", "a:80"));
    }

    #[test]
    fn test_isolation_then_recovery() {
        let c = checker(2, 1000);
        let recovered = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&recovered);
        c.on_change(Arc::new(move |_, _, healthy| {
            if healthy {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));

        c.record("us1", "a:80", &FAIL);
        c.record("us1", "a:80", &FAIL);
        assert!(c.is_isolated("us1", "a:80"));

        std::thread::sleep(Duration::from_millis(1100));
        // Isolation expired: selectable again for probing
        assert!(!c.is_isolated("us1", "a:80"));

        c.record("us1", "a:80", &OK);
        assert!(!c.is_isolated("us1", "a:80"));
        assert_eq!(recovered.load(Ordering::SeqCst), 1, "recovery callback fired");
        let stats = c.stats("us1", "a:80").unwrap();
        assert!(!stats.isolated);
        assert!(stats.recovering, "one success is not full clearance yet");

        c.record("us1", "a:80", &OK);
        let stats = c.stats("us1", "a:80").unwrap();
        assert!(!stats.recovering, "ConsecutiveSuccesses=2 clears fully");
    }

    #[test]
    fn test_probing_failure_rearms_isolation() {
        let c = checker(2, 50);
        c.record("us1", "a:80", &FAIL);
        c.record("us1", "a:80", &FAIL);
        assert!(c.is_isolated("us1", "a:80"));

        std::thread::sleep(Duration::from_millis(70));
        assert!(!c.is_isolated("us1", "a:80"), "expired isolation probes");
        c.record("us1", "a:80", &FAIL);
        assert!(c.is_isolated("us1", "a:80"), "probing failure re-isolates");
    }

    #[test]
    fn test_isolation_lasts_no_less_than_duration() {
        let c = checker(1, 200);
        c.record("us1", "a:80", &FAIL);
        assert!(c.is_isolated("us1", "a:80"));
        std::thread::sleep(Duration::from_millis(100));
        assert!(c.is_isolated("us1", "a:80"), "still within IsolationDuration");
    }

    #[test]
    fn test_totals_track_all_outcomes() {
        let c = checker(100, 1000);
        for i in 0..10 {
            c.record("us1", "a:80", if i % 2 == 0 { &OK } else { &FAIL });
        }
        let stats = c.stats("us1", "a:80").unwrap();
        assert_eq!(stats.total_successes, 5);
        assert_eq!(stats.total_failures, 5);
    }

    #[test]
    fn test_unknown_target_not_isolated() {
        let c = checker(1, 1000);
        assert!(!c.is_isolated("us1", "ghost:80"));
        assert!(c.stats("us1", "ghost:80").is_none());
    }
}
