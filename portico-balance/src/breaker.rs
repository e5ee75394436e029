use crate::outcome::UpstreamOutcome;
use dashmap::DashMap;
use portico_core::snapshot::ConfigSnapshot;
use portico_core::upstream::BreakerSpec;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit state, also exposed as a plain integer for atomic reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation: forward and record outcomes
    Closed = 0,
    /// Reject without forwarding
    Open = 1,
    /// Bounded concurrent trials
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Observed by logging and metrics on every transition.
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Point-in-time statistics for one breaker.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub consecutive_failures: u32,
    pub last_transition: Instant,
}

/// Rolling request window: one-second buckets over `window_secs`.
#[derive(Debug)]
struct RollingWindow {
    buckets: Vec<Bucket>,
    started: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    second: u64,
    requests: u32,
    failures: u32,
}

impl RollingWindow {
    fn new(window_secs: u64) -> Self {
        Self {
            buckets: vec![Bucket::default(); window_secs.max(1) as usize],
            started: Instant::now(),
        }
    }

    fn record(&mut self, failure: bool) {
        let second = self.started.elapsed().as_secs() + 1; // 0 marks an empty bucket
        let len = self.buckets.len() as u64;
        let bucket = &mut self.buckets[(second % len) as usize];
        if bucket.second != second {
            *bucket = Bucket {
                second,
                requests: 0,
                failures: 0,
            };
        }
        bucket.requests += 1;
        if failure {
            bucket.failures += 1;
        }
    }

    /// (requests, failures) within the window ending now.
    fn totals(&self) -> (u32, u32) {
        let now = self.started.elapsed().as_secs() + 1;
        let len = self.buckets.len() as u64;
        let mut requests = 0;
        let mut failures = 0;
        for bucket in &self.buckets {
            if bucket.second != 0 && bucket.second + len > now {
                requests += bucket.requests;
                failures += bucket.failures;
            }
        }
        (requests, failures)
    }

    fn reset(&mut self) {
        self.buckets.fill(Bucket::default());
    }
}

struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_inflight: u32,
    half_open_successes: u32,
    window: RollingWindow,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    last_transition: Instant,
}

/// Per-target circuit breaker.
///
/// `can_execute()` is the single public admission gate: it reports
/// admissibility and performs the Open → HalfOpen transition once
/// `recovery_timeout` has elapsed, acquiring a half-open slot. The slot is
/// released when the outcome is recorded.
pub struct CircuitBreaker {
    name: String,
    spec: BreakerSpec,
    core: Mutex<BreakerCore>,
    /// Mirror of the state for lock-free peeking
    state_tag: AtomicU8,
    callbacks: Arc<Mutex<Vec<StateChangeCallback>>>,
}

impl CircuitBreaker {
    pub fn new(
        name: String,
        spec: BreakerSpec,
        callbacks: Arc<Mutex<Vec<StateChangeCallback>>>,
    ) -> Self {
        Self {
            core: Mutex::new(BreakerCore {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_inflight: 0,
                half_open_successes: 0,
                window: RollingWindow::new(spec.window_secs),
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                last_transition: Instant::now(),
            }),
            state_tag: AtomicU8::new(CircuitState::Closed as u8),
            spec,
            name,
            callbacks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state_tag.load(Ordering::Acquire))
    }

    /// Non-mutating selectability peek for the load balancer: Open targets
    /// stay selectable once the recovery timeout has elapsed so that
    /// `can_execute()` gets the chance to move them to HalfOpen.
    pub fn is_selectable(&self) -> bool {
        match self.state() {
            CircuitState::Open => {
                let core = self.core.lock().unwrap();
                core.opened_at
                    .map(|t| t.elapsed() >= self.recovery_timeout())
                    .unwrap_or(true)
            }
            _ => true,
        }
    }

    /// Admission gate. May transition Open → HalfOpen.
    pub fn can_execute(&self) -> bool {
        let mut transition = None;
        let admitted = {
            let mut core = self.core.lock().unwrap();
            match core.state {
                CircuitState::Closed => true,
                CircuitState::Open => {
                    let expired = core
                        .opened_at
                        .map(|t| t.elapsed() >= self.recovery_timeout())
                        .unwrap_or(true);
                    if expired {
                        transition =
                            Some(self.transition(&mut core, CircuitState::HalfOpen));
                        core.half_open_inflight = 1;
                        true
                    } else {
                        false
                    }
                }
                CircuitState::HalfOpen => {
                    if core.half_open_inflight < self.spec.max_half_open_requests {
                        core.half_open_inflight += 1;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        self.fire(transition);
        admitted
    }

    /// Record one attempt outcome. Must be called exactly once per admitted
    /// request, after the attempt completes.
    pub fn record(&self, outcome: &UpstreamOutcome) {
        let failure = outcome.is_failure(
            &self.spec.failure_status_codes,
            self.spec.timeout_as_failure,
        );
        let mut transition = None;
        {
            let mut core = self.core.lock().unwrap();
            core.total_requests += 1;
            if failure {
                core.failed_requests += 1;
            } else {
                core.successful_requests += 1;
            }
            core.window.record(failure);

            match core.state {
                CircuitState::Closed => {
                    if failure {
                        core.consecutive_failures += 1;
                        let (requests, failures) = core.window.totals();
                        let volume_trip = requests >= self.spec.request_volume_threshold
                            && failures as u64 * 100
                                > self.spec.error_percentage_threshold as u64 * requests as u64;
                        if core.consecutive_failures >= self.spec.failure_threshold
                            || volume_trip
                        {
                            transition = Some(self.transition(&mut core, CircuitState::Open));
                        }
                    } else {
                        core.consecutive_failures = 0;
                    }
                }
                CircuitState::HalfOpen => {
                    core.half_open_inflight = core.half_open_inflight.saturating_sub(1);
                    if failure {
                        transition = Some(self.transition(&mut core, CircuitState::Open));
                    } else {
                        core.half_open_successes += 1;
                        if core.half_open_successes >= self.spec.success_threshold {
                            transition = Some(self.transition(&mut core, CircuitState::Closed));
                        }
                    }
                }
                CircuitState::Open => {
                    // An attempt admitted in HalfOpen may finish after another
                    // trial already re-opened the circuit.
                    core.half_open_inflight = core.half_open_inflight.saturating_sub(1);
                }
            }
        }
        self.fire(transition);
    }

    pub fn stats(&self) -> BreakerStats {
        let core = self.core.lock().unwrap();
        let error_rate = if core.total_requests > 0 {
            core.failed_requests as f64 / core.total_requests as f64
        } else {
            0.0
        };
        BreakerStats {
            state: core.state,
            total_requests: core.total_requests,
            successful_requests: core.successful_requests,
            failed_requests: core.failed_requests,
            error_rate,
            consecutive_failures: core.consecutive_failures,
            last_transition: core.last_transition,
        }
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.spec.recovery_timeout_ms)
    }

    /// Apply a transition under the lock; returns (from, to) for callbacks.
    fn transition(
        &self,
        core: &mut BreakerCore,
        to: CircuitState,
    ) -> (CircuitState, CircuitState) {
        let from = core.state;
        core.state = to;
        core.last_transition = Instant::now();
        match to {
            CircuitState::Open => {
                core.opened_at = Some(Instant::now());
                core.half_open_successes = 0;
            }
            CircuitState::HalfOpen => {
                core.half_open_inflight = 0;
                core.half_open_successes = 0;
            }
            CircuitState::Closed => {
                core.opened_at = None;
                core.consecutive_failures = 0;
                core.half_open_inflight = 0;
                core.half_open_successes = 0;
                core.window.reset();
            }
        }
        self.state_tag.store(to as u8, Ordering::Release);
        (from, to)
    }

    /// Invoke callbacks outside the core lock.
    fn fire(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, %to, "Circuit opened"),
            _ => info!(breaker = %self.name, %from, %to, "Circuit transition"),
        }
        let callbacks = self.callbacks.lock().unwrap().clone();
        for cb in callbacks {
            cb(&self.name, from, to);
        }
    }
}

/// Registry of breakers keyed per (upstream, target).
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    specs: DashMap<String, Arc<BreakerSpec>>,
    callbacks: Arc<Mutex<Vec<StateChangeCallback>>>,
    default_spec: BreakerSpec,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
            specs: DashMap::new(),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            default_spec: BreakerSpec::default(),
        }
    }

    /// Register a state-change observer (logging, metrics).
    pub fn on_state_change(&self, cb: StateChangeCallback) {
        self.callbacks.lock().unwrap().push(cb);
    }

    /// Install per-upstream specs from a snapshot and drop breakers whose
    /// target no longer exists or whose spec changed (state restarts Closed).
    pub fn reconcile(&self, snapshot: &ConfigSnapshot) {
        let mut live = std::collections::HashSet::new();
        for upstream in snapshot.upstreams.values() {
            let spec = upstream.breaker.clone().unwrap_or_default();
            let changed = self
                .specs
                .get(&upstream.id)
                .map(|prev| **prev != spec)
                .unwrap_or(false);
            if changed {
                self.breakers
                    .retain(|key, _| !key.starts_with(&format!("{}/", upstream.id)));
            }
            self.specs.insert(upstream.id.clone(), Arc::new(spec));
            for target in &upstream.targets {
                live.insert(breaker_key(&upstream.id, &target.addr()));
            }
        }
        self.specs
            .retain(|id, _| snapshot.upstreams.contains_key(id));
        self.breakers.retain(|key, _| live.contains(key));
    }

    /// Get or create the breaker for a target.
    pub fn breaker(&self, upstream_id: &str, target_addr: &str) -> Arc<CircuitBreaker> {
        let key = breaker_key(upstream_id, target_addr);
        if let Some(existing) = self.breakers.get(&key) {
            return Arc::clone(&existing);
        }
        let spec = self
            .specs
            .get(upstream_id)
            .map(|s| (**s).clone())
            .unwrap_or_else(|| self.default_spec.clone());
        let created = Arc::new(CircuitBreaker::new(
            key.clone(),
            spec,
            Arc::clone(&self.callbacks),
        ));
        self.breakers
            .entry(key)
            .or_insert(created)
            .value()
            .clone()
    }

    pub fn record(&self, upstream_id: &str, target_addr: &str, outcome: &UpstreamOutcome) {
        self.breaker(upstream_id, target_addr).record(outcome);
    }

    pub fn is_selectable(&self, upstream_id: &str, target_addr: &str) -> bool {
        self.breaker(upstream_id, target_addr).is_selectable()
    }

    /// True when at least one target of the upstream would be admitted.
    pub fn any_admissible(&self, upstream_id: &str, target_addrs: &[String]) -> bool {
        target_addrs
            .iter()
            .any(|addr| self.is_selectable(upstream_id, addr))
    }

    pub fn stats(&self, upstream_id: &str, target_addr: &str) -> Option<BreakerStats> {
        let key = breaker_key(upstream_id, target_addr);
        self.breakers.get(&key).map(|b| b.stats())
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn breaker_key(upstream_id: &str, target_addr: &str) -> String {
    format!("{upstream_id}/{target_addr}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn breaker(spec: BreakerSpec) -> CircuitBreaker {
        CircuitBreaker::new("us1/a:80".into(), spec, Arc::new(Mutex::new(Vec::new())))
    }

    fn spec(failure_threshold: u32) -> BreakerSpec {
        BreakerSpec {
            failure_threshold,
            request_volume_threshold: 1000, // keep the volume trip out of the way
            ..BreakerSpec::default()
        }
    }

    const FAIL: UpstreamOutcome = UpstreamOutcome::Status(500);
    const OK: UpstreamOutcome = UpstreamOutcome::Status(200);

    #[test]
    fn test_trip_by_consecutive_failures() {
        let b = breaker(BreakerSpec {
            failure_threshold: 3,
            request_volume_threshold: 5,
            ..BreakerSpec::default()
        });
        b.record(&FAIL);
        b.record(&FAIL);
        assert_eq!(b.state(), CircuitState::Closed);
        b.record(&FAIL);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_execute());
    }

    #[test]
    fn test_boundary_one_below_threshold_stays_closed() {
        let b = breaker(spec(4));
        for _ in 0..3 {
            b.record(&FAIL);
        }
        assert_eq!(b.state(), CircuitState::Closed);
        b.record(&FAIL);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let b = breaker(spec(3));
        b.record(&FAIL);
        b.record(&FAIL);
        b.record(&OK);
        b.record(&FAIL);
        b.record(&FAIL);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_recover_via_half_open() {
        let b = breaker(BreakerSpec {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout_ms: 50,
            max_half_open_requests: 3,
            request_volume_threshold: 1000,
            ..BreakerSpec::default()
        });
        for _ in 0..3 {
            b.record(&FAIL);
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_execute());

        std::thread::sleep(Duration::from_millis(60));
        assert!(b.can_execute());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record(&OK);
        assert!(b.can_execute());
        b.record(&OK);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens_immediately() {
        let b = breaker(BreakerSpec {
            failure_threshold: 1,
            recovery_timeout_ms: 10,
            request_volume_threshold: 1000,
            ..BreakerSpec::default()
        });
        b.record(&FAIL);
        assert_eq!(b.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.can_execute());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record(&FAIL);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_execute());
    }

    #[test]
    fn test_half_open_concurrency_gate() {
        let b = breaker(BreakerSpec {
            failure_threshold: 1,
            recovery_timeout_ms: 10,
            max_half_open_requests: 2,
            success_threshold: 10,
            request_volume_threshold: 1000,
            ..BreakerSpec::default()
        });
        b.record(&FAIL);
        std::thread::sleep(Duration::from_millis(20));
        assert!(b.can_execute()); // slot 1 (transition)
        assert!(b.can_execute()); // slot 2
        assert!(!b.can_execute()); // gate full
        b.record(&OK); // releases a slot
        assert!(b.can_execute());
    }

    #[test]
    fn test_volume_trip_by_error_percentage() {
        let b = breaker(BreakerSpec {
            failure_threshold: 1000, // only the windowed condition can trip
            request_volume_threshold: 10,
            error_percentage_threshold: 50,
            window_secs: 10,
            ..BreakerSpec::default()
        });
        // 9 requests, 5 failures: volume not reached yet
        for i in 0..9 {
            b.record(if i % 2 == 0 { &FAIL } else { &OK });
        }
        assert_eq!(b.state(), CircuitState::Closed);
        // 10th request pushes volume to threshold with 6/10 = 60% > 50%
        b.record(&FAIL);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn test_volume_floor_prevents_early_trip() {
        let b = breaker(BreakerSpec {
            failure_threshold: 1000,
            request_volume_threshold: 100,
            error_percentage_threshold: 10,
            ..BreakerSpec::default()
        });
        for _ in 0..50 {
            b.record(&FAIL); // 100% failures but below volume floor
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_totals_invariant() {
        let b = breaker(spec(1000));
        for i in 0..37 {
            b.record(if i % 3 == 0 { &FAIL } else { &OK });
        }
        let s = b.stats();
        assert_eq!(
            s.total_requests,
            s.successful_requests + s.failed_requests
        );
        assert_eq!(s.total_requests, 37);
    }

    #[test]
    fn test_callbacks_fire_on_transition() {
        let count = Arc::new(AtomicUsize::new(0));
        let registry = BreakerRegistry::new();
        let seen = Arc::clone(&count);
        registry.on_state_change(Arc::new(move |_name, _from, to| {
            if to == CircuitState::Open {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let b = registry.breaker("us1", "a:80");
        // default failure_threshold is 5
        for _ in 0..5 {
            b.record(&FAIL);
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_returns_same_breaker() {
        let registry = BreakerRegistry::new();
        let a = registry.breaker("us1", "a:80");
        let b = registry.breaker("us1", "a:80");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.any_admissible("us1", &["a:80".to_string()]));
    }

    #[test]
    fn test_timeout_as_failure_flag() {
        let b = breaker(BreakerSpec {
            failure_threshold: 1,
            timeout_as_failure: false,
            request_volume_threshold: 1000,
            ..BreakerSpec::default()
        });
        b.record(&UpstreamOutcome::Timeout);
        assert_eq!(b.state(), CircuitState::Closed);
        b.record(&UpstreamOutcome::ConnectError);
        assert_eq!(b.state(), CircuitState::Open);
    }
}
