use serde::{Deserialize, Serialize};

/// An Upstream is a pool of backend targets served by one balancing policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Upstream {
    /// Unique upstream identifier
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Load-balancing algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Backend targets (must be non-empty)
    pub targets: Vec<Target>,

    /// Scheme used when connecting: "http" (HTTPS targets are terminated
    /// by a collaborator in front of the pool)
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Health-check configuration
    #[serde(default)]
    pub health: Option<HealthCheckSpec>,

    /// Circuit-breaker configuration (per target)
    #[serde(default)]
    pub breaker: Option<BreakerSpec>,

    /// Retries on upstream failure (route may override)
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Connection timeout override (ms)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,

    /// Read timeout override (ms)
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
}

/// Load-balancing algorithm for an upstream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    Weighted,
    IpHash,
    LeastConn,
}

/// A concrete (host, port) backend instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Target {
    /// Identity key: `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckSpec {
    #[serde(default)]
    pub active: Option<ActiveHealthSpec>,

    #[serde(default)]
    pub passive: Option<PassiveHealthSpec>,
}

/// Active (probe-driven) health checking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveHealthSpec {
    /// Probe path, e.g. "/health"
    #[serde(default = "default_probe_path")]
    pub http_path: String,

    /// Probe interval (seconds)
    #[serde(default = "default_hc_interval")]
    pub interval_secs: u64,

    /// Per-probe timeout (seconds)
    #[serde(default = "default_hc_timeout")]
    pub timeout_secs: u64,

    /// Consecutive successful probes to mark a target healthy
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive failed probes to mark a target unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Probe statuses counted as success
    #[serde(default = "default_healthy_statuses")]
    pub healthy_statuses: Vec<u16>,
}

/// Passive (outcome-driven) health checking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassiveHealthSpec {
    /// Consecutive failures that isolate a target
    #[serde(default = "default_consecutive_failures")]
    pub consecutive_failures: u32,

    /// Consecutive successes required for full clearance after recovery
    #[serde(default = "default_consecutive_successes")]
    pub consecutive_successes: u32,

    /// Isolation duration (milliseconds)
    #[serde(default = "default_isolation_ms")]
    pub isolation_duration_ms: u64,

    /// Statuses recorded as failures
    #[serde(default = "default_failure_statuses")]
    pub failure_status_codes: Vec<u16>,

    /// Whether timeouts count as failures
    #[serde(default = "default_true")]
    pub timeout_as_failure: bool,
}

impl Default for PassiveHealthSpec {
    fn default() -> Self {
        Self {
            consecutive_failures: default_consecutive_failures(),
            consecutive_successes: default_consecutive_successes(),
            isolation_duration_ms: default_isolation_ms(),
            failure_status_codes: default_failure_statuses(),
            timeout_as_failure: true,
        }
    }
}

/// Per-target circuit-breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSpec {
    /// Consecutive failures that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive HalfOpen successes that close the breaker
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time spent Open before HalfOpen is allowed (milliseconds)
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    /// Concurrent trial requests admitted in HalfOpen
    #[serde(default = "default_max_half_open")]
    pub max_half_open_requests: u32,

    /// Minimum requests in the rolling window before the percentage trip applies
    #[serde(default = "default_request_volume")]
    pub request_volume_threshold: u32,

    /// Failure percentage (0-100) that trips the breaker once volume is met
    #[serde(default = "default_error_percentage")]
    pub error_percentage_threshold: u32,

    /// Rolling window length (seconds)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Statuses recorded as failures
    #[serde(default = "default_failure_statuses")]
    pub failure_status_codes: Vec<u16>,

    /// Whether timeouts count as failures
    #[serde(default = "default_true")]
    pub timeout_as_failure: bool,
}

impl Default for BreakerSpec {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            max_half_open_requests: default_max_half_open(),
            request_volume_threshold: default_request_volume(),
            error_percentage_threshold: default_error_percentage(),
            window_secs: default_window_secs(),
            failure_status_codes: default_failure_statuses(),
            timeout_as_failure: true,
        }
    }
}

impl Upstream {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// All target identity keys.
    pub fn target_addrs(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.addr()).collect()
    }
}

// Defaults

fn default_scheme() -> String {
    "http".into()
}
fn default_retries() -> u32 {
    1
}
fn default_weight() -> u32 {
    1
}
fn default_probe_path() -> String {
    "/health".into()
}
fn default_hc_interval() -> u64 {
    5
}
fn default_hc_timeout() -> u64 {
    3
}
fn default_healthy_threshold() -> u32 {
    2
}
fn default_unhealthy_threshold() -> u32 {
    3
}
fn default_healthy_statuses() -> Vec<u16> {
    vec![200, 302]
}
fn default_consecutive_failures() -> u32 {
    3
}
fn default_consecutive_successes() -> u32 {
    2
}
fn default_isolation_ms() -> u64 {
    30_000
}
fn default_failure_statuses() -> Vec<u16> {
    vec![500, 502, 503, 504, 505]
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    3
}
fn default_recovery_timeout_ms() -> u64 {
    30_000
}
fn default_max_half_open() -> u32 {
    3
}
fn default_request_volume() -> u32 {
    20
}
fn default_error_percentage() -> u32 {
    50
}
fn default_window_secs() -> u64 {
    10
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_upstream(targets: Vec<(&str, u16, u32)>) -> Upstream {
        serde_json::from_value(serde_json::json!({
            "id": "us1",
            "targets": targets
                .into_iter()
                .map(|(h, p, w)| serde_json::json!({"host": h, "port": p, "weight": w}))
                .collect::<Vec<_>>()
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults_from_serde() {
        let us = make_upstream(vec![("127.0.0.1", 8080, 1)]);
        assert_eq!(us.algorithm, Algorithm::RoundRobin);
        assert_eq!(us.scheme, "http");
        assert_eq!(us.retries, 1);
        assert!(!us.is_empty());
    }

    #[test]
    fn test_target_addr() {
        let t = Target {
            host: "10.0.0.1".into(),
            port: 9000,
            weight: 5,
        };
        assert_eq!(t.addr(), "10.0.0.1:9000");
    }

    #[test]
    fn test_target_weight_default() {
        let t: Target =
            serde_json::from_value(serde_json::json!({"host": "a", "port": 80})).unwrap();
        assert_eq!(t.weight, 1);
    }

    #[test]
    fn test_algorithm_serde_names() {
        let us: Upstream = serde_json::from_value(serde_json::json!({
            "id": "u",
            "algorithm": "ip_hash",
            "targets": [{"host": "a", "port": 80}]
        }))
        .unwrap();
        assert_eq!(us.algorithm, Algorithm::IpHash);
    }

    #[test]
    fn test_active_health_defaults() {
        let spec: ActiveHealthSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(spec.http_path, "/health");
        assert_eq!(spec.interval_secs, 5);
        assert_eq!(spec.timeout_secs, 3);
        assert_eq!(spec.healthy_threshold, 2);
        assert_eq!(spec.unhealthy_threshold, 3);
        assert_eq!(spec.healthy_statuses, vec![200, 302]);
    }

    #[test]
    fn test_breaker_spec_defaults() {
        let spec = BreakerSpec::default();
        assert_eq!(spec.failure_threshold, 5);
        assert_eq!(spec.success_threshold, 3);
        assert_eq!(spec.max_half_open_requests, 3);
        assert_eq!(spec.error_percentage_threshold, 50);
        assert_eq!(spec.failure_status_codes, vec![500, 502, 503, 504, 505]);
        assert!(spec.timeout_as_failure);
    }

    #[test]
    fn test_target_addrs() {
        let us = make_upstream(vec![("a", 80, 1), ("b", 81, 2)]);
        assert_eq!(us.target_addrs(), vec!["a:80", "b:81"]);
    }
}
