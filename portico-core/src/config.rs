use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level static configuration for the Portico gateway process.
///
/// Loaded once at startup from YAML plus `PORTICO_`-prefixed environment
/// overrides. Routing state (routes/upstreams/consumers) lives in a separate
/// file consumed by the snapshot source, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway node ID (auto-generated if not set)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Proxy listener and data-plane tuning
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Configuration source (routing state file)
    #[serde(default)]
    pub source: SourceConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// HTTP listener address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Number of worker threads (0 = one per core)
    #[serde(default)]
    pub workers: usize,

    /// Upstream connection timeout (milliseconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upstream response-header timeout (milliseconds)
    #[serde(default = "default_response_header_timeout")]
    pub response_header_timeout_ms: u64,

    /// Idle age after which a pooled upstream connection is discarded (milliseconds)
    #[serde(default = "default_keepalive_timeout")]
    pub keepalive_timeout_ms: u64,

    /// Max idle pooled connections per upstream authority
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_conns_per_host: usize,

    /// Max idle pooled connections in total (per worker thread)
    #[serde(default = "default_max_idle")]
    pub max_idle_conns: usize,

    /// Request/response body buffer threshold (bytes); bodies above this
    /// stream and are not retryable
    #[serde(default = "default_body_buffer_size")]
    pub body_buffer_size: usize,

    /// Default total per-request timeout when the route sets none (milliseconds)
    #[serde(default = "default_request_timeout")]
    pub default_timeout_ms: u64,

    /// Default retry attempts when the route sets none
    #[serde(default = "default_retries")]
    pub default_retries: u32,

    /// Response status codes that trigger a retry
    #[serde(default = "default_retry_statuses")]
    pub retry_status_codes: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Routing state file (routes, upstreams, consumers, global filters)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Poll interval for state-file changes (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub access_log: AccessLogConfig,

    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Entries buffered before a flush
    #[serde(default = "default_log_batch_size")]
    pub batch_size: usize,

    /// Flush interval in seconds
    #[serde(default = "default_log_flush_interval")]
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics path
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl GatewayConfig {
    /// Load configuration from a YAML file + environment variables.
    ///
    /// Environment overrides use the form `PORTICO_PROXY__HTTP_ADDR`.
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let figment = Figment::new()
            .merge(Yaml::file(config_path))
            .merge(Env::prefixed("PORTICO_").split("__"));
        let config: Self = figment.extract()?;
        Ok(config)
    }

    /// Worker thread count, resolving 0 to the number of cores.
    pub fn effective_workers(&self) -> usize {
        if self.proxy.workers > 0 {
            self.proxy.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

// Default implementations

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            proxy: ProxyConfig::default(),
            source: SourceConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            workers: 0,
            connect_timeout_ms: default_connect_timeout(),
            response_header_timeout_ms: default_response_header_timeout(),
            keepalive_timeout_ms: default_keepalive_timeout(),
            max_idle_conns_per_host: default_max_idle_per_host(),
            max_idle_conns: default_max_idle(),
            body_buffer_size: default_body_buffer_size(),
            default_timeout_ms: default_request_timeout(),
            default_retries: default_retries(),
            retry_status_codes: default_retry_statuses(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            access_log: AccessLogConfig::default(),
            prometheus: PrometheusConfig::default(),
        }
    }
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_log_batch_size(),
            flush_interval_secs: default_log_flush_interval(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

// Serde default functions

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_http_addr() -> SocketAddr {
    "0.0.0.0:9080".parse().unwrap()
}

fn default_connect_timeout() -> u64 {
    6000
}

fn default_response_header_timeout() -> u64 {
    15000
}

fn default_keepalive_timeout() -> u64 {
    60_000
}

fn default_max_idle_per_host() -> usize {
    32
}

fn default_max_idle() -> usize {
    256
}

fn default_body_buffer_size() -> usize {
    64 * 1024 // 64KB
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_retries() -> u32 {
    1
}

fn default_retry_statuses() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_state_file() -> PathBuf {
    PathBuf::from("portico-state.yaml")
}

fn default_poll_interval() -> u64 {
    3
}

fn default_log_batch_size() -> usize {
    1000
}

fn default_log_flush_interval() -> u64 {
    5
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.proxy.http_addr.port(), 9080);
        assert_eq!(cfg.proxy.default_retries, 1);
        assert_eq!(cfg.proxy.retry_status_codes, vec![502, 503, 504]);
        assert!(cfg.observability.access_log.enabled);
        assert!(cfg.effective_workers() >= 1);
    }

    #[test]
    fn test_workers_override() {
        let mut cfg = GatewayConfig::default();
        cfg.proxy.workers = 4;
        assert_eq!(cfg.effective_workers(), 4);
    }
}
