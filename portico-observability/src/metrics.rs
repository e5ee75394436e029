use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Metrics collector for the gateway.
///
/// Counters and histograms are recorded on the request path; gauges are
/// driven by health and breaker callbacks. Text exposition is pull-style;
/// serving it over HTTP is left to an external exporter.
pub struct MetricsCollector {
    registry: Registry,

    /// Total HTTP requests by route, method, status
    pub http_requests_total: IntCounterVec,

    /// Request latency histogram by route
    pub http_request_duration: HistogramVec,

    /// Upstream attempt latency by target
    pub upstream_latency: HistogramVec,

    /// Retried attempts by route
    pub retries_total: IntCounterVec,

    /// Circuit-breaker transitions by breaker and new state
    pub breaker_transitions: IntCounterVec,

    /// Target health flag (1 healthy / 0 unhealthy) by upstream and target
    pub target_healthy: IntGaugeVec,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("portico_http_requests_total", "Total HTTP requests"),
            &["route", "method", "status"],
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new("portico_http_request_duration_seconds", "Request latency")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
            &["route"],
        )?;

        let upstream_latency = HistogramVec::new(
            HistogramOpts::new("portico_upstream_latency_seconds", "Upstream attempt latency")
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ]),
            &["target"],
        )?;

        let retries_total = IntCounterVec::new(
            Opts::new("portico_retries_total", "Retried upstream attempts"),
            &["route"],
        )?;

        let breaker_transitions = IntCounterVec::new(
            Opts::new(
                "portico_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["breaker", "to"],
        )?;

        let target_healthy = IntGaugeVec::new(
            Opts::new("portico_target_healthy", "Target health flag"),
            &["upstream", "target"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(target_healthy.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration,
            upstream_latency,
            retries_total,
            breaker_transitions,
            target_healthy,
        })
    }

    /// Record a completed request.
    pub fn record_request(&self, route: &str, method: &str, status: u16, duration_secs: f64) {
        self.http_requests_total
            .with_label_values(&[route, method, &status.to_string()])
            .inc();
        self.http_request_duration
            .with_label_values(&[route])
            .observe(duration_secs);
    }

    /// Prometheus text exposition.
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let metrics = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metrics, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new().expect("metrics collector")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_gather() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_request("r1", "GET", 200, 0.012);
        collector.record_request("r1", "GET", 502, 0.2);
        collector
            .target_healthy
            .with_label_values(&["us1", "a:80"])
            .set(1);
        let text = collector.gather_text();
        assert!(text.contains("portico_http_requests_total"));
        assert!(text.contains("portico_target_healthy"));
        assert!(text.contains("status=\"502\""));
    }

    #[test]
    fn test_breaker_transition_counter() {
        let collector = MetricsCollector::new().unwrap();
        collector
            .breaker_transitions
            .with_label_values(&["us1/a:80", "open"])
            .inc();
        assert!(collector.gather_text().contains("portico_breaker_transitions_total"));
    }
}
