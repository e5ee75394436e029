//! Observability for the Portico data plane: tracing initialization, the
//! batched structured access log, and the Prometheus metrics collector.

pub mod access_log;
pub mod logger;
pub mod metrics;
