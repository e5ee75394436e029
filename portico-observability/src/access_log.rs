use chrono::Utc;
use portico_core::config::AccessLogConfig;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{Duration, interval};
use tracing::warn;

/// Structured access log record, one JSON line per completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub timestamp: String,
    pub route_id: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: f64,
    pub upstream_addr: Option<String>,
    pub consumer: Option<String>,
    pub retries: u32,
}

/// Batched access-log writer, a true no-op when disabled.
///
/// Workers submit entries with a non-blocking `try_send`; a background tokio
/// task batches and flushes them to stdout. Overflow drops entries rather
/// than stalling the data plane.
pub struct AccessLogger {
    sender: Option<mpsc::Sender<AccessLogEntry>>,
}

impl AccessLogger {
    /// Spawn the flush loop; must be called from the tokio runtime.
    pub fn start(config: AccessLogConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let (tx, rx) = mpsc::channel(10_000);
        tokio::spawn(flush_loop(config, rx));
        Self { sender: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { sender: None }
    }

    #[inline]
    pub fn log(&self, entry: AccessLogEntry) {
        if let Some(ref sender) = self.sender
            && sender.try_send(entry).is_err()
        {
            warn!("Access log queue full; entry dropped");
        }
    }
}

async fn flush_loop(config: AccessLogConfig, mut rx: mpsc::Receiver<AccessLogEntry>) {
    let mut batch: Vec<AccessLogEntry> = Vec::with_capacity(config.batch_size);
    let mut tick = interval(Duration::from_secs(config.flush_interval_secs.max(1)));

    loop {
        tokio::select! {
            entry = rx.recv() => {
                match entry {
                    Some(entry) => {
                        batch.push(entry);
                        if batch.len() >= config.batch_size {
                            flush(&mut batch).await;
                        }
                    }
                    None => {
                        flush(&mut batch).await;
                        return;
                    }
                }
            }
            _ = tick.tick() => {
                flush(&mut batch).await;
            }
        }
    }
}

async fn flush(batch: &mut Vec<AccessLogEntry>) {
    if batch.is_empty() {
        return;
    }
    let mut out = String::new();
    for entry in batch.drain(..) {
        if let Ok(line) = serde_json::to_string(&entry) {
            out.push_str(&line);
            out.push('\n');
        }
    }
    let mut stdout = tokio::io::stdout();
    if stdout.write_all(out.as_bytes()).await.is_ok() {
        let _ = stdout.flush().await;
    }
}

/// Build an entry with the current timestamp.
#[allow(clippy::too_many_arguments)]
pub fn entry(
    route_id: &str,
    client_ip: &str,
    method: &str,
    path: &str,
    status: u16,
    latency_ms: f64,
    upstream_addr: Option<&str>,
    consumer: Option<&str>,
    retries: u32,
) -> AccessLogEntry {
    AccessLogEntry {
        timestamp: Utc::now().to_rfc3339(),
        route_id: route_id.to_string(),
        client_ip: client_ip.to_string(),
        method: method.to_string(),
        path: path.to_string(),
        status,
        latency_ms,
        upstream_addr: upstream_addr.map(str::to_string),
        consumer: consumer.map(str::to_string),
        retries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serializes_to_json_line() {
        let e = entry(
            "r1",
            "1.2.3.4",
            "GET",
            "/api/users",
            200,
            12.5,
            Some("10.0.0.1:8080"),
            Some("alice"),
            0,
        );
        let line = serde_json::to_string(&e).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["route_id"], "r1");
        assert_eq!(parsed["status"], 200);
        assert_eq!(parsed["upstream_addr"], "10.0.0.1:8080");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_disabled_logger_drops_silently() {
        let logger = AccessLogger::disabled();
        logger.log(entry("r", "ip", "GET", "/", 200, 1.0, None, None, 0));
    }
}
