use portico_balance::balancer::LoadBalancer;
use portico_balance::breaker::BreakerRegistry;
use portico_balance::passive_health::PassiveHealthChecker;
use portico_core::config::GatewayConfig;
use portico_core::router::Router;
use portico_observability::access_log::AccessLogger;
use portico_observability::metrics::MetricsCollector;
use portico_plugin::chain::ChainManager;
use portico_store::SnapshotHandle;
use std::sync::Arc;
use std::sync::LazyLock;

/// Shared, immutable handles for the whole data plane.
///
/// Everything here is swap-on-publish (router, chains, snapshot) or
/// internally synchronized per target (balancer, breakers, passive
/// records); workers share one engine and hold nothing mutable besides
/// their thread-local connection pool.
pub struct ProxyEngine {
    pub router: Arc<Router>,
    pub chains: Arc<ChainManager>,
    pub snapshots: Arc<SnapshotHandle>,
    pub balancer: Arc<LoadBalancer>,
    pub breakers: Arc<BreakerRegistry>,
    pub passive: Arc<PassiveHealthChecker>,
    pub config: Arc<GatewayConfig>,
    pub metrics: Arc<MetricsCollector>,
    pub access_log: Arc<AccessLogger>,
}

// ── Pre-built static error responses ──────────────────────────

fn static_response(status: u16, error: &str) -> Vec<u8> {
    let body = format!(r#"{{"error":"{error}","status":{status}}}"#);
    let mut buf = Vec::with_capacity(128 + body.len());
    build_response(
        &mut buf,
        status,
        &[("content-type".to_string(), "application/json".to_string())],
        body.as_bytes(),
        true,
    );
    buf
}

pub static RESP_404: LazyLock<Vec<u8>> =
    LazyLock::new(|| static_response(404, "no route matched"));

pub static RESP_500: LazyLock<Vec<u8>> =
    LazyLock::new(|| static_response(500, "internal error"));

pub static RESP_502: LazyLock<Vec<u8>> =
    LazyLock::new(|| static_response(502, "upstream error"));

pub static RESP_503_NO_TARGET: LazyLock<Vec<u8>> =
    LazyLock::new(|| static_response(503, "no healthy upstream target"));

pub static RESP_503_CIRCUIT: LazyLock<Vec<u8>> =
    LazyLock::new(|| static_response(503, "upstream circuit open"));

pub static RESP_504: LazyLock<Vec<u8>> =
    LazyLock::new(|| static_response(504, "upstream timeout"));

pub static RESP_400: LazyLock<Vec<u8>> = LazyLock::new(|| {
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_vec()
});

pub static RESP_431: LazyLock<Vec<u8>> = LazyLock::new(|| {
    b"HTTP/1.1 431 Request Header Fields Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        .to_vec()
});

pub static RESP_411: LazyLock<Vec<u8>> = LazyLock::new(|| {
    b"HTTP/1.1 411 Length Required\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_vec()
});

// ── Response/request serialization ────────────────────────────

/// Build an HTTP/1.1 response head + body into `buf` (cleared first).
/// Content-Length and Connection are owned by the serializer; any copies in
/// `headers` are skipped.
pub fn build_response(
    buf: &mut Vec<u8>,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
    keep_alive: bool,
) {
    buf.clear();
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(itoa_buf.format(status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status_text(status).as_bytes());
    buf.extend_from_slice(b"\r\ncontent-length: ");
    buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
    buf.extend_from_slice(if keep_alive {
        b"\r\nconnection: keep-alive\r\n" as &[u8]
    } else {
        b"\r\nconnection: close\r\n"
    });
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
}

/// Build a response head only (streamed bodies): headers pass through
/// untouched, including Content-Length / Transfer-Encoding.
pub fn build_response_head(
    buf: &mut Vec<u8>,
    status: u16,
    headers: &[(String, String)],
    keep_alive: bool,
) {
    buf.clear();
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(itoa_buf.format(status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status_text(status).as_bytes());
    buf.extend_from_slice(b"\r\n");
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(if keep_alive {
        b"connection: keep-alive\r\n\r\n" as &[u8]
    } else {
        b"connection: close\r\n\r\n"
    });
}

/// Serialize the upstream request head (+ buffered body when given).
///
/// Hop-by-hop headers are dropped; X-Forwarded-For gains the client address
/// and X-Real-IP is set when absent. The Host header passes through (the
/// client-facing authority), matching pass-through host semantics.
pub fn build_upstream_request(
    buf: &mut Vec<u8>,
    method: &str,
    path_and_query: &str,
    headers: &std::collections::HashMap<String, String>,
    body: Option<&[u8]>,
    content_length: Option<usize>,
    target_addr: &str,
    client_ip: &str,
) {
    buf.clear();
    buf.extend_from_slice(method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(path_and_query.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");

    let mut has_host = false;
    let mut xff: Option<&str> = None;
    let mut has_real_ip = false;

    for (name, value) in headers {
        match name.as_str() {
            "connection" | "keep-alive" | "transfer-encoding" | "upgrade"
            | "proxy-connection" | "content-length" => continue,
            "x-forwarded-for" => {
                xff = Some(value);
                continue;
            }
            "host" => has_host = true,
            "x-real-ip" => has_real_ip = true,
            _ => {}
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !has_host {
        buf.extend_from_slice(b"host: ");
        buf.extend_from_slice(target_addr.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"x-forwarded-for: ");
    if let Some(existing) = xff {
        buf.extend_from_slice(existing.as_bytes());
        buf.extend_from_slice(b", ");
    }
    buf.extend_from_slice(client_ip.as_bytes());
    buf.extend_from_slice(b"\r\n");
    if !has_real_ip {
        buf.extend_from_slice(b"x-real-ip: ");
        buf.extend_from_slice(client_ip.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"connection: keep-alive\r\n");

    let body_len = body.map(|b| b.len()).or(content_length);
    if let Some(len) = body_len {
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(b"content-length: ");
        buf.extend_from_slice(itoa_buf.format(len).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    if let Some(body) = body {
        buf.extend_from_slice(body);
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        418 => "I'm a teapot",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
