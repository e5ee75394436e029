use crate::pool::ConnPool;
use crate::proxy::{ProxyEngine, build_upstream_request};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use portico_balance::outcome::UpstreamOutcome;
use portico_core::GatewayError;
use portico_core::route::Route;
use portico_plugin::plugin::RequestContext;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Response body as produced by one successful attempt.
pub enum ForwardedBody {
    Buffered(Vec<u8>),
    Streamed(StreamedBody),
}

/// A response being streamed: headers parsed, body (partially) unread.
/// The connection is handed back to the caller, which drains it to the
/// client and pools it when cleanly drained.
pub struct StreamedBody {
    pub conn: TcpStream,
    pub addr: String,
    /// Body bytes that arrived with the response head
    pub prefix: Vec<u8>,
    /// Bytes left on the wire (`None` = read until EOF)
    pub remaining: Option<usize>,
    /// Pool the connection after a clean drain
    pub reusable: bool,
}

pub struct ForwardedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ForwardedBody,
    pub attempts: u32,
    pub target: String,
}

/// Where the request body comes from.
pub enum ClientBody<'a> {
    None,
    /// Fully buffered in `ctx.request_body` (retry-safe)
    Buffered,
    /// Streamed from the client connection; not retryable
    Streaming {
        client: &'a mut TcpStream,
        /// Body bytes already read alongside the request head
        prefix: Vec<u8>,
        /// Bytes still unread on the client connection
        remaining: usize,
        /// Full Content-Length declared by the client
        total: usize,
    },
}

impl ClientBody<'_> {
    fn retryable(&self) -> bool {
        !matches!(self, ClientBody::Streaming { .. })
    }
}

/// Idempotent methods eligible for retry.
pub fn is_idempotent(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptError {
    Connect,
    Timeout,
    Reset,
    Protocol,
    ClientAbort,
}

/// Forward a request to the route's upstream with retries.
///
/// Each attempt selects a (potentially different) target through the load
/// balancer, honoring circuit-breaker admission. The outcome of every
/// attempt is recorded with the passive health checker and the breaker
/// before the attempt resolves. Total time across attempts is bounded by
/// the route deadline.
pub async fn forward(
    engine: &ProxyEngine,
    pool: &Rc<RefCell<ConnPool>>,
    ctx: &mut RequestContext,
    route: &Route,
    mut body: ClientBody<'_>,
    buffer_response: bool,
) -> Result<ForwardedResponse, GatewayError> {
    let proxy_cfg = &engine.config.proxy;
    let upstream = ctx
        .snapshot
        .upstream(&ctx.upstream_id)
        .cloned()
        .ok_or_else(|| GatewayError::UpstreamNotFound(ctx.upstream_id.clone()))?;

    let deadline = ctx.request_start
        + Duration::from_millis(route.timeout_ms.unwrap_or(proxy_cfg.default_timeout_ms));
    let connect_timeout = Duration::from_millis(
        upstream
            .connect_timeout_ms
            .unwrap_or(proxy_cfg.connect_timeout_ms),
    );
    let header_timeout = route.retry_timeout_ms.or(upstream.read_timeout_ms).unwrap_or(
        proxy_cfg.response_header_timeout_ms,
    );

    let retryable_body = body.retryable();
    let idempotent = is_idempotent(&ctx.method);
    let max_attempts = if retryable_body {
        route.retries.unwrap_or(upstream.retries) + 1
    } else {
        1
    };

    let mut attempts: u32 = 0;
    let mut gate_denials = 0usize;
    let mut exclude: Vec<String> = Vec::new();
    let mut last_err = GatewayError::NoHealthyTarget(ctx.upstream_id.clone());

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(if attempts == 0 {
                GatewayError::UpstreamReadTimeout(ctx.upstream_id.clone())
            } else {
                last_err
            });
        }

        let selection = match engine
            .balancer
            .select(&ctx.upstream_id, &ctx.client_ip, &exclude)
        {
            Ok(s) => s,
            Err(e) => {
                return Err(if attempts == 0 { e } else { last_err });
            }
        };
        let addr = selection.addr.clone();

        // Single admission gate; may move Open → HalfOpen.
        let breaker = engine.breakers.breaker(&ctx.upstream_id, &addr);
        if !breaker.can_execute() {
            drop(selection);
            exclude.push(addr);
            gate_denials += 1;
            if gate_denials >= upstream.targets.len() {
                return Err(if attempts == 0 {
                    GatewayError::CircuitOpen(ctx.upstream_id.clone())
                } else {
                    last_err
                });
            }
            continue;
        }

        attempts += 1;
        let attempt_timeout = deadline
            .saturating_duration_since(now)
            .min(Duration::from_millis(header_timeout));
        let started = Instant::now();
        let result = attempt_once(
            engine,
            pool,
            ctx,
            &addr,
            &mut body,
            buffer_response,
            connect_timeout,
            attempt_timeout,
        )
        .await;

        // Outcome recording happens before the response is surfaced, on
        // every path, including the client-abort path below.
        let outcome = match &result {
            Ok(resp) => Some(UpstreamOutcome::Status(resp.status)),
            Err(AttemptError::Connect) => Some(UpstreamOutcome::ConnectError),
            Err(AttemptError::Timeout) => Some(UpstreamOutcome::Timeout),
            Err(AttemptError::Reset) => Some(UpstreamOutcome::Reset),
            Err(AttemptError::Protocol) => Some(UpstreamOutcome::Protocol),
            // The upstream did nothing wrong when the client walked away.
            Err(AttemptError::ClientAbort) => None,
        };
        if let Some(ref outcome) = outcome {
            breaker.record(outcome);
            engine.passive.record(&ctx.upstream_id, &addr, outcome);
            engine
                .metrics
                .upstream_latency
                .with_label_values(&[&addr])
                .observe(started.elapsed().as_secs_f64());
        }
        drop(selection);

        match result {
            Ok(head) => {
                let status = head.status;
                let may_retry = attempts < max_attempts
                    && idempotent
                    && retryable_body
                    && proxy_cfg.retry_status_codes.contains(&status)
                    && Instant::now() < deadline;
                if may_retry {
                    debug!(target = %addr, status, attempt = attempts, "Retrying on upstream status");
                    engine
                        .metrics
                        .retries_total
                        .with_label_values(&[&route.id])
                        .inc();
                    // Dropping the head closes the connection with its
                    // unread body.
                    exclude.push(addr);
                    last_err = GatewayError::UpstreamProtocol(format!("status {status}"));
                    continue;
                }
                ctx.selected_target = Some(addr.clone());
                return Ok(ForwardedResponse {
                    status: head.status,
                    headers: head.headers,
                    body: head.body,
                    attempts,
                    target: addr,
                });
            }
            Err(AttemptError::ClientAbort) => return Err(GatewayError::ClientDisconnect),
            Err(kind) => {
                warn!(target = %addr, ?kind, attempt = attempts, "Upstream attempt failed");
                last_err = match kind {
                    AttemptError::Connect => GatewayError::UpstreamConnect(addr.clone()),
                    AttemptError::Timeout => GatewayError::UpstreamReadTimeout(addr.clone()),
                    _ => GatewayError::UpstreamProtocol(addr.clone()),
                };
                let retryable_kind =
                    matches!(kind, AttemptError::Connect | AttemptError::Timeout | AttemptError::Reset);
                if retryable_kind
                    && idempotent
                    && retryable_body
                    && attempts < max_attempts
                    && Instant::now() < deadline
                {
                    engine
                        .metrics
                        .retries_total
                        .with_label_values(&[&route.id])
                        .inc();
                    exclude.push(addr);
                    continue;
                }
                return Err(last_err);
            }
        }
    }
}

struct AttemptOutput {
    status: u16,
    headers: Vec<(String, String)>,
    body: ForwardedBody,
}

#[allow(clippy::too_many_arguments)]
async fn attempt_once(
    engine: &ProxyEngine,
    pool: &Rc<RefCell<ConnPool>>,
    ctx: &mut RequestContext,
    addr: &str,
    body: &mut ClientBody<'_>,
    buffer_response: bool,
    connect_timeout: Duration,
    attempt_timeout: Duration,
) -> Result<AttemptOutput, AttemptError> {
    let path_and_query = if ctx.query.is_empty() {
        ctx.path.clone()
    } else {
        format!("{}?{}", ctx.path, ctx.query)
    };

    let mut request_buf = Vec::with_capacity(2048);
    let (buffered_body, stream_total) = match body {
        ClientBody::None => (None, None),
        ClientBody::Buffered => (ctx.request_body.as_deref(), None),
        ClientBody::Streaming { total, .. } => (None, Some(*total)),
    };
    build_upstream_request(
        &mut request_buf,
        &ctx.method,
        &path_and_query,
        &ctx.request_headers,
        buffered_body,
        stream_total,
        addr,
        &ctx.client_ip,
    );

    // Pooled connection first; a stale one gets a single fresh-connection
    // retry when the request is replayable.
    let pooled = pool.borrow_mut().take(addr);
    let replayable = body.retryable();
    let (conn, was_pooled) = match pooled {
        Some(conn) => (conn, true),
        None => (
            connect_target(addr, connect_timeout)
                .await
                .ok_or(AttemptError::Connect)?,
            false,
        ),
    };

    let exchange_result = monoio::time::timeout(
        attempt_timeout,
        exchange(engine, conn, addr, &request_buf, body, buffer_response, pool, &ctx.method),
    )
    .await;

    match exchange_result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(AttemptError::Reset | AttemptError::Connect)) if was_pooled && replayable => {
            debug!(addr = %addr, "Pooled connection was stale, reconnecting");
            let fresh = connect_target(addr, connect_timeout)
                .await
                .ok_or(AttemptError::Connect)?;
            monoio::time::timeout(
                attempt_timeout,
                exchange(engine, fresh, addr, &request_buf, body, buffer_response, pool, &ctx.method),
            )
            .await
            .map_err(|_| AttemptError::Timeout)?
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(AttemptError::Timeout),
    }
}

/// One request/response exchange on an established connection.
#[allow(clippy::too_many_arguments)]
async fn exchange(
    engine: &ProxyEngine,
    mut conn: TcpStream,
    addr: &str,
    request: &[u8],
    body: &mut ClientBody<'_>,
    buffer_response: bool,
    pool: &Rc<RefCell<ConnPool>>,
    method: &str,
) -> Result<AttemptOutput, AttemptError> {
    let (res, _) = conn.write_all(request.to_vec()).await;
    if res.is_err() {
        return Err(AttemptError::Reset);
    }

    // Stream the remaining request body, if any
    if let ClientBody::Streaming {
        client,
        prefix,
        remaining,
        ..
    } = body
    {
        if !prefix.is_empty() {
            let (res, _) = conn.write_all(std::mem::take(prefix)).await;
            if res.is_err() {
                return Err(AttemptError::Reset);
            }
        }
        while *remaining > 0 {
            let chunk = vec![0u8; (*remaining).min(64 * 1024)];
            let (res, chunk) = client.read(chunk).await;
            let n = match res {
                Ok(0) | Err(_) => return Err(AttemptError::ClientAbort),
                Ok(n) => n,
            };
            *remaining -= n;
            let (res, _) = conn.write_all(chunk[..n].to_vec()).await;
            if res.is_err() {
                return Err(AttemptError::Reset);
            }
        }
    }

    // Read and parse the response head
    let mut buf: Vec<u8> = Vec::with_capacity(8 * 1024);
    let head = loop {
        let chunk = vec![0u8; 16 * 1024];
        let (res, chunk) = conn.read(chunk).await;
        let n = match res {
            Ok(0) if buf.is_empty() => return Err(AttemptError::Reset),
            Ok(0) => return Err(AttemptError::Protocol),
            Ok(n) => n,
            Err(_) => return Err(AttemptError::Reset),
        };
        buf.extend_from_slice(&chunk[..n]);

        match parse_response_head(&buf)? {
            Some(head) => break head,
            None => {
                if buf.len() > 64 * 1024 {
                    return Err(AttemptError::Protocol);
                }
            }
        }
    };

    let prefix = buf[head.header_len..].to_vec();
    let no_body = method == "HEAD"
        || head.status < 200
        || head.status == 204
        || head.status == 304;

    let body = if no_body {
        if head.keep_alive {
            pool.borrow_mut().put(addr.to_string(), conn);
        }
        ForwardedBody::Buffered(Vec::new())
    } else if head.chunked {
        // Chunked bodies pass through raw and the connection is not reused.
        ForwardedBody::Streamed(StreamedBody {
            conn,
            addr: addr.to_string(),
            prefix,
            remaining: None,
            reusable: false,
        })
    } else if let Some(len) = head.content_length {
        let buffer_limit = engine.config.proxy.body_buffer_size;
        if buffer_response || len <= buffer_limit {
            let full =
                read_exact_body(&mut conn, prefix, len).await?;
            if head.keep_alive {
                pool.borrow_mut().put(addr.to_string(), conn);
            }
            ForwardedBody::Buffered(full)
        } else {
            let remaining = len.saturating_sub(prefix.len());
            ForwardedBody::Streamed(StreamedBody {
                conn,
                addr: addr.to_string(),
                prefix,
                remaining: Some(remaining),
                reusable: head.keep_alive,
            })
        }
    } else if buffer_response {
        // No length, connection delimits the body
        let full = read_to_eof(&mut conn, prefix).await;
        ForwardedBody::Buffered(full)
    } else {
        ForwardedBody::Streamed(StreamedBody {
            conn,
            addr: addr.to_string(),
            prefix,
            remaining: None,
            reusable: false,
        })
    };

    Ok(AttemptOutput {
        status: head.status,
        headers: head.headers,
        body,
    })
}

struct ParsedHead {
    status: u16,
    headers: Vec<(String, String)>,
    header_len: usize,
    content_length: Option<usize>,
    chunked: bool,
    keep_alive: bool,
}

/// Parse a response head out of `buf`. `Ok(None)` means more bytes are
/// needed.
fn parse_response_head(buf: &[u8]) -> Result<Option<ParsedHead>, AttemptError> {
    let mut headers_raw = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers_raw);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(header_len)) => {
            let status = resp.code.ok_or(AttemptError::Protocol)?;
            let mut headers = Vec::with_capacity(resp.headers.len());
            let mut content_length = None;
            let mut chunked = false;
            let mut keep_alive = true;
            for h in resp.headers.iter() {
                if h.name.is_empty() {
                    break;
                }
                let value = std::str::from_utf8(h.value).unwrap_or("");
                if h.name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok();
                } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
                    chunked = value.to_ascii_lowercase().contains("chunked");
                } else if h.name.eq_ignore_ascii_case("connection") {
                    keep_alive = !value.eq_ignore_ascii_case("close");
                }
                headers.push((h.name.to_string(), value.to_string()));
            }
            Ok(Some(ParsedHead {
                status,
                headers,
                header_len,
                content_length,
                chunked,
                keep_alive,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(_) => Err(AttemptError::Protocol),
    }
}

async fn read_exact_body(
    conn: &mut TcpStream,
    mut body: Vec<u8>,
    len: usize,
) -> Result<Vec<u8>, AttemptError> {
    while body.len() < len {
        let chunk = vec![0u8; (len - body.len()).min(64 * 1024)];
        let (res, chunk) = conn.read(chunk).await;
        match res {
            Ok(0) | Err(_) => return Err(AttemptError::Reset),
            Ok(n) => body.extend_from_slice(&chunk[..n]),
        }
    }
    body.truncate(len);
    Ok(body)
}

async fn read_to_eof(conn: &mut TcpStream, mut body: Vec<u8>) -> Vec<u8> {
    loop {
        let chunk = vec![0u8; 64 * 1024];
        let (res, chunk) = conn.read(chunk).await;
        match res {
            Ok(0) | Err(_) => return body,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Resolve an authority to socket addresses, IPv4 first.
///
/// The blocking lookup only runs on pool miss for non-literal authorities,
/// never on the steady-state hot path.
fn resolve_addrs(addr: &str) -> Vec<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return vec![sa];
    }
    use std::net::ToSocketAddrs;
    let all: Vec<SocketAddr> = match addr.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return vec![],
    };
    let mut v4: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
    v4.extend(all.into_iter().filter(|a| a.is_ipv6()));
    v4
}

async fn connect_target(addr: &str, connect_timeout: Duration) -> Option<TcpStream> {
    let candidates = resolve_addrs(addr);
    if candidates.is_empty() {
        warn!(addr = %addr, "Upstream address resolve failed");
        return None;
    }
    for sa in &candidates {
        match monoio::time::timeout(connect_timeout, TcpStream::connect(*sa)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                return Some(stream);
            }
            Ok(Err(e)) => {
                debug!(addr = %addr, resolved = %sa, error = %e, "Upstream candidate failed");
            }
            Err(_) => {
                debug!(addr = %addr, resolved = %sa, "Upstream connect timed out");
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotent_methods() {
        for m in ["GET", "HEAD", "PUT", "DELETE", "OPTIONS"] {
            assert!(is_idempotent(m), "{m} must be retryable");
        }
        for m in ["POST", "PATCH", "CONNECT"] {
            assert!(!is_idempotent(m), "{m} must not be retryable");
        }
    }

    #[test]
    fn test_resolve_literal_addr_skips_dns() {
        let addrs = resolve_addrs("127.0.0.1:8080");
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv4());
        assert!(resolve_addrs("definitely-not-a-host-xyz:99999").is_empty());
    }

    #[test]
    fn test_parse_response_head_complete() {
        let raw = b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\nx-a: b\r\n\r\nbody";
        let head = parse_response_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.content_length, Some(4));
        assert!(head.keep_alive);
        assert!(!head.chunked);
        assert_eq!(&raw[head.header_len..], b"body");
        assert!(head.headers.iter().any(|(k, v)| k == "x-a" && v == "b"));
    }

    #[test]
    fn test_parse_response_head_partial_and_invalid() {
        assert!(parse_response_head(b"HTTP/1.1 200 OK\r\ncont").unwrap().is_none());
        assert!(parse_response_head(b"not http at all\r\n\r\n").is_err());
    }

    #[test]
    fn test_parse_response_head_connection_close_and_chunked() {
        let raw =
            b"HTTP/1.1 502 Bad Gateway\r\nconnection: close\r\ntransfer-encoding: chunked\r\n\r\n";
        let head = parse_response_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 502);
        assert!(!head.keep_alive);
        assert!(head.chunked);
        assert_eq!(head.content_length, None);
    }

    #[test]
    fn test_client_body_retryability() {
        assert!(ClientBody::None.retryable());
        assert!(ClientBody::Buffered.retryable());
    }
}
