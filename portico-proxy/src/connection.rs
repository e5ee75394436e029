use crate::forward::{self, ClientBody, ForwardedBody, StreamedBody};
use crate::pool::ConnPool;
use crate::proxy::{
    ProxyEngine, RESP_400, RESP_404, RESP_411, RESP_431, RESP_500, RESP_502, RESP_503_CIRCUIT,
    RESP_503_NO_TARGET, RESP_504, build_response, build_response_head,
};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use portico_core::GatewayError;
use portico_core::router::percent_decode_path;
use portico_observability::access_log;
use portico_plugin::plugin::{FilterResult, RequestContext};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Parsed client request head plus connection bookkeeping.
struct RequestHead {
    method: String,
    uri: String,
    headers: HashMap<String, String>,
    keep_alive: bool,
    content_length: usize,
    /// Bytes read past the head (start of the body / next request)
    leftover: Vec<u8>,
}

enum ReadOutcome {
    Request(RequestHead),
    Closed,
    BadRequest,
    TooLarge,
    NotSupported,
}

/// Handle one client connection: HTTP/1.1 with keep-alive.
///
/// The engine is shared and immutable; the connection pool is this worker
/// thread's own. A fresh snapshot is acquired per request and held for its
/// lifetime.
pub async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    engine: Arc<ProxyEngine>,
    pool: Rc<RefCell<ConnPool>>,
) -> anyhow::Result<()> {
    let peer_ip = peer_addr.ip().to_string();
    let mut carry: Vec<u8> = Vec::new();
    let mut resp_buf: Vec<u8> = Vec::with_capacity(4096);

    loop {
        let head = match read_request_head(&mut client, std::mem::take(&mut carry)).await {
            ReadOutcome::Request(head) => head,
            ReadOutcome::Closed => return Ok(()),
            ReadOutcome::BadRequest => {
                let (res, _) = client.write_all(RESP_400.clone()).await;
                res?;
                return Ok(());
            }
            ReadOutcome::TooLarge => {
                let (res, _) = client.write_all(RESP_431.clone()).await;
                res?;
                return Ok(());
            }
            ReadOutcome::NotSupported => {
                let (res, _) = client.write_all(RESP_411.clone()).await;
                res?;
                return Ok(());
            }
        };

        let keep_alive = head.keep_alive;
        let client_ip = client_address(&head.headers, &peer_ip);

        // Buffer small bodies up front (retry-safe); larger ones stream.
        let buffer_limit = engine.config.proxy.body_buffer_size;
        let mut body_prefix = head.leftover;
        let mut buffered_body: Option<Vec<u8>> = None;
        let mut stream_remaining = 0usize;
        if head.content_length > 0 && head.content_length <= buffer_limit {
            let mut body = body_prefix;
            while body.len() < head.content_length {
                let chunk = vec![0u8; (head.content_length - body.len()).min(64 * 1024)];
                let (res, chunk) = client.read(chunk).await;
                match res {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(n) => body.extend_from_slice(&chunk[..n]),
                }
            }
            carry = body.split_off(head.content_length);
            buffered_body = Some(body);
            body_prefix = Vec::new();
        } else if head.content_length > 0 {
            body_prefix.truncate(head.content_length);
            stream_remaining = head.content_length - body_prefix.len();
        } else {
            carry = body_prefix;
            body_prefix = Vec::new();
        }
        let body_is_streaming = head.content_length > buffer_limit;

        // ── Routing ──
        let snapshot = engine.snapshots.current();
        let (raw_path, query) = match head.uri.find('?') {
            Some(pos) => (&head.uri[..pos], &head.uri[pos..]),
            None => (head.uri.as_str(), ""),
        };
        let decoded_path = percent_decode_path(raw_path).into_owned();
        let host = head.headers.get("host").map(|h| h.as_str());
        let matched = {
            let header_refs: Vec<(&str, &str)> = head
                .headers
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            engine
                .router
                .match_route(&head.method, &decoded_path, host, &header_refs)
        };

        let Some(route) = matched else {
            let (res, _) = client.write_all(RESP_404.clone()).await;
            res?;
            engine
                .metrics
                .record_request("-", &head.method, 404, 0.0);
            if !keep_alive || body_is_streaming {
                return Ok(());
            }
            continue;
        };

        // ── Request context + filter chain ──
        let uri = format!("{decoded_path}{query}");
        let mut ctx = RequestContext::new(
            head.method.clone(),
            &uri,
            head.headers,
            client_ip,
            route.id.clone(),
            route.upstream_id.clone(),
            snapshot,
        );
        ctx.request_body = buffered_body;
        let chain = engine.chains.get(&route.id);

        let mut close_after = !keep_alive;
        let result = chain.run_request_phases(&mut ctx).await;
        let outcome = match result {
            FilterResult::Respond {
                status,
                headers,
                body,
            } => {
                ctx.response_status = Some(status);
                build_response(
                    &mut resp_buf,
                    status,
                    &headers,
                    body.as_deref().unwrap_or(b""),
                    keep_alive,
                );
                if body_is_streaming {
                    close_after = true; // unread request body on the wire
                }
                let (res, _) = client.write_all(resp_buf.clone()).await;
                if res.is_err() {
                    return Ok(());
                }
                status
            }
            FilterResult::Error(_) => {
                ctx.response_status = Some(500);
                let (res, _) = client.write_all(RESP_500.clone()).await;
                if res.is_err() {
                    return Ok(());
                }
                close_after |= body_is_streaming;
                500
            }
            FilterResult::Continue => {
                let body = if body_is_streaming {
                    close_after = true; // the stream is consumed by this request
                    ClientBody::Streaming {
                        client: &mut client,
                        prefix: body_prefix,
                        remaining: stream_remaining,
                        total: head.content_length,
                    }
                } else if ctx.request_body.is_some() {
                    ClientBody::Buffered
                } else {
                    ClientBody::None
                };
                let buffer_response = chain.needs_response_body();
                match forward::forward(&engine, &pool, &mut ctx, &route, body, buffer_response)
                    .await
                {
                    Ok(resp) => {
                        let attempts = resp.attempts;
                        let status = resp.status;
                        ctx.response_status = Some(status);
                        ctx.response_headers = resp.headers;
                        let streamed = match resp.body {
                            ForwardedBody::Buffered(bytes) => {
                                ctx.response_body = Some(bytes);
                                None
                            }
                            ForwardedBody::Streamed(s) => Some(s),
                        };

                        match chain.run_response_phases(&mut ctx).await {
                            FilterResult::Continue => {
                                let written = write_upstream_response(
                                    &mut client,
                                    &mut resp_buf,
                                    &mut ctx,
                                    streamed,
                                    &pool,
                                    keep_alive,
                                )
                                .await;
                                match written {
                                    Ok(client_reusable) => {
                                        close_after |= !client_reusable;
                                    }
                                    Err(_) => return Ok(()), // client went away
                                }
                            }
                            FilterResult::Respond {
                                status,
                                headers,
                                body,
                            } => {
                                // A response-phase filter replaced the
                                // upstream response; its connection (if
                                // streamed) is dropped.
                                ctx.response_status = Some(status);
                                build_response(
                                    &mut resp_buf,
                                    status,
                                    &headers,
                                    body.as_deref().unwrap_or(b""),
                                    keep_alive,
                                );
                                let (res, _) = client.write_all(resp_buf.clone()).await;
                                if res.is_err() {
                                    return Ok(());
                                }
                            }
                            FilterResult::Error(_) => {
                                ctx.response_status = Some(500);
                                let (res, _) = client.write_all(RESP_500.clone()).await;
                                if res.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        if attempts > 1 {
                            debug!(route = %route.id, attempts, "Request succeeded after retries");
                        }
                        ctx.response_status.unwrap_or(status)
                    }
                    Err(GatewayError::ClientDisconnect) => {
                        debug!(route = %route.id, "Client disconnected mid-request");
                        return Ok(());
                    }
                    Err(e) => {
                        let status = e.status_code();
                        ctx.response_status = Some(status);
                        let static_resp = match &e {
                            GatewayError::NoHealthyTarget(_) => RESP_503_NO_TARGET.clone(),
                            GatewayError::CircuitOpen(_) => RESP_503_CIRCUIT.clone(),
                            GatewayError::UpstreamReadTimeout(_) => RESP_504.clone(),
                            GatewayError::UpstreamConnect(_)
                            | GatewayError::UpstreamProtocol(_)
                            | GatewayError::UpstreamNotFound(_) => RESP_502.clone(),
                            _ => RESP_500.clone(),
                        };
                        let (res, _) = client.write_all(static_resp).await;
                        if res.is_err() {
                            return Ok(());
                        }
                        status
                    }
                }
            }
        };

        // ── Log phase, access log, metrics ──
        chain.run_log_phase(&mut ctx).await;
        let latency_ms = ctx.elapsed_ms();
        engine.access_log.log(access_log::entry(
            &ctx.route_id,
            &ctx.client_ip,
            &ctx.method,
            &ctx.path,
            outcome,
            latency_ms,
            ctx.selected_target.as_deref(),
            ctx.consumer.as_ref().map(|c| c.id.as_str()),
            0,
        ));
        engine
            .metrics
            .record_request(&ctx.route_id, &ctx.method, outcome, latency_ms / 1000.0);

        if close_after {
            return Ok(());
        }
    }
}

/// Write a forwarded upstream response to the client. Returns whether the
/// client connection can be reused; errors mean the client went away.
async fn write_upstream_response(
    client: &mut TcpStream,
    resp_buf: &mut Vec<u8>,
    ctx: &mut RequestContext,
    streamed: Option<StreamedBody>,
    pool: &Rc<RefCell<ConnPool>>,
    keep_alive: bool,
) -> Result<bool, ()> {
    let status = ctx.response_status.unwrap_or(502);

    match streamed {
        None => {
            let body = ctx.response_body.take().unwrap_or_default();
            build_response(resp_buf, status, &ctx.response_headers, &body, keep_alive);
            let (res, _) = client.write_all(resp_buf.clone()).await;
            res.map_err(|_| ())?;
            Ok(keep_alive)
        }
        Some(mut streamed) => {
            // A length-delimited stream keeps the client connection
            // reusable; EOF-delimited bodies require a close to frame.
            let client_reusable = keep_alive && streamed.remaining.is_some();
            build_response_head(resp_buf, status, &ctx.response_headers, client_reusable);
            let (res, _) = client.write_all(resp_buf.clone()).await;
            res.map_err(|_| ())?;

            if !streamed.prefix.is_empty() {
                // `remaining` already excludes the prefix bytes
                let prefix = std::mem::take(&mut streamed.prefix);
                let (res, _) = client.write_all(prefix).await;
                res.map_err(|_| ())?;
            }

            let mut remaining = streamed.remaining;
            let mut drained = remaining == Some(0);
            while remaining.map(|r| r > 0).unwrap_or(true) {
                let chunk = vec![0u8; remaining.unwrap_or(64 * 1024).min(64 * 1024)];
                let (res, chunk) = streamed.conn.read(chunk).await;
                let n = match res {
                    Ok(0) => {
                        drained = remaining.is_none();
                        break;
                    }
                    Ok(n) => n,
                    Err(_) => break,
                };
                if let Some(ref mut r) = remaining {
                    *r -= n;
                    if *r == 0 {
                        drained = true;
                    }
                }
                let (res, _) = client.write_all(chunk[..n].to_vec()).await;
                if res.is_err() {
                    // Client gone mid-stream: the upstream connection is
                    // not cleanly drained, drop it.
                    debug!(target = %streamed.addr, "Client disconnected during body stream");
                    return Err(());
                }
            }

            if streamed.reusable && drained {
                pool.borrow_mut().put(streamed.addr.clone(), streamed.conn);
            }
            Ok(client_reusable)
        }
    }
}

/// Read and parse one request head. `carry` holds bytes left over from the
/// previous request on this connection.
async fn read_request_head(client: &mut TcpStream, carry: Vec<u8>) -> ReadOutcome {
    let mut buf = carry;

    loop {
        if !buf.is_empty() {
            let mut headers_raw = [httparse::EMPTY_HEADER; 64];
            let mut req = httparse::Request::new(&mut headers_raw);
            match req.parse(&buf) {
                Ok(httparse::Status::Complete(header_len)) => {
                    let method = req.method.unwrap_or("GET").to_string();
                    let uri = req.path.unwrap_or("/").to_string();

                    let mut headers: HashMap<String, String> = HashMap::with_capacity(16);
                    let mut keep_alive = true;
                    let mut content_length = 0usize;
                    let mut chunked = false;
                    for h in req.headers.iter() {
                        if h.name.is_empty() {
                            break;
                        }
                        let name = h.name.to_ascii_lowercase();
                        let value = String::from_utf8_lossy(h.value).into_owned();
                        match name.as_str() {
                            "connection" => keep_alive = !value.eq_ignore_ascii_case("close"),
                            "content-length" => {
                                content_length = value.trim().parse().unwrap_or(0)
                            }
                            "transfer-encoding" => {
                                chunked = value.to_ascii_lowercase().contains("chunked")
                            }
                            _ => {}
                        }
                        // Repeated headers fold into a comma list
                        headers
                            .entry(name)
                            .and_modify(|existing| {
                                existing.push_str(", ");
                                existing.push_str(&value);
                            })
                            .or_insert(value);
                    }

                    if chunked {
                        return ReadOutcome::NotSupported;
                    }
                    return ReadOutcome::Request(RequestHead {
                        method,
                        uri,
                        headers,
                        keep_alive,
                        content_length,
                        leftover: buf.split_off(header_len),
                    });
                }
                Ok(httparse::Status::Partial) => {
                    if buf.len() > MAX_HEAD_BYTES {
                        return ReadOutcome::TooLarge;
                    }
                }
                Err(_) => return ReadOutcome::BadRequest,
            }
        }

        let chunk = vec![0u8; 8 * 1024];
        let (res, chunk) = client.read(chunk).await;
        match res {
            Ok(0) => {
                return if buf.is_empty() {
                    ReadOutcome::Closed
                } else {
                    ReadOutcome::BadRequest
                };
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => return ReadOutcome::Closed,
        }
    }
}

/// Client address enrichment: X-Real-IP, then the first X-Forwarded-For
/// entry, then the peer address.
fn client_address(headers: &HashMap<String, String>, peer_ip: &str) -> String {
    if let Some(real_ip) = headers.get("x-real-ip") {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    if let Some(xff) = headers.get("x-forwarded-for")
        && let Some(first) = xff.split(',').next()
    {
        let trimmed = first.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    peer_ip.to_string()
}
