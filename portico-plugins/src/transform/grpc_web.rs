use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use portico_plugin::plugin::{Filter, FilterFactory, FilterResult, Phase, RequestContext};
use std::sync::Arc;

/// Flag byte marking a trailer frame.
pub const TRAILER_FLAG: u8 = 0x80;

/// One gRPC-Web message: flag byte + payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data(payload: Vec<u8>) -> Self {
        Self { flag: 0, payload }
    }

    pub fn trailers(payload: Vec<u8>) -> Self {
        Self {
            flag: TRAILER_FLAG,
            payload,
        }
    }

    pub fn is_trailers(&self) -> bool {
        self.flag & TRAILER_FLAG != 0
    }
}

/// Encode one frame: flag byte, 4-byte big-endian length, payload.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + frame.payload.len());
    out.push(frame.flag);
    out.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&frame.payload);
    out
}

/// Decode a sequence of frames. Fails on truncated input.
pub fn decode_frames(mut buf: &[u8]) -> Result<Vec<Frame>, String> {
    let mut frames = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 5 {
            return Err("truncated frame prefix".into());
        }
        let flag = buf[0];
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if buf.len() < 5 + len {
            return Err(format!("truncated frame payload: need {len} bytes"));
        }
        frames.push(Frame {
            flag,
            payload: buf[5..5 + len].to_vec(),
        });
        buf = &buf[5 + len..];
    }
    Ok(frames)
}

/// Serialize frames for `application/grpc-web-text`.
pub fn encode_text(frames: &[Frame]) -> Vec<u8> {
    let mut raw = Vec::new();
    for frame in frames {
        raw.extend_from_slice(&encode_frame(frame));
    }
    BASE64.encode(raw).into_bytes()
}

/// Parse an `application/grpc-web-text` body.
pub fn decode_text(body: &[u8]) -> Result<Vec<Frame>, String> {
    let raw = BASE64
        .decode(body)
        .map_err(|e| format!("invalid base64: {e}"))?;
    decode_frames(&raw)
}

/// Render gRPC trailers (`name: value` lines, CRLF-terminated) as a trailer
/// frame.
pub fn trailer_frame(trailers: &[(String, String)]) -> Frame {
    let mut payload = Vec::new();
    for (name, value) in trailers {
        payload.extend_from_slice(name.as_bytes());
        payload.extend_from_slice(b": ");
        payload.extend_from_slice(value.as_bytes());
        payload.extend_from_slice(b"\r\n");
    }
    Frame::trailers(payload)
}

const CTX_MODE_VAR: &str = "_grpc_web_mode";

/// gRPC-Web to gRPC translation (and back on the response side).
///
/// Request side: strips the `-text` base64 layer and rewrites the content
/// type so the upstream sees `application/grpc`. Response side: restores the
/// grpc-web content type, folds `grpc-status`/`grpc-message` response
/// headers into a trailer frame, and re-applies base64 in text mode.
/// Requires buffered bodies (BodyFilter phase).
pub struct GrpcWebFilter;

#[async_trait]
impl Filter for GrpcWebFilter {
    fn name(&self) -> &str {
        "grpc-web"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Rewrite, Phase::HeaderFilter, Phase::BodyFilter]
    }

    async fn execute(&self, phase: Phase, ctx: &mut RequestContext) -> FilterResult {
        match phase {
            Phase::Rewrite => self.rewrite_request(ctx),
            Phase::HeaderFilter => self.rewrite_response_headers(ctx),
            Phase::BodyFilter => self.rewrite_response_body(ctx),
            _ => FilterResult::Continue,
        }
    }
}

impl GrpcWebFilter {
    fn rewrite_request(&self, ctx: &mut RequestContext) -> FilterResult {
        let Some(content_type) = ctx.get_header("content-type").map(str::to_string) else {
            return FilterResult::Continue;
        };
        if !content_type.starts_with("application/grpc-web") {
            return FilterResult::Continue;
        }
        let text_mode = content_type.starts_with("application/grpc-web-text");
        ctx.set_var(
            CTX_MODE_VAR,
            serde_json::Value::String(if text_mode { "text" } else { "binary" }.into()),
        );

        if text_mode && let Some(body) = ctx.request_body.take() {
            match BASE64.decode(&body) {
                Ok(raw) => ctx.request_body = Some(raw),
                Err(_) => {
                    return FilterResult::Respond {
                        status: 400,
                        headers: vec![("content-type".into(), "text/plain".into())],
                        body: Some(b"malformed grpc-web-text body".to_vec()),
                    };
                }
            }
        }
        ctx.set_header("content-type", "application/grpc".into());
        ctx.set_header("te", "trailers".into());
        FilterResult::Continue
    }

    fn rewrite_response_headers(&self, ctx: &mut RequestContext) -> FilterResult {
        let Some(mode) = ctx.get_var(CTX_MODE_VAR).and_then(|v| v.as_str()) else {
            return FilterResult::Continue;
        };
        let content_type = if mode == "text" {
            "application/grpc-web-text+proto"
        } else {
            "application/grpc-web+proto"
        };
        ctx.set_response_header("content-type", content_type.to_string());
        FilterResult::Continue
    }

    fn rewrite_response_body(&self, ctx: &mut RequestContext) -> FilterResult {
        let Some(mode) = ctx
            .get_var(CTX_MODE_VAR)
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return FilterResult::Continue;
        };
        let Some(body) = ctx.response_body.take() else {
            return FilterResult::Continue;
        };

        // grpc-status / grpc-message arrive as plain response headers on the
        // HTTP/1.1 upstream path; emit them as the trailer frame.
        let mut trailers = Vec::new();
        for name in ["grpc-status", "grpc-message"] {
            if let Some(value) = ctx.response_header(name) {
                trailers.push((name.to_string(), value.to_string()));
            }
        }
        if trailers.is_empty() {
            trailers.push(("grpc-status".to_string(), "0".to_string()));
        }
        for (name, _) in &trailers {
            ctx.remove_response_header(name);
        }

        let mut framed = body;
        framed.extend_from_slice(&encode_frame(&trailer_frame(&trailers)));

        ctx.response_body = Some(if mode == "text" {
            BASE64.encode(framed).into_bytes()
        } else {
            framed
        });
        FilterResult::Continue
    }
}

pub struct GrpcWebFactory;

impl FilterFactory for GrpcWebFactory {
    fn kind(&self) -> &str {
        "grpc-web"
    }

    fn default_priority(&self) -> i32 {
        700
    }

    fn configure(&self, _config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
        Ok(Arc::new(GrpcWebFilter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_core::snapshot::ConfigSnapshot;
    use std::collections::HashMap;

    #[test]
    fn test_frame_round_trip() {
        // Encode then decode yields the original payload bytes.
        let frames = vec![
            Frame::data(b"hello".to_vec()),
            Frame::data(vec![]),
            Frame::data(vec![0xff; 300]),
        ];
        let mut encoded = Vec::new();
        for frame in &frames {
            encoded.extend_from_slice(&encode_frame(frame));
        }
        let decoded = decode_frames(&encoded).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_round_trip_preserves_trailer_block() {
        let frames = vec![
            Frame::data(b"payload".to_vec()),
            Frame::trailers(b"grpc-status: 0\r\n".to_vec()),
        ];
        let mut encoded = Vec::new();
        for frame in &frames {
            encoded.extend_from_slice(&encode_frame(frame));
        }
        let decoded = decode_frames(&encoded).unwrap();
        assert_eq!(decoded, frames);
        assert!(decoded[1].is_trailers());
        assert!(!decoded[0].is_trailers());
    }

    #[test]
    fn test_wire_format_exact() {
        let encoded = encode_frame(&Frame::data(b"ab".to_vec()));
        assert_eq!(encoded, vec![0x00, 0x00, 0x00, 0x00, 0x02, b'a', b'b']);
        let trailer = encode_frame(&Frame::trailers(vec![]));
        assert_eq!(trailer, vec![0x80, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_truncated_input_fails() {
        assert!(decode_frames(&[0x00, 0x00]).is_err());
        assert!(decode_frames(&[0x00, 0x00, 0x00, 0x00, 0x05, b'x']).is_err());
    }

    #[test]
    fn test_text_round_trip() {
        let frames = vec![Frame::data(b"binary \x00\x01 payload".to_vec())];
        let text = encode_text(&frames);
        assert!(text.iter().all(|b| b.is_ascii()), "text mode is base64");
        assert_eq!(decode_text(&text).unwrap(), frames);
    }

    fn ctx(content_type: &str, body: Vec<u8>) -> RequestContext {
        let mut c = RequestContext::new(
            "POST".into(),
            "/pkg.Service/Method",
            HashMap::from([("content-type".to_string(), content_type.to_string())]),
            "1.1.1.1".into(),
            "r1".into(),
            "us1".into(),
            Arc::new(ConfigSnapshot::empty()),
        );
        c.request_body = Some(body);
        c
    }

    #[tokio::test]
    async fn test_text_request_decoded_for_upstream() {
        let frame = encode_frame(&Frame::data(b"msg".to_vec()));
        let mut c = ctx(
            "application/grpc-web-text",
            BASE64.encode(&frame).into_bytes(),
        );
        let f = GrpcWebFilter;
        let _ = f.execute(Phase::Rewrite, &mut c).await;
        assert_eq!(c.get_header("content-type"), Some("application/grpc"));
        assert_eq!(c.request_body.as_deref(), Some(frame.as_slice()));
    }

    #[tokio::test]
    async fn test_response_gets_trailer_frame() {
        let f = GrpcWebFilter;
        let mut c = ctx("application/grpc-web+proto", vec![]);
        let _ = f.execute(Phase::Rewrite, &mut c).await;

        c.response_headers
            .push(("grpc-status".into(), "0".into()));
        c.response_body = Some(encode_frame(&Frame::data(b"reply".to_vec())));
        let _ = f.execute(Phase::HeaderFilter, &mut c).await;
        let _ = f.execute(Phase::BodyFilter, &mut c).await;

        assert_eq!(
            c.response_header("content-type"),
            Some("application/grpc-web+proto")
        );
        let frames = decode_frames(c.response_body.as_deref().unwrap()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, b"reply");
        assert!(frames[1].is_trailers());
        assert!(
            String::from_utf8_lossy(&frames[1].payload).contains("grpc-status: 0")
        );
    }

    #[tokio::test]
    async fn test_non_grpc_request_untouched() {
        let f = GrpcWebFilter;
        let mut c = ctx("application/json", b"{}".to_vec());
        let _ = f.execute(Phase::Rewrite, &mut c).await;
        assert_eq!(c.get_header("content-type"), Some("application/json"));
        let _ = f.execute(Phase::BodyFilter, &mut c).await;
        assert!(c.response_body.is_none());
    }

    #[tokio::test]
    async fn test_malformed_text_body_rejected() {
        let f = GrpcWebFilter;
        let mut c = ctx("application/grpc-web-text", b"!!!not-base64!!!".to_vec());
        assert!(matches!(
            f.execute(Phase::Rewrite, &mut c).await,
            FilterResult::Respond { status: 400, .. }
        ));
    }
}
