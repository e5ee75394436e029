use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// HTTP request handed to the background sidecar.
#[derive(Debug, Clone)]
pub struct SidecarRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout_ms: u64,
}

#[derive(Debug)]
pub struct SidecarResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

enum Job {
    Call {
        request: SidecarRequest,
        reply: oneshot::Sender<Result<SidecarResponse, String>>,
    },
    FireAndForget {
        request: SidecarRequest,
    },
}

/// Bridge from data-plane filters to a reqwest loop on the background tokio
/// runtime. Submitting is synchronous (unbounded channel); awaiting a reply
/// suspends on a oneshot, which is runtime-agnostic.
///
/// Used by traffic mirroring (fire-and-forget), the aggregator fan-out, and
/// OAuth2 token introspection.
pub struct SidecarClient {
    tx: Option<mpsc::UnboundedSender<Job>>,
}

impl SidecarClient {
    /// Spawn the consumer loop; must be called from the tokio runtime.
    pub fn start() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            while let Some(job) = rx.recv().await {
                let client = client.clone();
                tokio::spawn(async move {
                    match job {
                        Job::Call { request, reply } => {
                            let result = perform(&client, request).await;
                            let _ = reply.send(result);
                        }
                        Job::FireAndForget { request } => {
                            let url = request.url.clone();
                            if let Err(e) = perform(&client, request).await {
                                debug!(url = %url, error = %e, "Sidecar mirror request failed");
                            }
                        }
                    }
                });
            }
        });
        Self { tx: Some(tx) }
    }

    /// Client with no backing loop: `call` fails, `send` is a no-op.
    /// Used in tests and when the background runtime is unavailable.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// Perform a request and await its response.
    pub async fn call(&self, request: SidecarRequest) -> Result<SidecarResponse, String> {
        let Some(ref tx) = self.tx else {
            return Err("sidecar not running".into());
        };
        let (reply, rx) = oneshot::channel();
        tx.send(Job::Call { request, reply })
            .map_err(|_| "sidecar stopped".to_string())?;
        rx.await.map_err(|_| "sidecar dropped reply".to_string())?
    }

    /// Fire-and-forget submission.
    pub fn send(&self, request: SidecarRequest) {
        let Some(ref tx) = self.tx else {
            return;
        };
        if tx.send(Job::FireAndForget { request }).is_err() {
            warn!("Sidecar stopped; dropping mirrored request");
        }
    }
}

async fn perform(
    client: &reqwest::Client,
    request: SidecarRequest,
) -> Result<SidecarResponse, String> {
    let method: reqwest::Method = request
        .method
        .parse()
        .map_err(|_| format!("bad method: {}", request.method))?;
    let mut builder = client
        .request(method, &request.url)
        .timeout(Duration::from_millis(request.timeout_ms.max(1)));
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = request.body {
        builder = builder.body(body);
    }
    let response = builder.send().await.map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(|e| e.to_string())?.to_vec();
    Ok(SidecarResponse { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disconnected_call_errors() {
        let client = SidecarClient::disconnected();
        let err = client
            .call(SidecarRequest {
                method: "GET".into(),
                url: "http://127.0.0.1:1/".into(),
                headers: vec![],
                body: None,
                timeout_ms: 100,
            })
            .await
            .unwrap_err();
        assert!(err.contains("not running"));
    }

    #[test]
    fn test_disconnected_send_is_noop() {
        let client = SidecarClient::disconnected();
        client.send(SidecarRequest {
            method: "POST".into(),
            url: "http://127.0.0.1:1/".into(),
            headers: vec![],
            body: Some(b"x".to_vec()),
            timeout_ms: 100,
        });
    }

    #[tokio::test]
    async fn test_call_unreachable_host_reports_error() {
        let client = SidecarClient::start();
        let err = client
            .call(SidecarRequest {
                method: "GET".into(),
                url: "http://127.0.0.1:1/".into(),
                headers: vec![],
                body: None,
                timeout_ms: 500,
            })
            .await
            .unwrap_err();
        assert!(!err.is_empty());
    }
}
