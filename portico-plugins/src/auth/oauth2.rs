use super::{AuthDecision, AuthInfo, AuthRejection, Authenticator, bearer_token};
use crate::sidecar::{SidecarClient, SidecarRequest};
use async_trait::async_trait;
use portico_plugin::plugin::RequestContext;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct OAuth2Config {
    /// RFC 7662 token-introspection endpoint
    pub introspection_url: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    3000
}

/// OAuth2 authenticator shell: bearer extraction here, token verification
/// delegated to an external introspection endpoint via the sidecar.
pub struct OAuth2Authenticator {
    config: OAuth2Config,
    sidecar: Arc<SidecarClient>,
}

impl OAuth2Authenticator {
    pub fn new(config: OAuth2Config, sidecar: Arc<SidecarClient>) -> Self {
        Self { config, sidecar }
    }
}

#[async_trait]
impl Authenticator for OAuth2Authenticator {
    fn name(&self) -> &str {
        "oauth2"
    }

    async fn authenticate(&self, ctx: &mut RequestContext) -> AuthDecision {
        let Some(token) = bearer_token(ctx) else {
            return AuthDecision::Skip;
        };

        let body = format!(
            "token={}&client_id={}&client_secret={}",
            token, self.config.client_id, self.config.client_secret
        );
        let response = self
            .sidecar
            .call(SidecarRequest {
                method: "POST".into(),
                url: self.config.introspection_url.clone(),
                headers: vec![(
                    "content-type".into(),
                    "application/x-www-form-urlencoded".into(),
                )],
                body: Some(body.into_bytes()),
                timeout_ms: self.config.timeout_ms,
            })
            .await;

        let response = match response {
            Ok(r) if r.status == 200 => r,
            Ok(r) => {
                return AuthDecision::Rejected(AuthRejection {
                    status: 401,
                    reason: format!("Introspection failed with status {}", r.status),
                });
            }
            Err(e) => {
                return AuthDecision::Rejected(AuthRejection {
                    status: 401,
                    reason: format!("Introspection unreachable: {e}"),
                });
            }
        };

        let claims: HashMap<String, serde_json::Value> =
            match serde_json::from_slice(&response.body) {
                Ok(c) => c,
                Err(_) => {
                    return AuthDecision::Rejected(AuthRejection {
                        status: 401,
                        reason: "Malformed introspection response".into(),
                    });
                }
            };

        if claims.get("active").and_then(|v| v.as_bool()) != Some(true) {
            return AuthDecision::Rejected(AuthRejection {
                status: 401,
                reason: "Token inactive".into(),
            });
        }

        let user = claims
            .get("sub")
            .or_else(|| claims.get("username"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        AuthDecision::Authenticated(AuthInfo {
            user,
            consumer_id: None,
            claims,
            method: "oauth2".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::ctx_with;
    use super::*;
    use portico_core::snapshot::ConfigSnapshot;

    fn authenticator() -> OAuth2Authenticator {
        OAuth2Authenticator::new(
            OAuth2Config {
                introspection_url: "http://127.0.0.1:1/introspect".into(),
                client_id: "gw".into(),
                client_secret: "s".into(),
                timeout_ms: 100,
            },
            Arc::new(SidecarClient::disconnected()),
        )
    }

    #[tokio::test]
    async fn test_no_bearer_skips() {
        let mut c = ctx_with(&[], "1.1.1.1", ConfigSnapshot::empty());
        assert!(matches!(
            authenticator().authenticate(&mut c).await,
            AuthDecision::Skip
        ));
    }

    #[tokio::test]
    async fn test_unreachable_introspection_rejects() {
        let mut c = ctx_with(
            &[("authorization", "Bearer tok")],
            "1.1.1.1",
            ConfigSnapshot::empty(),
        );
        match authenticator().authenticate(&mut c).await {
            AuthDecision::Rejected(r) => {
                assert_eq!(r.status, 401);
                assert!(r.reason.contains("unreachable"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
