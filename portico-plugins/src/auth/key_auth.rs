use super::{AuthDecision, AuthInfo, AuthRejection, Authenticator, hash_api_key};
use async_trait::async_trait;
use portico_plugin::plugin::RequestContext;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct KeyAuthConfig {
    /// Header carrying the API key
    #[serde(default = "default_header")]
    pub header: String,

    /// Query parameter fallback
    #[serde(default = "default_query")]
    pub query: String,

    /// Strip the credential before forwarding upstream
    #[serde(default)]
    pub hide_credentials: bool,
}

fn default_header() -> String {
    "apikey".to_string()
}

fn default_query() -> String {
    "apikey".to_string()
}

/// API-key authenticator. The key is hashed and matched against the
/// snapshot's consumer index; plaintext keys never leave this function.
pub struct KeyAuthenticator {
    header: String,
    query: String,
    hide_credentials: bool,
}

impl KeyAuthenticator {
    pub fn new(config: KeyAuthConfig) -> Self {
        Self {
            header: config.header.to_ascii_lowercase(),
            query: config.query,
            hide_credentials: config.hide_credentials,
        }
    }
}

#[async_trait]
impl Authenticator for KeyAuthenticator {
    fn name(&self) -> &str {
        "api_key"
    }

    async fn authenticate(&self, ctx: &mut RequestContext) -> AuthDecision {
        let key = ctx
            .get_header(&self.header)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .or_else(|| ctx.query_param(&self.query).map(str::to_string));

        let Some(key) = key else {
            return AuthDecision::Skip;
        };

        let hashed = hash_api_key(&key);
        let Some(consumer) = ctx.snapshot.consumer_by_key(&hashed) else {
            return AuthDecision::Rejected(AuthRejection {
                status: 401,
                reason: "Invalid API key".into(),
            });
        };

        let info = AuthInfo {
            user: Some(consumer.username.clone()),
            consumer_id: Some(consumer.id.clone()),
            claims: Default::default(),
            method: "api_key".into(),
        };

        if self.hide_credentials {
            ctx.remove_header(&self.header);
        }

        AuthDecision::Authenticated(info)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{ctx_with, snapshot_with_consumer};
    use super::*;
    use portico_core::snapshot::ConfigSnapshot;

    fn authenticator() -> KeyAuthenticator {
        KeyAuthenticator::new(KeyAuthConfig {
            header: default_header(),
            query: default_query(),
            hide_credentials: false,
        })
    }

    #[tokio::test]
    async fn test_no_key_skips() {
        let mut c = ctx_with(&[], "1.1.1.1", ConfigSnapshot::empty());
        assert!(matches!(
            authenticator().authenticate(&mut c).await,
            AuthDecision::Skip
        ));
    }

    #[tokio::test]
    async fn test_unknown_key_rejected() {
        let mut c = ctx_with(&[("apikey", "nope")], "1.1.1.1", ConfigSnapshot::empty());
        match authenticator().authenticate(&mut c).await {
            AuthDecision::Rejected(r) => assert_eq!(r.status, 401),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_key_from_query_parameter() {
        let snap = snapshot_with_consumer(&hash_api_key("qk"), &[]);
        let mut c = ctx_with(&[], "1.1.1.1", snap);
        c.query = "apikey=qk".into();
        match authenticator().authenticate(&mut c).await {
            AuthDecision::Authenticated(info) => {
                assert_eq!(info.consumer_id.as_deref(), Some("alice"));
            }
            other => panic!("expected authenticated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hide_credentials_strips_header() {
        let snap = snapshot_with_consumer(&hash_api_key("hk"), &[]);
        let mut c = ctx_with(&[("apikey", "hk")], "1.1.1.1", snap);
        let auth = KeyAuthenticator::new(KeyAuthConfig {
            header: "apikey".into(),
            query: "apikey".into(),
            hide_credentials: true,
        });
        assert!(matches!(
            auth.authenticate(&mut c).await,
            AuthDecision::Authenticated(_)
        ));
        assert!(c.get_header("apikey").is_none());
    }
}
