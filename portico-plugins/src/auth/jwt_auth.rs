use super::{AuthDecision, AuthInfo, AuthRejection, Authenticator, bearer_token};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use portico_plugin::plugin::RequestContext;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct JwtConfig {
    /// HMAC secret for HS* algorithms
    pub secret: String,

    /// Accepted algorithms
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<String>,

    /// Expected issuer (unchecked when absent)
    #[serde(default)]
    pub issuer: Option<String>,

    /// Claim carrying the consumer id
    #[serde(default)]
    pub consumer_claim: Option<String>,
}

fn default_algorithms() -> Vec<String> {
    vec!["HS256".to_string()]
}

/// Bearer-JWT authenticator backed by `jsonwebtoken`. Signature and expiry
/// verification are the black box; this shell extracts the token, verifies,
/// and maps claims onto the request identity.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
    consumer_claim: Option<String>,
}

impl JwtAuthenticator {
    pub fn new(config: JwtConfig) -> anyhow::Result<Self> {
        let algorithms = config
            .algorithms
            .iter()
            .map(|name| name.parse::<Algorithm>().map_err(|_| {
                anyhow::anyhow!("unsupported JWT algorithm: {name}")
            }))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut validation = Validation::default();
        validation.algorithms = algorithms;
        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }
        Ok(Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            consumer_claim: config.consumer_claim,
        })
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    fn name(&self) -> &str {
        "jwt"
    }

    async fn authenticate(&self, ctx: &mut RequestContext) -> AuthDecision {
        let Some(token) = bearer_token(ctx) else {
            return AuthDecision::Skip;
        };

        let claims = match jsonwebtoken::decode::<HashMap<String, serde_json::Value>>(
            token,
            &self.key,
            &self.validation,
        ) {
            Ok(data) => data.claims,
            Err(e) => {
                return AuthDecision::Rejected(AuthRejection {
                    status: 401,
                    reason: format!("Invalid token: {e}"),
                });
            }
        };

        let user = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let consumer_id = self
            .consumer_claim
            .as_ref()
            .and_then(|claim| claims.get(claim))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        AuthDecision::Authenticated(AuthInfo {
            user,
            consumer_id,
            claims,
            method: "jwt".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::ctx_with;
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use portico_core::snapshot::ConfigSnapshot;

    const SECRET: &str = "test-secret";

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn authenticator() -> JwtAuthenticator {
        JwtAuthenticator::new(JwtConfig {
            secret: SECRET.into(),
            algorithms: default_algorithms(),
            issuer: None,
            consumer_claim: None,
        })
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn test_valid_token_yields_claims() {
        let tok = token(serde_json::json!({"sub": "alice", "exp": future_exp()}));
        let mut c = ctx_with(
            &[("authorization", &format!("Bearer {tok}"))],
            "1.1.1.1",
            ConfigSnapshot::empty(),
        );
        match authenticator().authenticate(&mut c).await {
            AuthDecision::Authenticated(info) => {
                assert_eq!(info.user.as_deref(), Some("alice"));
                assert_eq!(info.method, "jwt");
                assert!(info.claims.contains_key("exp"));
            }
            other => panic!("expected authenticated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let tok = encode(
            &Header::default(),
            &serde_json::json!({"sub": "alice", "exp": future_exp()}),
            &EncodingKey::from_secret(b"wrong-secret"),
        )
        .unwrap();
        let mut c = ctx_with(
            &[("authorization", &format!("Bearer {tok}"))],
            "1.1.1.1",
            ConfigSnapshot::empty(),
        );
        match authenticator().authenticate(&mut c).await {
            AuthDecision::Rejected(r) => assert_eq!(r.status, 401),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_bearer_skips() {
        let mut c = ctx_with(&[], "1.1.1.1", ConfigSnapshot::empty());
        assert!(matches!(
            authenticator().authenticate(&mut c).await,
            AuthDecision::Skip
        ));
    }

    #[test]
    fn test_unsupported_algorithm_rejected_at_configure() {
        let err = JwtAuthenticator::new(JwtConfig {
            secret: "s".into(),
            algorithms: vec!["XX999".into()],
            issuer: None,
            consumer_claim: None,
        });
        assert!(err.is_err());
    }
}
