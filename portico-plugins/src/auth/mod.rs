//! Authentication framework: the `Authenticator` capability trait, the
//! composing `auth` filter, credential extraction helpers, and API-key
//! hashing.

pub mod jwt_auth;
pub mod key_auth;
pub mod oauth2;

use crate::sidecar::SidecarClient;
use async_trait::async_trait;
use portico_plugin::plugin::{AuthInfo, Filter, FilterFactory, FilterResult, Phase, RequestContext};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// SHA-256 hex digest of an API key. Pure: any two parties hashing the same
/// key agree on the digest.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Extract a bearer token: case-insensitive scheme match on Authorization.
pub fn bearer_token<'a>(ctx: &'a RequestContext) -> Option<&'a str> {
    let value = ctx.get_header("authorization")?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    } else {
        None
    }
}

/// Why an authenticator turned the request away.
#[derive(Debug)]
pub struct AuthRejection {
    pub status: u16,
    pub reason: String,
}

/// One authenticator's verdict for a request.
#[derive(Debug)]
pub enum AuthDecision {
    /// Credentials verified
    Authenticated(AuthInfo),
    /// This authenticator's credential material is absent; let others try
    Skip,
    /// Credential material present but invalid/forbidden
    Rejected(AuthRejection),
}

/// Polymorphic credential verifier. Implementations extract their own
/// credential material (header, query, bearer) from the context.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &str;

    async fn authenticate(&self, ctx: &mut RequestContext) -> AuthDecision;
}

/// How the filter treats requests no authenticator accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    #[default]
    Reject,
    Passthrough,
}

#[derive(Deserialize)]
struct AuthFilterConfig {
    authenticators: Vec<AuthenticatorConfig>,

    #[serde(default)]
    failure_mode: FailureMode,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum AuthenticatorConfig {
    KeyAuth(key_auth::KeyAuthConfig),
    Jwt(jwt_auth::JwtConfig),
    Oauth2(oauth2::OAuth2Config),
}

/// The `auth` filter: delegates to its authenticators in order, attaches
/// identity on success, short-circuits on rejection when enforcing.
pub struct AuthFilter {
    authenticators: Vec<Arc<dyn Authenticator>>,
    failure_mode: FailureMode,
}

#[async_trait]
impl Filter for AuthFilter {
    fn name(&self) -> &str {
        "auth"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Access]
    }

    async fn execute(&self, _phase: Phase, ctx: &mut RequestContext) -> FilterResult {
        for authenticator in &self.authenticators {
            match authenticator.authenticate(ctx).await {
                AuthDecision::Authenticated(info) => {
                    debug!(
                        authenticator = authenticator.name(),
                        user = info.user.as_deref().unwrap_or("-"),
                        "Authenticated"
                    );
                    return self.attach_identity(ctx, info);
                }
                AuthDecision::Rejected(rejection) => {
                    if self.failure_mode == FailureMode::Reject {
                        return reject(rejection.status, &rejection.reason);
                    }
                    return FilterResult::Continue;
                }
                AuthDecision::Skip => {}
            }
        }

        // No authenticator found credential material at all.
        match self.failure_mode {
            FailureMode::Reject => reject(401, "Authentication required"),
            FailureMode::Passthrough => FilterResult::Continue,
        }
    }
}

impl AuthFilter {
    /// Attach consumer + claims to the context, enforcing consumer state
    /// and its IP whitelist.
    fn attach_identity(&self, ctx: &mut RequestContext, info: AuthInfo) -> FilterResult {
        if let Some(ref consumer_id) = info.consumer_id {
            let Some(consumer) = ctx.snapshot.consumer(consumer_id).cloned() else {
                return reject(401, "Unknown consumer");
            };
            if !consumer.enabled {
                return reject(403, "Consumer disabled");
            }
            if !whitelist_allows(&consumer.ip_whitelist, &ctx.client_ip) {
                return reject(403, "Source address not allowed");
            }
            ctx.consumer = Some(consumer);
        }
        ctx.auth = Some(info);
        FilterResult::Continue
    }
}

/// CIDR whitelist check; an empty list allows everything.
fn whitelist_allows(whitelist: &[String], client_ip: &str) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    let Ok(ip) = client_ip.parse::<std::net::IpAddr>() else {
        return false;
    };
    whitelist
        .iter()
        .filter_map(|entry| portico_core::snapshot::parse_cidr(entry))
        .any(|net| net.contains(&ip))
}

fn reject(status: u16, reason: &str) -> FilterResult {
    FilterResult::Respond {
        status,
        headers: vec![
            ("content-type".to_string(), "application/json".to_string()),
            (
                "www-authenticate".to_string(),
                "Bearer realm=\"portico\"".to_string(),
            ),
        ],
        body: Some(
            format!(r#"{{"error":"{}","status":{}}}"#, reason, status).into_bytes(),
        ),
    }
}

pub struct AuthFilterFactory {
    pub sidecar: Arc<SidecarClient>,
}

impl FilterFactory for AuthFilterFactory {
    fn kind(&self) -> &str {
        "auth"
    }

    fn default_priority(&self) -> i32 {
        2500
    }

    fn check_schema(&self, config: &serde_json::Value) -> anyhow::Result<()> {
        let cfg: AuthFilterConfig = serde_json::from_value(config.clone())?;
        if cfg.authenticators.is_empty() {
            anyhow::bail!("auth filter needs at least one authenticator");
        }
        Ok(())
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
        let cfg: AuthFilterConfig = serde_json::from_value(config.clone())?;
        let mut authenticators: Vec<Arc<dyn Authenticator>> = Vec::new();
        for auth_cfg in cfg.authenticators {
            authenticators.push(match auth_cfg {
                AuthenticatorConfig::KeyAuth(c) => Arc::new(key_auth::KeyAuthenticator::new(c)),
                AuthenticatorConfig::Jwt(c) => Arc::new(jwt_auth::JwtAuthenticator::new(c)?),
                AuthenticatorConfig::Oauth2(c) => {
                    Arc::new(oauth2::OAuth2Authenticator::new(c, Arc::clone(&self.sidecar)))
                }
            });
        }
        Ok(Arc::new(AuthFilter {
            authenticators,
            failure_mode: cfg.failure_mode,
        }))
    }
}
