use async_trait::async_trait;
use ipnet::IpNet;
use portico_core::snapshot::parse_cidr;
use portico_plugin::plugin::{Filter, FilterFactory, FilterResult, Phase, RequestContext};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct IpAclConfig {
    /// When non-empty, only these networks are admitted
    #[serde(default)]
    allow: Vec<String>,

    /// Always rejected, checked before `allow`
    #[serde(default)]
    deny: Vec<String>,
}

/// Source-IP access control with CIDR support (bare IPs are /32 or /128).
pub struct IpAclFilter {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
}

#[async_trait]
impl Filter for IpAclFilter {
    fn name(&self) -> &str {
        "ip-acl"
    }

    async fn execute(&self, _phase: Phase, ctx: &mut RequestContext) -> FilterResult {
        let Ok(ip) = ctx.client_ip.parse::<IpAddr>() else {
            return forbidden(&ctx.client_ip);
        };
        if self.deny.iter().any(|net| net.contains(&ip)) {
            return forbidden(&ctx.client_ip);
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|net| net.contains(&ip)) {
            return forbidden(&ctx.client_ip);
        }
        FilterResult::Continue
    }
}

fn forbidden(ip: &str) -> FilterResult {
    FilterResult::Respond {
        status: 403,
        headers: vec![("content-type".into(), "application/json".into())],
        body: Some(format!(r#"{{"error":"IP denied: {ip}","status":403}}"#).into_bytes()),
    }
}

pub struct IpAclFactory;

impl FilterFactory for IpAclFactory {
    fn kind(&self) -> &str {
        "ip-acl"
    }

    fn default_priority(&self) -> i32 {
        3000
    }

    fn check_schema(&self, config: &serde_json::Value) -> anyhow::Result<()> {
        let cfg: IpAclConfig = serde_json::from_value(config.clone())?;
        for entry in cfg.allow.iter().chain(cfg.deny.iter()) {
            if parse_cidr(entry).is_none() {
                anyhow::bail!("invalid CIDR entry: {entry}");
            }
        }
        Ok(())
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
        let cfg: IpAclConfig = serde_json::from_value(config.clone())?;
        let parse_all = |entries: &[String]| -> anyhow::Result<Vec<IpNet>> {
            entries
                .iter()
                .map(|e| parse_cidr(e).ok_or_else(|| anyhow::anyhow!("invalid CIDR entry: {e}")))
                .collect()
        };
        Ok(Arc::new(IpAclFilter {
            allow: parse_all(&cfg.allow)?,
            deny: parse_all(&cfg.deny)?,
        }))
    }
}
