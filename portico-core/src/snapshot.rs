use crate::consumer::Consumer;
use crate::error::GatewayError;
use crate::route::{FilterSpec, PathRule, Route};
use crate::upstream::Upstream;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// On-disk routing state: what the config source deserializes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayState {
    #[serde(default)]
    pub routes: Vec<Route>,

    #[serde(default)]
    pub upstreams: Vec<Upstream>,

    #[serde(default)]
    pub consumers: Vec<Consumer>,

    /// Filters active on every route
    #[serde(default)]
    pub global_filters: Vec<FilterSpec>,
}

/// An immutable, atomically published bundle of routes/upstreams/consumers.
///
/// Built off-path by the config source, validated, then swapped in whole.
/// In-flight requests keep the snapshot they started with; writers never
/// mutate a published snapshot.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,

    pub routes: Vec<Arc<Route>>,
    pub upstreams: HashMap<String, Arc<Upstream>>,
    pub consumers: HashMap<String, Arc<Consumer>>,

    /// hashed_api_key → consumer id
    pub consumer_keys: HashMap<String, String>,

    pub global_filters: Vec<FilterSpec>,
}

impl ConfigSnapshot {
    /// Build and validate a snapshot from raw state.
    ///
    /// Any validation failure rejects the whole snapshot; the caller keeps
    /// serving the previous one.
    pub fn from_state(state: GatewayState, version: u64) -> Result<Self, GatewayError> {
        validate(&state)?;

        let upstreams: HashMap<String, Arc<Upstream>> = state
            .upstreams
            .into_iter()
            .map(|u| (u.id.clone(), Arc::new(u)))
            .collect();

        let mut consumer_keys = HashMap::new();
        let consumers: HashMap<String, Arc<Consumer>> = state
            .consumers
            .into_iter()
            .map(|c| {
                if let Some(ref key) = c.hashed_api_key {
                    consumer_keys.insert(key.clone(), c.id.clone());
                }
                (c.id.clone(), Arc::new(c))
            })
            .collect();

        Ok(Self {
            version,
            routes: state.routes.into_iter().map(Arc::new).collect(),
            upstreams,
            consumers,
            consumer_keys,
            global_filters: state.global_filters,
        })
    }

    pub fn upstream(&self, id: &str) -> Option<&Arc<Upstream>> {
        self.upstreams.get(id)
    }

    pub fn consumer(&self, id: &str) -> Option<&Arc<Consumer>> {
        self.consumers.get(id)
    }

    /// Consumer lookup by hashed API key.
    pub fn consumer_by_key(&self, hashed_key: &str) -> Option<&Arc<Consumer>> {
        self.consumer_keys
            .get(hashed_key)
            .and_then(|id| self.consumers.get(id))
    }

    /// Empty snapshot (version 0): what the gateway serves before the
    /// first publish.
    pub fn empty() -> Self {
        Self {
            version: 0,
            routes: Vec::new(),
            upstreams: HashMap::new(),
            consumers: HashMap::new(),
            consumer_keys: HashMap::new(),
            global_filters: Vec::new(),
        }
    }
}

/// Publish-time validation: rejects the snapshot before it can reach the
/// data plane.
fn validate(state: &GatewayState) -> Result<(), GatewayError> {
    let mut upstream_ids = HashSet::new();
    for upstream in &state.upstreams {
        if upstream.id.is_empty() {
            return Err(GatewayError::ConfigInvalid("upstream with empty id".into()));
        }
        if !upstream_ids.insert(upstream.id.as_str()) {
            return Err(GatewayError::ConfigInvalid(format!(
                "duplicate upstream id: {}",
                upstream.id
            )));
        }
        if upstream.targets.is_empty() {
            return Err(GatewayError::ConfigInvalid(format!(
                "upstream {} has no targets",
                upstream.id
            )));
        }
        for target in &upstream.targets {
            if target.host.is_empty() {
                return Err(GatewayError::ConfigInvalid(format!(
                    "upstream {} target with empty host",
                    upstream.id
                )));
            }
            if target.port == 0 {
                return Err(GatewayError::ConfigInvalid(format!(
                    "upstream {} target {} has port 0",
                    upstream.id, target.host
                )));
            }
            if target.weight == 0 {
                return Err(GatewayError::ConfigInvalid(format!(
                    "upstream {} target {} has weight 0",
                    upstream.id,
                    target.addr()
                )));
            }
        }
    }

    let mut route_ids = HashSet::new();
    for route in &state.routes {
        if route.id.is_empty() {
            return Err(GatewayError::ConfigInvalid("route with empty id".into()));
        }
        if !route_ids.insert(route.id.as_str()) {
            return Err(GatewayError::ConfigInvalid(format!(
                "duplicate route id: {}",
                route.id
            )));
        }
        if route.paths.is_empty() {
            return Err(GatewayError::ConfigInvalid(format!(
                "route {} has no path rules",
                route.id
            )));
        }
        for rule in &route.paths {
            if let PathRule::Regex(pattern) = rule {
                regex::Regex::new(pattern).map_err(|e| {
                    GatewayError::ConfigInvalid(format!(
                        "route {} regex '{}': {}",
                        route.id, pattern, e
                    ))
                })?;
            }
        }
        if !upstream_ids.contains(route.upstream_id.as_str()) {
            return Err(GatewayError::ConfigInvalid(format!(
                "route {} references unknown upstream: {}",
                route.id, route.upstream_id
            )));
        }
    }

    let mut consumer_ids = HashSet::new();
    let mut hashed_keys = HashSet::new();
    for consumer in &state.consumers {
        if !consumer_ids.insert(consumer.id.as_str()) {
            return Err(GatewayError::ConfigInvalid(format!(
                "duplicate consumer id: {}",
                consumer.id
            )));
        }
        if let Some(ref key) = consumer.hashed_api_key
            && !hashed_keys.insert(key.as_str())
        {
            return Err(GatewayError::ConfigInvalid(format!(
                "consumer {} reuses another consumer's API key",
                consumer.id
            )));
        }
        for cidr in &consumer.ip_whitelist {
            parse_cidr(cidr).ok_or_else(|| {
                GatewayError::ConfigInvalid(format!(
                    "consumer {} invalid whitelist entry: {}",
                    consumer.id, cidr
                ))
            })?;
        }
    }

    Ok(())
}

/// Parse a CIDR block, accepting bare IPs as /32 (or /128 for IPv6).
pub fn parse_cidr(s: &str) -> Option<ipnet::IpNet> {
    if let Ok(net) = s.parse::<ipnet::IpNet>() {
        return Some(net);
    }
    s.parse::<std::net::IpAddr>()
        .ok()
        .map(|ip| ipnet::IpNet::from(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_state() -> GatewayState {
        serde_yaml::from_str(
            r#"
upstreams:
  - id: us1
    targets:
      - host: 127.0.0.1
        port: 8080
routes:
  - id: r1
    paths:
      - type: prefix
        value: /api
    upstream_id: us1
consumers:
  - id: alice
    hashed_api_key: "deadbeef"
    ip_whitelist: ["10.0.0.0/8", "192.168.1.1"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_state_builds_snapshot() {
        let snap = ConfigSnapshot::from_state(base_state(), 1).unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.routes.len(), 1);
        assert!(snap.upstream("us1").is_some());
        assert_eq!(snap.consumer_by_key("deadbeef").unwrap().id, "alice");
    }

    #[test]
    fn test_route_with_unknown_upstream_rejected() {
        let mut state = base_state();
        state.routes[0].upstream_id = "missing".into();
        let err = ConfigSnapshot::from_state(state, 1).unwrap_err();
        assert!(matches!(err, GatewayError::ConfigInvalid(_)));
    }

    #[test]
    fn test_invalid_regex_rejected_at_publish() {
        let mut state = base_state();
        state.routes[0].paths = vec![PathRule::Regex("([".into())];
        let err = ConfigSnapshot::from_state(state, 1).unwrap_err();
        assert!(err.to_string().contains("regex"));
    }

    #[test]
    fn test_empty_targets_rejected() {
        let mut state = base_state();
        state.upstreams[0].targets.clear();
        assert!(ConfigSnapshot::from_state(state, 1).is_err());
    }

    #[test]
    fn test_zero_weight_rejected() {
        let mut state = base_state();
        state.upstreams[0].targets[0].weight = 0;
        assert!(ConfigSnapshot::from_state(state, 1).is_err());
    }

    #[test]
    fn test_duplicate_route_id_rejected() {
        let mut state = base_state();
        let dup = state.routes[0].clone();
        state.routes.push(dup);
        assert!(ConfigSnapshot::from_state(state, 1).is_err());
    }

    #[test]
    fn test_invalid_whitelist_entry_rejected() {
        let mut state = base_state();
        state.consumers[0].ip_whitelist.push("not-an-ip".into());
        assert!(ConfigSnapshot::from_state(state, 1).is_err());
    }

    #[test]
    fn test_parse_cidr_accepts_bare_ip() {
        assert!(parse_cidr("10.1.2.3").is_some());
        assert!(parse_cidr("10.0.0.0/8").is_some());
        assert!(parse_cidr("::1").is_some());
        assert!(parse_cidr("banana").is_none());
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = ConfigSnapshot::empty();
        assert_eq!(snap.version, 0);
        assert!(snap.routes.is_empty());
    }
}
