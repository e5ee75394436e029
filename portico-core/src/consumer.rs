use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A Consumer is an identified API client with its own policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consumer {
    /// Unique identifier
    pub id: String,

    /// Username
    #[serde(default)]
    pub username: String,

    /// SHA-256 hex digest of the consumer's API key
    #[serde(default)]
    pub hashed_api_key: Option<String>,

    /// Whether this consumer may authenticate at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Source-IP whitelist (CIDR notation; exact IPs are /32 or /128)
    #[serde(default)]
    pub ip_whitelist: Vec<String>,

    /// Per-consumer rate-limit override
    #[serde(default)]
    pub rate_limit: Option<ConsumerRateLimit>,

    /// Labels (metadata)
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// Quota override applied when this consumer is authenticated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsumerRateLimit {
    pub requests: u64,
    pub window_secs: u64,
}

fn default_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_defaults() {
        let c: Consumer = serde_json::from_value(serde_json::json!({"id": "alice"})).unwrap();
        assert!(c.enabled);
        assert!(c.hashed_api_key.is_none());
        assert!(c.ip_whitelist.is_empty());
        assert!(c.rate_limit.is_none());
    }

    #[test]
    fn test_consumer_rate_limit() {
        let c: Consumer = serde_json::from_value(serde_json::json!({
            "id": "bob",
            "rate_limit": {"requests": 10, "window_secs": 60}
        }))
        .unwrap();
        let rl = c.rate_limit.unwrap();
        assert_eq!(rl.requests, 10);
        assert_eq!(rl.window_secs, 60);
    }
}
