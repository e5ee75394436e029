use async_trait::async_trait;
use portico_plugin::plugin::{Filter, FilterFactory, FilterResult, Phase, RequestContext};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Quota accounting strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    FixedWindow,
    /// Window split into 10 equal sub-buckets; the count is the sum over
    /// the last 10 buckets.
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

/// What a quota is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Identifier {
    #[default]
    Ip,
    User,
    ApiKey,
    Combined,
}

#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub strategy: Strategy,

    /// Requests allowed per window
    #[serde(default = "default_requests")]
    pub requests: u64,

    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Bucket capacity for token/leaky strategies (defaults to `requests`)
    #[serde(default)]
    pub burst: Option<u64>,

    #[serde(default)]
    pub identifier: Identifier,
}

fn default_requests() -> u64 {
    60
}

fn default_window() -> u64 {
    60
}

const SUB_BUCKETS: u64 = 10;

#[derive(Debug)]
enum CounterState {
    Fixed {
        count: u64,
        window_start: Instant,
    },
    Sliding {
        /// (sub-bucket index, count) ring
        buckets: [(u64, u64); SUB_BUCKETS as usize],
    },
    Token {
        tokens: f64,
        last_refill: Instant,
    },
    Leaky {
        level: f64,
        last_leak: Instant,
    },
}

/// Verdict for one request against one quota.
#[derive(Debug)]
struct Decision {
    allowed: bool,
    remaining: u64,
    /// Seconds until the quota resets
    reset_secs: u64,
    /// Seconds a denied client should wait (≥ 1)
    retry_after: u64,
}

/// Local in-memory rate limiting. Counters are per process; a cluster-scope
/// backend would substitute the counter map and fall back to these local
/// counters when disconnected.
pub struct RateLimitFilter {
    config: RateLimitConfig,
    epoch: Instant,
    counters: Mutex<HashMap<String, CounterState>>,
}

impl RateLimitFilter {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Quota key per the identifier strategy. Unauthenticated requests under
    /// `user`/`api_key` fall back to the client IP.
    fn identify(&self, ctx: &RequestContext) -> String {
        let user = || {
            ctx.auth
                .as_ref()
                .and_then(|a| a.user.clone())
                .unwrap_or_else(|| ctx.client_ip.clone())
        };
        match self.config.identifier {
            Identifier::Ip => ctx.client_ip.clone(),
            Identifier::User => user(),
            Identifier::ApiKey => ctx
                .consumer
                .as_ref()
                .and_then(|c| c.hashed_api_key.clone())
                .unwrap_or_else(|| ctx.client_ip.clone()),
            Identifier::Combined => format!("{}|{}", ctx.client_ip, user()),
        }
    }

    /// Effective quota: the consumer's override wins when present.
    fn quota(&self, ctx: &RequestContext) -> (u64, u64) {
        if let Some(limit) = ctx.consumer.as_ref().and_then(|c| c.rate_limit) {
            (limit.requests.max(1), limit.window_secs.max(1))
        } else {
            (self.config.requests.max(1), self.config.window_secs.max(1))
        }
    }

    fn check(&self, key: String, limit: u64, window_secs: u64) -> Decision {
        let now = Instant::now();
        let mut counters = self.counters.lock().unwrap();
        let capacity = self.config.burst.unwrap_or(limit).max(1);

        let state = counters.entry(key).or_insert_with(|| match self.config.strategy {
            Strategy::FixedWindow => CounterState::Fixed {
                count: 0,
                window_start: now,
            },
            Strategy::SlidingWindow => CounterState::Sliding {
                buckets: [(u64::MAX, 0); SUB_BUCKETS as usize],
            },
            Strategy::TokenBucket => CounterState::Token {
                tokens: capacity as f64,
                last_refill: now,
            },
            Strategy::LeakyBucket => CounterState::Leaky {
                level: 0.0,
                last_leak: now,
            },
        });

        let rate_per_sec = limit as f64 / window_secs as f64;

        match state {
            CounterState::Fixed { count, window_start } => {
                let elapsed = now.duration_since(*window_start).as_secs();
                if elapsed >= window_secs {
                    *count = 0;
                    *window_start = now;
                }
                *count += 1;
                let reset = window_secs - now.duration_since(*window_start).as_secs().min(window_secs);
                Decision {
                    allowed: *count <= limit,
                    remaining: limit.saturating_sub(*count),
                    reset_secs: reset,
                    retry_after: reset.max(1),
                }
            }
            CounterState::Sliding { buckets } => {
                let sub_ms = (window_secs * 1000 / SUB_BUCKETS).max(1);
                let current = self.epoch.elapsed().as_millis() as u64 / sub_ms;
                let slot = &mut buckets[(current % SUB_BUCKETS) as usize];
                if slot.0 != current {
                    *slot = (current, 0);
                }
                let total: u64 = buckets
                    .iter()
                    .filter(|(idx, _)| *idx != u64::MAX && idx + SUB_BUCKETS > current)
                    .map(|(_, count)| count)
                    .sum();
                let allowed = total < limit;
                if allowed {
                    buckets[(current % SUB_BUCKETS) as usize].1 += 1;
                }
                let reset = sub_ms.div_ceil(1000);
                Decision {
                    allowed,
                    remaining: limit.saturating_sub(total + u64::from(allowed)),
                    reset_secs: reset,
                    retry_after: reset.max(1),
                }
            }
            CounterState::Token { tokens, last_refill } => {
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * rate_per_sec).min(capacity as f64);
                *last_refill = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    Decision {
                        allowed: true,
                        remaining: *tokens as u64,
                        reset_secs: ((capacity as f64 - *tokens) / rate_per_sec).ceil() as u64,
                        retry_after: 1,
                    }
                } else {
                    let wait = ((1.0 - *tokens) / rate_per_sec).ceil() as u64;
                    Decision {
                        allowed: false,
                        remaining: 0,
                        reset_secs: wait,
                        retry_after: wait.max(1),
                    }
                }
            }
            CounterState::Leaky { level, last_leak } => {
                let elapsed = now.duration_since(*last_leak).as_secs_f64();
                *level = (*level - elapsed * rate_per_sec).max(0.0);
                *last_leak = now;
                if *level + 1.0 <= capacity as f64 {
                    *level += 1.0;
                    Decision {
                        allowed: true,
                        remaining: (capacity as f64 - *level) as u64,
                        reset_secs: (*level / rate_per_sec).ceil() as u64,
                        retry_after: 1,
                    }
                } else {
                    let wait = ((*level + 1.0 - capacity as f64) / rate_per_sec).ceil() as u64;
                    Decision {
                        allowed: false,
                        remaining: 0,
                        reset_secs: wait,
                        retry_after: wait.max(1),
                    }
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[async_trait]
impl Filter for RateLimitFilter {
    fn name(&self) -> &str {
        "rate-limit"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::Access, Phase::HeaderFilter]
    }

    async fn execute(&self, phase: Phase, ctx: &mut RequestContext) -> FilterResult {
        match phase {
            Phase::Access => {
                let (limit, window) = self.quota(ctx);
                let key = self.identify(ctx);
                let decision = self.check(key, limit, window);

                let reset_at = unix_now() + decision.reset_secs;
                ctx.set_var("_rl_limit", limit.into());
                ctx.set_var("_rl_remaining", decision.remaining.into());
                ctx.set_var("_rl_reset", reset_at.into());

                if decision.allowed {
                    return FilterResult::Continue;
                }
                FilterResult::Respond {
                    status: 429,
                    headers: vec![
                        ("content-type".into(), "application/json".into()),
                        ("x-ratelimit-limit".into(), limit.to_string()),
                        ("x-ratelimit-remaining".into(), "0".into()),
                        ("x-ratelimit-reset".into(), reset_at.to_string()),
                        ("retry-after".into(), decision.retry_after.max(1).to_string()),
                    ],
                    body: Some(br#"{"error":"Rate limit exceeded","status":429}"#.to_vec()),
                }
            }
            Phase::HeaderFilter => {
                // Quota headers on allowed responses too
                for (var, header) in [
                    ("_rl_limit", "x-ratelimit-limit"),
                    ("_rl_remaining", "x-ratelimit-remaining"),
                    ("_rl_reset", "x-ratelimit-reset"),
                ] {
                    if let Some(value) = ctx.get_var(var).and_then(|v| v.as_u64()) {
                        ctx.set_response_header(header, value.to_string());
                    }
                }
                FilterResult::Continue
            }
            _ => FilterResult::Continue,
        }
    }
}

pub struct RateLimitFactory;

impl FilterFactory for RateLimitFactory {
    fn kind(&self) -> &str {
        "rate-limit"
    }

    fn default_priority(&self) -> i32 {
        1001
    }

    fn check_schema(&self, config: &serde_json::Value) -> anyhow::Result<()> {
        let cfg: RateLimitConfig = serde_json::from_value(config.clone())?;
        if cfg.requests == 0 {
            anyhow::bail!("requests must be >= 1");
        }
        Ok(())
    }

    fn configure(&self, config: &serde_json::Value) -> anyhow::Result<Arc<dyn Filter>> {
        let cfg: RateLimitConfig = serde_json::from_value(config.clone())?;
        Ok(Arc::new(RateLimitFilter::new(cfg)))
    }
}
