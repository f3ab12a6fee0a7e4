//! Sliding-window rate limiting backed by the shared store.
//!
//! # Algorithm
//!
//! Each key holds the list of request timestamps (epoch ms) seen inside the
//! current window. On every check the list is loaded, timestamps older than
//! `now - window` are dropped, and the remainder is compared to the limit:
//!
//! - under the limit: `now` is appended and the list is written back with a
//!   TTL equal to the window
//! - at or over the limit: the request is rejected, nothing is appended, and
//!   `reset_time` is the oldest retained timestamp plus the window
//!
//! Because the list only ever holds admitted requests, its length never
//! exceeds `max_requests`.
//!
//! # Failure Semantics
//!
//! If the store errors, the check **fails open**: the request is allowed and
//! the error is logged and counted. Blocking legitimate webhook deliveries
//! risks the marketplace disabling the integration. Every store call is also
//! bounded by a store timeout; a slow store is treated like a failed one, so
//! the check can never eat the webhook's response deadline.
//!
//! # Policies
//!
//! [`RateLimitPolicies`] composes the primitive into the named policies the
//! service applies: per-IP, per-user, per-(endpoint, IP), webhook (higher
//! allowance for the marketplace's user-agent), login brute force (IP and
//! account checked together, most restrictive wins), and a daily per-user
//! ceiling. Whitelisted IPs bypass all of them.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::metrics;
use crate::middleware::IpAllowlist;
use crate::security::{SecurityEvent, SecurityEventSink, SecurityEventType};
use crate::store::{JsonStoreExt, SharedStore};

/// User-agent fragments the marketplace's notification sender uses.
const MARKETPLACE_USER_AGENTS: [&str; 2] = ["mercadolibre", "mercadolivre"];

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const MINUTE: Duration = Duration::from_secs(60);

/// Store timeout used when none is configured.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Limit and window for one policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// Epoch ms at which the oldest counted request leaves the window
    pub reset_time: i64,
    /// Seconds to wait before retrying, when rejected
    pub retry_after: Option<u64>,
    /// Requests counted in the window, including this one when admitted
    pub total_hits: u32,
}

impl RateLimitResult {
    /// Result used when a check is bypassed or fails open.
    fn unlimited(config: &RateLimitConfig, now_ms: i64) -> Self {
        Self {
            allowed: true,
            remaining: config.max_requests,
            reset_time: now_ms + config.window_ms(),
            retry_after: None,
            total_hits: 0,
        }
    }
}

/// What a bucket is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Ip,
    User,
    Endpoint,
    Webhook,
    /// Webhook deliveries carrying the marketplace's user-agent
    WebhookMarketplace,
    Login,
    Daily,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Ip => "ip",
            RateLimitScope::User => "user",
            RateLimitScope::Endpoint => "endpoint",
            RateLimitScope::Webhook => "webhook",
            RateLimitScope::WebhookMarketplace => "webhook_ml",
            RateLimitScope::Login => "login",
            RateLimitScope::Daily => "daily",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Store key for a bucket.
pub fn bucket_key(scope: RateLimitScope, identifier: &str) -> String {
    format!("rate_limit:{scope}:{identifier}")
}

/// The sliding-window primitive.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    store: SharedStore,
    store_timeout: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Bound each store read and write by `store_timeout`.
    pub fn with_store_timeout(mut self, store_timeout: Duration) -> Self {
        self.store_timeout = store_timeout;
        self
    }

    /// Check and, if admitted, count a request at the current wall-clock time.
    pub async fn check(
        &self,
        scope: RateLimitScope,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> RateLimitResult {
        self.check_at(scope, identifier, config, Utc::now().timestamp_millis())
            .await
    }

    /// Check and, if admitted, count a request at `now_ms`.
    pub async fn check_at(
        &self,
        scope: RateLimitScope,
        identifier: &str,
        config: &RateLimitConfig,
        now_ms: i64,
    ) -> RateLimitResult {
        self.evaluate(scope, identifier, config, now_ms, true).await
    }

    /// Evaluate without counting.
    pub async fn peek_at(
        &self,
        scope: RateLimitScope,
        identifier: &str,
        config: &RateLimitConfig,
        now_ms: i64,
    ) -> RateLimitResult {
        self.evaluate(scope, identifier, config, now_ms, false).await
    }

    async fn evaluate(
        &self,
        scope: RateLimitScope,
        identifier: &str,
        config: &RateLimitConfig,
        now_ms: i64,
        record: bool,
    ) -> RateLimitResult {
        let key = bucket_key(scope, identifier);
        let window_ms = config.window_ms();

        let read = timeout(self.store_timeout, self.store.get_json::<Vec<i64>>(&key)).await;
        let mut hits = match read {
            Ok(Ok(hits)) => hits.unwrap_or_default(),
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Rate limit store read failed, allowing request");
                metrics::record_rate_limit_store_error(scope.as_str());
                return RateLimitResult::unlimited(config, now_ms);
            }
            Err(_) => {
                warn!(
                    key = %key,
                    timeout_ms = self.store_timeout.as_millis() as u64,
                    "Rate limit store read timed out, allowing request"
                );
                metrics::record_rate_limit_store_error(scope.as_str());
                return RateLimitResult::unlimited(config, now_ms);
            }
        };

        let cutoff = now_ms - window_ms;
        hits.retain(|&ts| ts > cutoff);
        hits.sort_unstable();

        let count = u32::try_from(hits.len()).unwrap_or(u32::MAX);
        let oldest = hits.first().copied();

        if count >= config.max_requests {
            let reset_time = oldest.unwrap_or(now_ms) + window_ms;
            let wait_ms = u64::try_from(reset_time - now_ms).unwrap_or(0);
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_time,
                retry_after: Some(wait_ms.div_ceil(1000).max(1)),
                total_hits: count,
            };
        }

        if !record {
            return RateLimitResult {
                allowed: true,
                remaining: config.max_requests - count,
                reset_time: oldest.unwrap_or(now_ms) + window_ms,
                retry_after: None,
                total_hits: count,
            };
        }

        hits.push(now_ms);
        match timeout(self.store_timeout, self.store.set_json(&key, &hits, config.window)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Rate limit store write failed, allowing request");
                metrics::record_rate_limit_store_error(scope.as_str());
            }
            Err(_) => {
                warn!(key = %key, "Rate limit store write timed out, allowing request");
                metrics::record_rate_limit_store_error(scope.as_str());
            }
        }

        let total_hits = count + 1;
        RateLimitResult {
            allowed: true,
            remaining: config.max_requests - total_hits,
            reset_time: oldest.unwrap_or(now_ms) + window_ms,
            retry_after: None,
            total_hits,
        }
    }
}

/// Thresholds for every named policy.
#[derive(Debug, Clone)]
pub struct PolicyLimits {
    pub ip: RateLimitConfig,
    pub user: RateLimitConfig,
    pub endpoint: RateLimitConfig,
    pub webhook: RateLimitConfig,
    pub webhook_marketplace: RateLimitConfig,
    pub login: RateLimitConfig,
    pub daily: RateLimitConfig,
    /// Bound on each store call made by a check
    pub store_timeout: Duration,
}

impl PolicyLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ip: RateLimitConfig::new(config.ip_rate_limit_max, MINUTE),
            user: RateLimitConfig::new(config.user_rate_limit_max, MINUTE),
            endpoint: RateLimitConfig::new(config.endpoint_rate_limit_max, MINUTE),
            webhook: RateLimitConfig::new(
                config.webhook_rate_limit_max,
                config.webhook_rate_limit_window,
            ),
            webhook_marketplace: RateLimitConfig::new(
                config.webhook_marketplace_rate_limit_max,
                config.webhook_rate_limit_window,
            ),
            login: RateLimitConfig::new(config.login_rate_limit_max, config.login_rate_limit_window),
            daily: RateLimitConfig::new(config.daily_user_rate_limit_max, DAY),
            store_timeout: config.rate_limit_store_timeout,
        }
    }
}

/// The named policies, with whitelist bypass and limit-reached events.
#[derive(Clone)]
pub struct RateLimitPolicies {
    limiter: SlidingWindowLimiter,
    limits: PolicyLimits,
    whitelist: IpAllowlist,
    events: SecurityEventSink,
}

impl RateLimitPolicies {
    pub fn new(
        store: SharedStore,
        limits: PolicyLimits,
        whitelist: IpAllowlist,
        events: SecurityEventSink,
    ) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(store).with_store_timeout(limits.store_timeout),
            limits,
            whitelist,
            events,
        }
    }

    pub fn limits(&self) -> &PolicyLimits {
        &self.limits
    }

    pub fn is_whitelisted(&self, ip: &str) -> bool {
        self.whitelist.contains(ip)
    }

    pub async fn check_ip(&self, ip: &str) -> RateLimitResult {
        let config = self.limits.ip;
        self.guarded(RateLimitScope::Ip, ip, &config, Some(ip), None)
            .await
    }

    pub async fn check_user(&self, user_id: u64) -> RateLimitResult {
        let config = self.limits.user;
        self.guarded(RateLimitScope::User, &user_id.to_string(), &config, None, Some(user_id))
            .await
    }

    /// Per-(endpoint, IP) policy.
    pub async fn check_endpoint(&self, endpoint: &str, ip: &str) -> RateLimitResult {
        let config = self.limits.endpoint;
        let id = format!("{endpoint}:{ip}");
        self.guarded(RateLimitScope::Endpoint, &id, &config, Some(ip), None)
            .await
    }

    /// Webhook policy. The marketplace's own user-agent gets the higher
    /// allowance in a bucket of its own.
    pub async fn check_webhook(&self, ip: &str, user_agent: Option<&str>) -> RateLimitResult {
        let (scope, config) = if is_marketplace_agent(user_agent) {
            (RateLimitScope::WebhookMarketplace, self.limits.webhook_marketplace)
        } else {
            (RateLimitScope::Webhook, self.limits.webhook)
        };
        self.guarded(scope, ip, &config, Some(ip), None).await
    }

    /// Daily per-user ceiling.
    pub async fn check_daily(&self, user_id: u64) -> RateLimitResult {
        let config = self.limits.daily;
        self.guarded(RateLimitScope::Daily, &user_id.to_string(), &config, None, Some(user_id))
            .await
    }

    /// Count a failed login against both the IP and (when known) the account.
    ///
    /// The most restrictive of the two results is returned.
    pub async fn record_login_failure(&self, ip: &str, account: Option<&str>) -> RateLimitResult {
        if self.is_whitelisted(ip) {
            return RateLimitResult::unlimited(&self.limits.login, Utc::now().timestamp_millis());
        }
        let config = self.limits.login;
        let now_ms = Utc::now().timestamp_millis();

        let by_ip = self
            .limiter
            .check_at(RateLimitScope::Login, &format!("ip:{ip}"), &config, now_ms)
            .await;
        let by_account = match account {
            Some(account) => Some(
                self.limiter
                    .check_at(
                        RateLimitScope::Login,
                        &format!("account:{account}"),
                        &config,
                        now_ms,
                    )
                    .await,
            ),
            None => None,
        };

        most_restrictive(by_ip, by_account)
    }

    /// Whether further login attempts are currently blocked. Does not count.
    pub async fn login_blocked(&self, ip: &str, account: Option<&str>) -> RateLimitResult {
        let config = self.limits.login;
        let now_ms = Utc::now().timestamp_millis();
        if self.is_whitelisted(ip) {
            return RateLimitResult::unlimited(&config, now_ms);
        }

        let by_ip = self
            .limiter
            .peek_at(RateLimitScope::Login, &format!("ip:{ip}"), &config, now_ms)
            .await;
        let by_account = match account {
            Some(account) => Some(
                self.limiter
                    .peek_at(
                        RateLimitScope::Login,
                        &format!("account:{account}"),
                        &config,
                        now_ms,
                    )
                    .await,
            ),
            None => None,
        };

        most_restrictive(by_ip, by_account)
    }

    async fn guarded(
        &self,
        scope: RateLimitScope,
        identifier: &str,
        config: &RateLimitConfig,
        ip: Option<&str>,
        user_id: Option<u64>,
    ) -> RateLimitResult {
        if let Some(ip) = ip
            && self.is_whitelisted(ip)
        {
            debug!(client_ip = %ip, scope = %scope, "Whitelisted IP bypasses rate limit");
            return RateLimitResult::unlimited(config, Utc::now().timestamp_millis());
        }

        let result = self.limiter.check(scope, identifier, config).await;
        if !result.allowed {
            self.on_limit_reached(scope, config, &result, ip, user_id);
        }
        result
    }

    fn on_limit_reached(
        &self,
        scope: RateLimitScope,
        config: &RateLimitConfig,
        result: &RateLimitResult,
        ip: Option<&str>,
        user_id: Option<u64>,
    ) {
        let mut event = SecurityEvent::new(SecurityEventType::RateLimitExceeded)
            .with_detail("scope", scope.as_str())
            .with_detail("limit", config.max_requests)
            .with_detail("window_ms", config.window_ms())
            .with_detail("total_hits", result.total_hits)
            .with_detail("retry_after", result.retry_after.unwrap_or(0));
        if let Some(ip) = ip {
            event = event.with_ip(ip);
        }
        if let Some(user_id) = user_id {
            event = event.with_user(user_id);
        }
        self.events.log_event(event);
    }
}

fn is_marketplace_agent(user_agent: Option<&str>) -> bool {
    user_agent.is_some_and(|ua| {
        let ua = ua.to_ascii_lowercase();
        MARKETPLACE_USER_AGENTS.iter().any(|sig| ua.contains(sig))
    })
}

fn most_restrictive(a: RateLimitResult, b: Option<RateLimitResult>) -> RateLimitResult {
    let Some(b) = b else {
        return a;
    };
    match (a.allowed, b.allowed) {
        (true, false) => b,
        (false, true) => a,
        (false, false) => {
            if a.retry_after >= b.retry_after {
                a
            } else {
                b
            }
        }
        (true, true) => {
            if a.remaining <= b.remaining {
                a
            } else {
                b
            }
        }
    }
}
