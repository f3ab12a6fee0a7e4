//! Webhook authentication, rate limiting, and the security audit trail.

pub mod authenticator;
pub mod events;
pub mod rate_limit;

pub use authenticator::{
    AuthError, AuthMethod, Authenticated, SECRET_HEADER, SIGNATURE_HEADER, WebhookAuthenticator,
    sign,
};
pub use events::{
    Alert, AlertRule, AlertTrigger, GroupBy, SecurityEvent, SecurityEventSink, SecurityEventType,
    Severity, default_rules, evaluate_rules,
};
pub use rate_limit::{
    PolicyLimits, RateLimitConfig, RateLimitPolicies, RateLimitResult, RateLimitScope,
    SlidingWindowLimiter, bucket_key,
};
