//! API key authentication for the admin routes.
//!
//! # Security Features
//!
//! - **Constant-time comparison**: Prevents timing attacks on key validation
//! - **Brute-force guard**: failed attempts are counted per client IP with the
//!   login policy; once the limit is hit, further attempts get 429 before
//!   the key is even compared
//! - **Audit trail**: failures raise `admin_auth_failed` events, blocked
//!   attempts raise `brute_force_blocked`
//!
//! Clients provide the key in the `X-API-Key` header:
//!
//! ```bash
//! curl -H "X-API-Key: your-secret-key" -X POST http://localhost:3000/admin/recovery/123
//! ```
//!
//! The layer is only mounted when `ADMIN_API_KEY` is set; without a key the
//! admin routes do not exist.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::Json;
use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use serde_json::json;
use subtle::ConstantTimeEq;
use tower::{Layer, Service};
use tracing::{debug, error, warn};

use super::ip::extract_client_ip;
use super::rate_limit::rate_limited_response;
use crate::metrics;
use crate::security::{RateLimitPolicies, SecurityEvent, SecurityEventSink, SecurityEventType};

/// Header name for API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// API key authentication layer.
#[derive(Clone)]
pub struct ApiKeyAuth {
    expected_key: Arc<String>,
    policies: RateLimitPolicies,
    events: SecurityEventSink,
}

impl ApiKeyAuth {
    pub fn new(api_key: String, policies: RateLimitPolicies, events: SecurityEventSink) -> Self {
        Self {
            expected_key: Arc::new(api_key),
            policies,
            events,
        }
    }
}

impl<S> Layer<S> for ApiKeyAuth {
    type Service = ApiKeyAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApiKeyAuthService {
            inner,
            auth: self.clone(),
        }
    }
}

/// API key authentication service wrapper.
#[derive(Clone)]
pub struct ApiKeyAuthService<S> {
    inner: S,
    auth: ApiKeyAuth,
}

impl<S> Service<Request<Body>> for ApiKeyAuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let auth = self.auth.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let client_ip = extract_client_ip(req.headers()).into_owned();
            let path = req.uri().path().to_string();

            let blocked = auth.policies.login_blocked(&client_ip, None).await;
            if !blocked.allowed {
                error!(
                    client_ip = %client_ip,
                    retry_after_secs = blocked.retry_after.unwrap_or(1),
                    "IP blocked due to excessive admin auth failures"
                );
                auth.events.log_event(
                    SecurityEvent::new(SecurityEventType::BruteForceBlocked)
                        .with_ip(client_ip.as_str())
                        .with_path(path.as_str())
                        .with_detail("failures", blocked.total_hits),
                );
                metrics::record_admin_rejection("brute_force_blocked");
                return Ok(rate_limited_response(&blocked));
            }

            let reason = match req
                .headers()
                .get(API_KEY_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                Some(key) if constant_time_eq(key, &auth.expected_key) => None,
                Some(_) => Some("Invalid API key"),
                None => Some("API key required"),
            };

            let Some(reason) = reason else {
                debug!(path = %path, "Admin API key accepted");
                return inner.call(req).await;
            };

            let failures = auth.policies.record_login_failure(&client_ip, None).await;
            warn!(
                path = %path,
                client_ip = %client_ip,
                failures = failures.total_hits,
                reason,
                "Admin authentication failed"
            );
            auth.events.log_event(
                SecurityEvent::new(SecurityEventType::AdminAuthFailed)
                    .with_ip(client_ip.as_str())
                    .with_path(path.as_str())
                    .with_detail("reason", reason),
            );

            metrics::record_admin_rejection("unauthorized");
            Ok(unauthorized_response(reason))
        })
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn unauthorized_response(message: &str) -> Response<Body> {
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Unauthorized", "message": message })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("API-Key"));
    response
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq_equal() {
        assert!(constant_time_eq("secret123", "secret123"));
    }

    #[test]
    fn test_constant_time_eq_not_equal() {
        assert!(!constant_time_eq("secret123", "secret456"));
    }

    #[test]
    fn test_constant_time_eq_different_lengths() {
        assert!(!constant_time_eq("short", "much-longer-string"));
    }

    #[test]
    fn test_unauthorized_response_shape() {
        let response = unauthorized_response("API key required");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "API-Key"
        );
    }
}
