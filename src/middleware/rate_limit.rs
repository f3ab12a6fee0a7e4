//! Per-IP and per-(endpoint, IP) rate limiting as a tower layer.
//!
//! The layer runs the generic IP policy, then the endpoint policy keyed on the
//! matched route template (so `/admin/recovery/1` and `/admin/recovery/2`
//! share a bucket). Both are sliding windows in the shared store and fail
//! open on store errors; see [`crate::security::rate_limit`].
//!
//! # Response Headers
//!
//! On rate limit exceeded (429):
//! - `Retry-After`: Seconds until the next request will be accepted
//! - `X-RateLimit-Remaining`: Always `0`
//! - `X-RateLimit-Reset`: Epoch seconds at which the window frees a slot
//!
//! # IP Spoofing
//!
//! Buckets are keyed on the forwarded client IP. See [`super::ip`] for the
//! proxy requirements.

use std::task::{Context, Poll};

use axum::Json;
use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use serde_json::json;
use tower::{Layer, Service};
use tracing::warn;

use super::ip::extract_client_ip;
use crate::metrics;
use crate::security::{RateLimitPolicies, RateLimitResult};

const RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// 429 with `Retry-After`, shared by every throttled surface.
pub fn rate_limited_response(result: &RateLimitResult) -> Response<Body> {
    let retry_after = result.retry_after.unwrap_or(1).max(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "Rate limit exceeded", "retry_after": retry_after })),
    )
        .into_response();

    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(result.remaining));
    headers.insert(
        RATE_LIMIT_RESET,
        HeaderValue::from(result.reset_time.div_euclid(1000)),
    );
    response
}

/// Rate limiting layer over [`RateLimitPolicies`].
#[derive(Clone)]
pub struct RateLimitLayer {
    policies: RateLimitPolicies,
}

impl RateLimitLayer {
    pub fn new(policies: RateLimitPolicies) -> Self {
        Self { policies }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            policies: self.policies.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    policies: RateLimitPolicies,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let policies = self.policies.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let client_ip = extract_client_ip(req.headers()).into_owned();
            let endpoint = req
                .extensions()
                .get::<MatchedPath>()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| req.uri().path().to_string());

            let by_ip = policies.check_ip(&client_ip).await;
            if !by_ip.allowed {
                warn!(client_ip = %client_ip, endpoint = %endpoint, "Per-IP rate limit exceeded");
                metrics::record_admin_rejection("rate_limited_ip");
                return Ok(rate_limited_response(&by_ip));
            }

            let by_endpoint = policies.check_endpoint(&endpoint, &client_ip).await;
            if !by_endpoint.allowed {
                warn!(client_ip = %client_ip, endpoint = %endpoint, "Endpoint rate limit exceeded");
                metrics::record_admin_rejection("rate_limited_endpoint");
                return Ok(rate_limited_response(&by_endpoint));
            }

            inner.call(req).await
        })
    }
}
