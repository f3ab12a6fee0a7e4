//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Sets and propagates X-Request-Id
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   Body Limit     │ ← 413 above MAX_REQUEST_BODY_SIZE
//! └────────┬─────────┘
//!          │
//!          ├──────────── /admin/* ───────────┐
//!          │                                 ▼
//!          │                       ┌──────────────────┐
//!          │                       │  Rate Limiting   │ ← 429 per IP / endpoint
//!          │                       └────────┬─────────┘
//!          │                                ▼
//!          │                       ┌──────────────────┐
//!          │                       │  API Key Auth    │ ← 401, 429 on brute force
//!          │                       └────────┬─────────┘
//!          ▼                                ▼
//!      Handler                          Handler
//! ```
//!
//! The webhook route runs its rate-limit and authentication steps inside the
//! handler; see [`crate::handlers`].
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Health & monitoring
//! - `/webhooks/mercadolibre` - Marketplace notifications
//! - `/admin` - Recovery and security events (only when `ADMIN_API_KEY` is set)

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::{ApiKeyAuth, RateLimitLayer};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route(
            handlers::WEBHOOK_PATH,
            post(handlers::receive_notification).get(handlers::webhook_status),
        );

    match config.admin_api_key.clone() {
        Some(api_key) => {
            info!("Admin API enabled");
            router = router.nest("/admin", admin_router(&state, api_key));
        }
        None => info!("Admin API disabled (no ADMIN_API_KEY set)"),
    }

    info!(
        max_size_kb = config.max_request_body_size / 1024,
        "Request body size limit configured"
    );

    router
        .layer(DefaultBodyLimit::max(config.max_request_body_size))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Admin routes. The last layer added runs first, so rate limiting sees the
/// request before the API key is checked.
fn admin_router(state: &AppState, api_key: String) -> Router<AppState> {
    Router::new()
        .route("/recovery/{tenant_id}", post(handlers::trigger_recovery))
        .route("/recovery/{tenant_id}/last", get(handlers::last_recovery))
        .route("/security/events", get(handlers::list_security_events))
        .layer(ApiKeyAuth::new(
            api_key,
            state.rate_limits.clone(),
            state.security_events.clone(),
        ))
        .layer(RateLimitLayer::new(state.rate_limits.clone()))
}
