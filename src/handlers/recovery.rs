//! Admin endpoints for missed-feed recovery.
//!
//! - `POST /admin/recovery/{tenant_id}` - Run a recovery pass now
//! - `GET /admin/recovery/{tenant_id}/last` - Summary of the latest run
//!
//! Manual runs are bounded by the per-tenant policy and the daily ceiling on
//! top of the endpoint limit applied by the admin layer.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use tracing::{info, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::models::{RecoveryRequest, RecoveryResult};
use crate::security::RateLimitResult;
use crate::state::AppState;

/// Trigger a missed-feed recovery run for one tenant.
///
/// The body is optional; an empty body runs with defaults.
///
/// # Request Body
///
/// ```json
/// { "topics": ["orders_v2", "items"], "max_age_hours": 48, "dry_run": true }
/// ```
///
/// # Errors
///
/// - 400 if the body is not a valid request
/// - 429 if the tenant exhausted its per-minute or daily allowance
/// - 409 if the tenant has no usable marketplace credentials
/// - 502 if the first listing page cannot be fetched
#[instrument(skip(state, body))]
pub async fn trigger_recovery(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
    body: Bytes,
) -> AppResult<Json<RecoveryResult>> {
    let request: RecoveryRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RecoveryRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::BadRequest(format!("Invalid recovery request: {e}")))?
    };

    throttle(state.rate_limits.check_user(tenant_id).await, tenant_id, "per-tenant")?;
    throttle(state.rate_limits.check_daily(tenant_id).await, tenant_id, "daily")?;

    info!(
        tenant_id,
        dry_run = request.dry_run,
        "Manual missed-feed recovery requested"
    );
    let result = state
        .recovery
        .recover_all_missed_feeds(tenant_id, &request)
        .await?;

    Ok(Json(result))
}

/// Last persisted recovery summary for a tenant.
#[instrument(skip(state))]
pub async fn last_recovery(
    State(state): State<AppState>,
    Path(tenant_id): Path<u64>,
) -> AppResult<Json<RecoveryResult>> {
    state
        .recovery
        .last_result(tenant_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No recovery run recorded for tenant {tenant_id}")))
}

fn throttle(result: RateLimitResult, tenant_id: u64, policy: &str) -> AppResult<()> {
    if result.allowed {
        return Ok(());
    }
    warn!(tenant_id, policy, "Recovery trigger rate limited");
    Err(AppError::RateLimited {
        retry_after_secs: result.retry_after.unwrap_or(1).max(1),
    })
}
