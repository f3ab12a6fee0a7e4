//! Inbound marketplace webhook.
//!
//! # Endpoints
//!
//! - `POST /webhooks/mercadolibre` - Receive a notification
//! - `GET /webhooks/mercadolibre` - Capability descriptor
//!
//! # Check Order
//!
//! ```text
//! rate limit → authenticate → parse → dispatch (deadline race) → 200
//!     ↓             ↓           ↓
//!    429        401 / 403      400
//! ```
//!
//! Once a body parses, the sender only ever sees 200. Processing failures and
//! deadline timeouts are reported in the body, never as a 5xx, because the
//! marketplace retries and eventually disables integrations based on status
//! codes alone. Missed-feed recovery is the backstop for anything lost here.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, instrument, warn};

use crate::metrics;
use crate::middleware::{extract_client_ip, rate_limited_response};
use crate::models::{Topic, WebhookAck, WebhookNotification, WebhookStatusResponse};
use crate::security::{AuthError, SecurityEvent, SecurityEventType};
use crate::services::{Dispatched, IngestOutcome};
use crate::state::AppState;
use crate::validation::parse_notification;

pub const WEBHOOK_PATH: &str = "/webhooks/mercadolibre";

/// Receive one webhook delivery.
///
/// # Response Body
///
/// ```json
/// {
///   "received": true,
///   "success": true,
///   "topic": "items",
///   "notification_id": "3f1c...",
///   "processing_time_ms": 12
/// }
/// ```
///
/// When the processing budget runs out first the body is
/// `{"received": true, "timeout": true, ...}` and processing keeps running
/// in the background.
#[instrument(skip_all)]
pub async fn receive_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let client_ip = extract_client_ip(&headers).into_owned();
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok());

    // Fails open if the check overruns the processing budget
    let deadline = started + state.dispatcher.budget();
    match timeout_at(deadline, state.rate_limits.check_webhook(&client_ip, user_agent)).await {
        Ok(limit) if !limit.allowed => {
            warn!(client_ip = %client_ip, "Webhook rate limit exceeded");
            metrics::record_webhook_rejection("rate_limited");
            return rate_limited_response(&limit);
        }
        Ok(_) => {}
        Err(_) => warn!(client_ip = %client_ip, "Webhook rate limit check overran the budget, allowing request"),
    }

    match state.authenticator.validate(&headers, &body) {
        Ok(auth) => debug!(client_ip = %auth.client_ip, method = auth.method.as_str(), "Webhook authenticated"),
        Err(err) => return reject_unauthenticated(&state, err, user_agent),
    }

    let notification = match parse_notification(&body, state.config.ml_app_id.as_deref()) {
        Ok(notification) => notification,
        Err(e) => {
            debug!(client_ip = %client_ip, error = %e, "Webhook body rejected");
            metrics::record_webhook_rejection(e.kind());
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.public_message() })),
            )
                .into_response();
        }
    };

    let topic = notification.topic;
    let ack = dispatch(&state, notification, started).await;

    metrics::record_webhook_duration(topic.as_str(), started.elapsed().as_secs_f64());
    (StatusCode::OK, Json(ack)).into_response()
}

async fn dispatch(
    state: &AppState,
    notification: WebhookNotification,
    started: Instant,
) -> WebhookAck {
    let topic = notification.topic;
    let user_id = notification.user_id;
    let resource = notification.resource.clone();
    let pipeline = state.pipeline.clone();

    let dispatched = state
        .dispatcher
        .dispatch_from(started, async move { pipeline.handle(&notification).await })
        .await;
    let ms = elapsed_ms(started);

    match dispatched {
        Dispatched::Completed { value, .. } => {
            metrics::record_webhook_notification(topic.as_str(), value.label());
            match value {
                IngestOutcome::Processed { id, .. } => {
                    info!(user_id, topic = %topic, notification_id = %id, ms, "Webhook processed");
                    WebhookAck::processed(topic, id.to_string(), false, ms)
                }
                IngestOutcome::Duplicate { id } => {
                    debug!(notification_id = %id, "Duplicate webhook delivery");
                    WebhookAck::processed(topic, id.to_string(), true, ms)
                }
                IngestOutcome::Failed { error, .. } => WebhookAck::failed(Some(topic), error.kind(), ms),
            }
        }
        Dispatched::TimedOut { .. } => {
            metrics::record_webhook_notification(topic.as_str(), "timeout");
            WebhookAck::timed_out(ms)
        }
        Dispatched::Panicked { .. } => {
            metrics::record_webhook_notification(topic.as_str(), "failed");
            state.security_events.log_event(
                SecurityEvent::new(SecurityEventType::ProcessingFailure)
                    .with_user(user_id)
                    .with_path(WEBHOOK_PATH)
                    .with_detail("topic", topic.as_str())
                    .with_detail("resource", resource)
                    .with_detail("error_kind", "panic"),
            );
            WebhookAck::failed(Some(topic), "internal_error", ms)
        }
    }
}

fn reject_unauthenticated(state: &AppState, err: AuthError, user_agent: Option<&str>) -> Response {
    let client_ip = err.client_ip().to_string();
    let status = err.status_code();

    let (event_type, reason, body) = match &err {
        AuthError::UnauthorizedIp { .. } => (
            SecurityEventType::WebhookIpRejected,
            "ip_not_allowed",
            json!({ "error": "Unauthorized IP", "ml_compliance": "ip_validation_failed" }),
        ),
        AuthError::Unauthorized { reason, .. } => (
            SecurityEventType::WebhookAuthFailed,
            *reason,
            json!({ "error": "Unauthorized" }),
        ),
    };

    warn!(client_ip = %client_ip, reason, status = status.as_u16(), "Webhook authentication failed");
    metrics::record_webhook_rejection(if status == StatusCode::FORBIDDEN {
        "ip_not_allowed"
    } else {
        "unauthorized"
    });

    let mut event = SecurityEvent::new(event_type)
        .with_ip(client_ip)
        .with_path(WEBHOOK_PATH)
        .with_detail("reason", reason);
    if let Some(user_agent) = user_agent {
        event = event.with_detail("user_agent", user_agent);
    }
    state.security_events.log_event(event);

    (status, Json(body)).into_response()
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Capability descriptor for the webhook endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "active",
///   "service": "meli_webhook_gateway",
///   "supported_topics": ["orders_v2", "items", "questions", "messages", "shipments", "payments"],
///   "timeout_ms": 500,
///   "deadline_buffer_ms": 25,
///   "ip_validation_enforced": true,
///   "signature_validation": true
/// }
/// ```
#[instrument(skip(state))]
pub async fn webhook_status(State(state): State<AppState>) -> Json<WebhookStatusResponse> {
    Json(WebhookStatusResponse {
        status: "active".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        supported_topics: Topic::ALL.to_vec(),
        timeout_ms: state.config.webhook_timeout.as_millis() as u64,
        deadline_buffer_ms: state.config.deadline_buffer.as_millis() as u64,
        ip_validation_enforced: state.authenticator.enforces_ip(),
        signature_validation: state.authenticator.has_secret(),
        timestamp: Utc::now(),
    })
}
