//! Prometheus metrics for application observability.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `meli_webhook_notifications_total` - Accepted deliveries (labels: topic, outcome)
//! - `meli_webhook_rejections_total` - Rejected deliveries (labels: reason)
//! - `meli_admin_rejections_total` - Rejected admin requests (labels: reason)
//! - `meli_webhook_deadline_timeouts_total` - Deliveries answered by the deadline timer
//! - `meli_webhook_abandoned_completions_total` - Abandoned work that later finished (labels: status)
//! - `meli_recovery_feeds_total` - Recovered feeds (labels: outcome)
//! - `meli_recovery_runs_total` - Recovery runs (labels: status)
//! - `meli_security_events_total` - Security events (labels: type, severity)
//! - `meli_security_alerts_total` - Alerts fired (labels: rule)
//! - `meli_security_alert_dispatch_failures_total` - Failed alert POSTs
//! - `meli_rate_limit_store_errors_total` - Rate-limit checks that failed open
//! - `meli_circuit_breaker_opens_total` - Times the marketplace circuit opened
//! - `meli_circuit_breaker_rejections_total` - Calls rejected by the open circuit
//!
//! ## Histograms
//! - `meli_webhook_processing_duration_seconds` - Handler time to response (labels: topic)
//! - `meli_recovery_run_duration_seconds` - Recovery run duration
//! - `meli_marketplace_request_duration_seconds` - Marketplace API calls (labels: operation, status)
//!
//! ## Gauges
//! - `meli_circuit_breaker_state` - Circuit breaker state (0 = closed, 1 = half-open, 2 = open)
//!
//! # Usage
//!
//! ```rust,ignore
//! use meli_webhook_gateway::metrics::{init_metrics, record_webhook_notification};
//!
//! init_metrics("0.0.0.0:9090".parse()?)?;
//! record_webhook_notification("items", "processed");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const WEBHOOK_NOTIFICATIONS_TOTAL: &str = "meli_webhook_notifications_total";
    pub const WEBHOOK_REJECTIONS_TOTAL: &str = "meli_webhook_rejections_total";
    pub const ADMIN_REJECTIONS_TOTAL: &str = "meli_admin_rejections_total";
    pub const WEBHOOK_DEADLINE_TIMEOUTS_TOTAL: &str = "meli_webhook_deadline_timeouts_total";
    pub const WEBHOOK_ABANDONED_COMPLETIONS_TOTAL: &str =
        "meli_webhook_abandoned_completions_total";
    pub const WEBHOOK_PROCESSING_DURATION_SECONDS: &str =
        "meli_webhook_processing_duration_seconds";
    pub const RECOVERY_FEEDS_TOTAL: &str = "meli_recovery_feeds_total";
    pub const RECOVERY_RUNS_TOTAL: &str = "meli_recovery_runs_total";
    pub const RECOVERY_RUN_DURATION_SECONDS: &str = "meli_recovery_run_duration_seconds";
    pub const SECURITY_EVENTS_TOTAL: &str = "meli_security_events_total";
    pub const SECURITY_ALERTS_TOTAL: &str = "meli_security_alerts_total";
    pub const SECURITY_ALERT_DISPATCH_FAILURES_TOTAL: &str =
        "meli_security_alert_dispatch_failures_total";
    pub const RATE_LIMIT_STORE_ERRORS_TOTAL: &str = "meli_rate_limit_store_errors_total";
    pub const MARKETPLACE_REQUEST_DURATION_SECONDS: &str =
        "meli_marketplace_request_duration_seconds";
    pub const CIRCUIT_BREAKER_OPENS_TOTAL: &str = "meli_circuit_breaker_opens_total";
    pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str = "meli_circuit_breaker_rejections_total";
    pub const CIRCUIT_BREAKER_STATE: &str = "meli_circuit_breaker_state";
}

/// Initialize the Prometheus metrics exporter.
///
/// Sets up metric descriptions and starts the Prometheus HTTP listener on
/// `metrics_addr`.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::WEBHOOK_NOTIFICATIONS_TOTAL,
        "Webhook deliveries accepted, by topic and outcome"
    );
    describe_counter!(
        names::WEBHOOK_REJECTIONS_TOTAL,
        "Webhook deliveries rejected before processing, by reason"
    );
    describe_counter!(
        names::ADMIN_REJECTIONS_TOTAL,
        "Admin requests rejected by rate limiting or API key checks, by reason"
    );
    describe_counter!(
        names::WEBHOOK_DEADLINE_TIMEOUTS_TOTAL,
        "Webhook deliveries answered by the deadline timer"
    );
    describe_counter!(
        names::WEBHOOK_ABANDONED_COMPLETIONS_TOTAL,
        "Background processing that finished after its response was sent"
    );
    describe_counter!(names::RECOVERY_FEEDS_TOTAL, "Missed feeds handled by recovery");
    describe_counter!(names::RECOVERY_RUNS_TOTAL, "Recovery runs by status");
    describe_counter!(names::SECURITY_EVENTS_TOTAL, "Security events logged");
    describe_counter!(names::SECURITY_ALERTS_TOTAL, "Security alerts fired");
    describe_counter!(
        names::SECURITY_ALERT_DISPATCH_FAILURES_TOTAL,
        "Security alerts that could not be delivered"
    );
    describe_counter!(
        names::RATE_LIMIT_STORE_ERRORS_TOTAL,
        "Rate-limit checks that failed open because the store errored"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_OPENS_TOTAL,
        "Total number of times the marketplace circuit breaker opened"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_REJECTIONS_TOTAL,
        "Marketplace calls rejected by the open circuit breaker"
    );

    describe_histogram!(
        names::WEBHOOK_PROCESSING_DURATION_SECONDS,
        "Time from request to webhook response in seconds"
    );
    describe_histogram!(
        names::RECOVERY_RUN_DURATION_SECONDS,
        "Recovery run duration in seconds"
    );
    describe_histogram!(
        names::MARKETPLACE_REQUEST_DURATION_SECONDS,
        "Marketplace API call duration in seconds"
    );

    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record an accepted webhook delivery.
pub fn record_webhook_notification(topic: &str, outcome: &str) {
    counter!(names::WEBHOOK_NOTIFICATIONS_TOTAL, "topic" => topic.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record a webhook rejected before processing.
pub fn record_webhook_rejection(reason: &str) {
    counter!(names::WEBHOOK_REJECTIONS_TOTAL, "reason" => reason.to_string()).increment(1);
}

/// Record an admin request rejected by a middleware layer.
pub fn record_admin_rejection(reason: &str) {
    counter!(names::ADMIN_REJECTIONS_TOTAL, "reason" => reason.to_string()).increment(1);
}

/// Record a deadline timeout.
pub fn record_deadline_timeout() {
    counter!(names::WEBHOOK_DEADLINE_TIMEOUTS_TOTAL).increment(1);
}

/// Record abandoned work finishing in the background.
pub fn record_abandoned_completion(status: &str) {
    counter!(names::WEBHOOK_ABANDONED_COMPLETIONS_TOTAL, "status" => status.to_string())
        .increment(1);
}

/// Record recovered feeds by outcome.
pub fn record_recovery_feeds(outcome: &str, count: u64) {
    counter!(names::RECOVERY_FEEDS_TOTAL, "outcome" => outcome.to_string()).increment(count);
}

/// Record a recovery run.
pub fn record_recovery_run(status: &str) {
    counter!(names::RECOVERY_RUNS_TOTAL, "status" => status.to_string()).increment(1);
}

/// Record a security event.
pub fn record_security_event(event_type: &str, severity: &str) {
    counter!(names::SECURITY_EVENTS_TOTAL, "type" => event_type.to_string(), "severity" => severity.to_string())
        .increment(1);
}

/// Record a fired alert.
pub fn record_alert_fired(rule: &str) {
    counter!(names::SECURITY_ALERTS_TOTAL, "rule" => rule.to_string()).increment(1);
}

/// Record a failed alert POST.
pub fn record_alert_dispatch_failure() {
    counter!(names::SECURITY_ALERT_DISPATCH_FAILURES_TOTAL).increment(1);
}

/// Record a rate-limit check that failed open.
pub fn record_rate_limit_store_error(scope: &str) {
    counter!(names::RATE_LIMIT_STORE_ERRORS_TOTAL, "scope" => scope.to_string()).increment(1);
}

/// Record circuit breaker opening.
pub fn record_circuit_breaker_open() {
    counter!(names::CIRCUIT_BREAKER_OPENS_TOTAL).increment(1);
}

/// Record circuit breaker rejection.
pub fn record_circuit_breaker_rejection() {
    counter!(names::CIRCUIT_BREAKER_REJECTIONS_TOTAL).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record time spent answering a webhook.
pub fn record_webhook_duration(topic: &str, duration_secs: f64) {
    histogram!(names::WEBHOOK_PROCESSING_DURATION_SECONDS, "topic" => topic.to_string())
        .record(duration_secs);
}

/// Record recovery run duration.
pub fn record_recovery_duration(duration_secs: f64) {
    histogram!(names::RECOVERY_RUN_DURATION_SECONDS).record(duration_secs);
}

/// Record a marketplace API call.
pub fn record_marketplace_request(operation: &str, status: &str, duration_secs: f64) {
    histogram!(names::MARKETPLACE_REQUEST_DURATION_SECONDS, "operation" => operation.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

/// Update circuit breaker state gauge.
///
/// States: 0 = closed, 1 = half-open, 2 = open
pub fn set_circuit_breaker_state(state: u8) {
    gauge!(names::CIRCUIT_BREAKER_STATE).set(f64::from(state));
}
