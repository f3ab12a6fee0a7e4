use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Topic;
use crate::security::SecurityEvent;

/// Body returned to the marketplace for every accepted webhook delivery.
///
/// Internal failures and deadline timeouts are still `200` responses; the
/// flags below tell them apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<Topic>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_time_ms: u64,
}

impl WebhookAck {
    /// Processing finished inside the deadline.
    pub fn processed(topic: Topic, notification_id: String, duplicate: bool, ms: u64) -> Self {
        Self {
            received: true,
            success: Some(true),
            topic: Some(topic),
            notification_id: Some(notification_id),
            duplicate: duplicate.then_some(true),
            timeout: None,
            error: None,
            processing_time_ms: ms,
        }
    }

    /// Processing finished inside the deadline but failed.
    pub fn failed(topic: Option<Topic>, error: impl Into<String>, ms: u64) -> Self {
        Self {
            received: true,
            success: Some(false),
            topic,
            notification_id: None,
            duplicate: None,
            timeout: None,
            error: Some(error.into()),
            processing_time_ms: ms,
        }
    }

    /// The deadline fired first; processing continues in the background.
    pub fn timed_out(ms: u64) -> Self {
        Self {
            received: true,
            success: None,
            topic: None,
            notification_id: None,
            duplicate: None,
            timeout: Some(true),
            error: None,
            processing_time_ms: ms,
        }
    }
}

/// Capability descriptor served on `GET /webhooks/mercadolibre`.
#[derive(Debug, Serialize)]
pub struct WebhookStatusResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub supported_topics: Vec<Topic>,
    pub timeout_ms: u64,
    pub deadline_buffer_ms: u64,
    pub ip_validation_enforced: bool,
    pub signature_validation: bool,
    pub timestamp: DateTime<Utc>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Store backend name
    pub store: String,
    /// Whether the store answered a ping
    pub store_healthy: bool,
    /// Service version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Body of `POST /admin/recovery/{tenant_id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecoveryRequest {
    /// Restrict to these topics (all topics when absent)
    #[serde(default)]
    pub topics: Option<Vec<Topic>>,
    /// Drop feeds sent earlier than this many hours ago
    #[serde(default)]
    pub max_age_hours: Option<u32>,
    /// Count without processing or writing markers
    #[serde(default)]
    pub dry_run: bool,
}

/// Summary of one missed-feed recovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub tenant_id: u64,
    pub run_id: Uuid,
    pub dry_run: bool,
    /// Feeds processed (or that would be, in dry-run mode)
    pub processed: u32,
    /// Feeds whose handler failed
    pub failed: u32,
    /// Feeds already marked completed
    pub skipped: u32,
    /// Feeds retained after filtering: `processed + failed + skipped`
    pub total: u32,
    /// Feeds dropped by the topic or age filter
    pub filtered: u32,
    /// Pages fetched from the listing
    pub pages: u32,
    /// Whether the run stopped before the listing was exhausted
    pub truncated: bool,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Query for `GET /admin/security/events`.
#[derive(Debug, Deserialize)]
pub struct SecurityEventsQuery {
    #[serde(default = "default_events_limit")]
    pub limit: usize,
}

fn default_events_limit() -> usize {
    100
}

/// Recent security events, newest first.
#[derive(Debug, Serialize)]
pub struct SecurityEventsResponse {
    pub events: Vec<SecurityEvent>,
    pub counts: BTreeMap<String, usize>,
    pub buffered: usize,
}
