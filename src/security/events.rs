//! Security audit trail with threshold alerting.
//!
//! [`SecurityEventSink::log_event`] is synchronous and infallible: it appends
//! to a bounded ring buffer, emits a structured log line under the
//! `security` target, and evaluates the alert rule table against the
//! buffered window. Alerts are POSTed to an external URL on a tracked
//! background task; dispatch failures are logged and counted only.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics;

/// Timeout for a single alert POST.
const ALERT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    WebhookAuthFailed,
    WebhookIpRejected,
    RateLimitExceeded,
    AdminAuthFailed,
    BruteForceBlocked,
    ProcessingFailure,
    RecoveryFailure,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::WebhookAuthFailed => "webhook_auth_failed",
            SecurityEventType::WebhookIpRejected => "webhook_ip_rejected",
            SecurityEventType::RateLimitExceeded => "rate_limit_exceeded",
            SecurityEventType::AdminAuthFailed => "admin_auth_failed",
            SecurityEventType::BruteForceBlocked => "brute_force_blocked",
            SecurityEventType::ProcessingFailure => "processing_failure",
            SecurityEventType::RecoveryFailure => "recovery_failure",
        }
    }

    fn default_severity(&self) -> Severity {
        match self {
            SecurityEventType::RateLimitExceeded => Severity::Low,
            SecurityEventType::WebhookAuthFailed
            | SecurityEventType::AdminAuthFailed
            | SecurityEventType::ProcessingFailure => Severity::Medium,
            SecurityEventType::WebhookIpRejected
            | SecurityEventType::BruteForceBlocked
            | SecurityEventType::RecoveryFailure => Severity::High,
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    /// Create an event with the type's default severity.
    pub fn new(event_type: SecurityEventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            severity: event_type.default_severity(),
            user_id: None,
            client_ip: None,
            path: None,
            details: serde_json::Value::Object(serde_json::Map::new()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_user(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Add one key to `details`.
    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.details {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// =============================================================================
// Alert rules
// =============================================================================

/// How events are bucketed when counting toward a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    Ip,
    User,
    Global,
}

impl GroupBy {
    fn key(&self, event: &SecurityEvent) -> Option<String> {
        match self {
            GroupBy::Ip => event.client_ip.clone(),
            GroupBy::User => event.user_id.map(|u| u.to_string()),
            GroupBy::Global => Some("global".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertRule {
    pub event_type: SecurityEventType,
    pub threshold: usize,
    pub window: Duration,
    pub group_by: GroupBy,
    pub severity: Severity,
}

impl AlertRule {
    const fn new(
        event_type: SecurityEventType,
        threshold: usize,
        window_secs: u64,
        group_by: GroupBy,
        severity: Severity,
    ) -> Self {
        Self {
            event_type,
            threshold,
            window: Duration::from_secs(window_secs),
            group_by,
            severity,
        }
    }
}

/// The built-in rule table.
pub fn default_rules() -> Vec<AlertRule> {
    use GroupBy::*;
    use SecurityEventType::*;

    vec![
        AlertRule::new(WebhookAuthFailed, 5, 300, Ip, Severity::High),
        AlertRule::new(WebhookIpRejected, 3, 600, Ip, Severity::High),
        AlertRule::new(RateLimitExceeded, 20, 60, Ip, Severity::Medium),
        AlertRule::new(AdminAuthFailed, 5, 900, Ip, Severity::High),
        AlertRule::new(BruteForceBlocked, 1, 900, Ip, Severity::Critical),
        AlertRule::new(ProcessingFailure, 10, 300, Global, Severity::High),
        AlertRule::new(RecoveryFailure, 1, 3600, User, Severity::High),
    ]
}

/// A rule whose threshold was reached by the latest event.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertTrigger {
    pub event_type: SecurityEventType,
    pub group_key: String,
    pub count: usize,
    pub window: Duration,
    pub severity: Severity,
}

/// Decide which rules `latest` trips, given the buffered window.
///
/// `recent` must already contain `latest`. Pure: no clock, no I/O.
pub fn evaluate_rules<'a, I>(
    rules: &[AlertRule],
    recent: I,
    latest: &SecurityEvent,
) -> Vec<AlertTrigger>
where
    I: IntoIterator<Item = &'a SecurityEvent> + Clone,
{
    rules
        .iter()
        .filter(|rule| rule.event_type == latest.event_type)
        .filter_map(|rule| {
            let group_key = rule.group_by.key(latest)?;
            let window = chrono::Duration::from_std(rule.window).ok()?;
            let since = latest.timestamp - window;

            let count = recent
                .clone()
                .into_iter()
                .filter(|e| e.event_type == rule.event_type)
                .filter(|e| e.timestamp > since && e.timestamp <= latest.timestamp)
                .filter(|e| rule.group_by.key(e).as_deref() == Some(group_key.as_str()))
                .count();

            (count >= rule.threshold).then(|| AlertTrigger {
                event_type: rule.event_type,
                group_key,
                count,
                window: rule.window,
                severity: rule.severity,
            })
        })
        .collect()
}

/// Payload POSTed to the alert URL.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule: SecurityEventType,
    pub group_key: String,
    pub count: usize,
    pub window_secs: u64,
    pub severity: Severity,
    pub triggered_at: DateTime<Utc>,
    pub latest_event: SecurityEvent,
}

// =============================================================================
// Sink
// =============================================================================

/// Bounded, thread-safe security event sink.
#[derive(Clone)]
pub struct SecurityEventSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    capacity: usize,
    buffer: Mutex<VecDeque<SecurityEvent>>,
    rules: Vec<AlertRule>,
    /// Rule and group key to the time its alert is muted until
    cooldowns: Mutex<HashMap<(SecurityEventType, String), DateTime<Utc>>>,
    alert_url: Option<String>,
    http: Option<reqwest::Client>,
    tracker: TaskTracker,
}

impl SecurityEventSink {
    /// Create a sink with the default rule table.
    ///
    /// Alert POSTs are spawned on `tracker` so shutdown can wait for them.
    pub fn new(capacity: usize, alert_url: Option<String>, tracker: TaskTracker) -> Self {
        Self::with_rules(capacity, alert_url, tracker, default_rules())
    }

    pub fn with_rules(
        capacity: usize,
        alert_url: Option<String>,
        tracker: TaskTracker,
        rules: Vec<AlertRule>,
    ) -> Self {
        let http = alert_url.as_ref().and_then(|_| {
            reqwest::Client::builder()
                .timeout(ALERT_DISPATCH_TIMEOUT)
                .build()
                .inspect_err(|e| warn!(error = %e, "Alert HTTP client unavailable, alerts will be logged only"))
                .ok()
        });

        Self {
            inner: Arc::new(SinkInner {
                capacity: capacity.max(1),
                buffer: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
                rules,
                cooldowns: Mutex::new(HashMap::new()),
                alert_url,
                http,
                tracker,
            }),
        }
    }

    /// Record an event. Never panics and never blocks on I/O.
    pub fn log_event(&self, event: SecurityEvent) {
        emit_log(&event);
        metrics::record_security_event(event.event_type.as_str(), event.severity.as_str());

        let triggers = {
            let mut buffer = self.inner.buffer.lock();
            if buffer.len() >= self.inner.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
            evaluate_rules(&self.inner.rules, buffer.iter(), &event)
        };

        for trigger in triggers {
            if self.cooling_down(&trigger, event.timestamp) {
                debug!(
                    rule = %trigger.event_type,
                    group = %trigger.group_key,
                    "Alert suppressed by cooldown"
                );
                continue;
            }
            self.fire(trigger, &event);
        }
    }

    /// Up to `limit` most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.inner
            .buffer
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Buffered event count per type.
    pub fn counts_by_type(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for event in self.inner.buffer.lock().iter() {
            *counts.entry(event.event_type.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.inner.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true when the rule already fired for this group inside its window.
    /// Otherwise mutes the group until `now + window`.
    ///
    /// Expired mutes are dropped on every firing and the map never holds more
    /// than the buffer capacity; group keys come from client-supplied headers.
    fn cooling_down(&self, trigger: &AlertTrigger, now: DateTime<Utc>) -> bool {
        let key = (trigger.event_type, trigger.group_key.clone());
        let window = chrono::Duration::from_std(trigger.window).unwrap_or(chrono::Duration::zero());
        let mut cooldowns = self.inner.cooldowns.lock();

        if let Some(until) = cooldowns.get(&key)
            && now < *until
        {
            return true;
        }

        cooldowns.retain(|_, until| *until > now);
        if cooldowns.len() >= self.inner.capacity {
            let soonest = cooldowns
                .iter()
                .min_by_key(|(_, until)| **until)
                .map(|(k, _)| k.clone());
            if let Some(soonest) = soonest {
                cooldowns.remove(&soonest);
            }
        }

        cooldowns.insert(key, now + window);
        false
    }

    fn fire(&self, trigger: AlertTrigger, latest: &SecurityEvent) {
        let alert = Alert {
            id: Uuid::new_v4(),
            rule: trigger.event_type,
            group_key: trigger.group_key,
            count: trigger.count,
            window_secs: trigger.window.as_secs(),
            severity: trigger.severity,
            triggered_at: Utc::now(),
            latest_event: latest.clone(),
        };

        error!(
            target: "security",
            alert_id = %alert.id,
            rule = %alert.rule,
            group = %alert.group_key,
            count = alert.count,
            window_secs = alert.window_secs,
            severity = alert.severity.as_str(),
            "Security alert triggered"
        );
        metrics::record_alert_fired(alert.rule.as_str());

        let (Some(url), Some(http)) = (self.inner.alert_url.clone(), self.inner.http.clone()) else {
            return;
        };

        // Outside a runtime there is nowhere to run the POST; the log line above stands
        if tokio::runtime::Handle::try_current().is_err() || self.inner.tracker.is_closed() {
            warn!(alert_id = %alert.id, "Alert not dispatched: no active runtime");
            return;
        }

        self.inner.tracker.spawn(async move {
            match http.post(&url).json(&alert).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(alert_id = %alert.id, "Security alert dispatched");
                }
                Ok(resp) => {
                    error!(alert_id = %alert.id, status = %resp.status(), "Alert sink rejected alert");
                    metrics::record_alert_dispatch_failure();
                }
                Err(e) => {
                    error!(alert_id = %alert.id, error = %e, "Failed to dispatch security alert");
                    metrics::record_alert_dispatch_failure();
                }
            }
        });
    }
}

fn emit_log(event: &SecurityEvent) {
    let ip = event.client_ip.as_deref().unwrap_or("-");
    let path = event.path.as_deref().unwrap_or("-");
    match event.severity {
        Severity::Low => info!(
            target: "security",
            event_type = %event.event_type,
            severity = event.severity.as_str(),
            user_id = ?event.user_id,
            client_ip = ip,
            path = path,
            details = %event.details,
            "Security event"
        ),
        Severity::Medium => warn!(
            target: "security",
            event_type = %event.event_type,
            severity = event.severity.as_str(),
            user_id = ?event.user_id,
            client_ip = ip,
            path = path,
            details = %event.details,
            "Security event"
        ),
        Severity::High | Severity::Critical => error!(
            target: "security",
            event_type = %event.event_type,
            severity = event.severity.as_str(),
            user_id = ?event.user_id,
            client_ip = ip,
            path = path,
            details = %event.details,
            "Security event"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sink(capacity: usize) -> SecurityEventSink {
        SecurityEventSink::new(capacity, None, TaskTracker::new())
    }

    fn auth_failure(ip: &str, at: DateTime<Utc>) -> SecurityEvent {
        SecurityEvent::new(SecurityEventType::WebhookAuthFailed)
            .with_ip(ip)
            .at(at)
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let sink = sink(3);
        for user in 1..=5 {
            sink.log_event(SecurityEvent::new(SecurityEventType::ProcessingFailure).with_user(user));
        }

        let recent = sink.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].user_id, Some(5));
        assert_eq!(recent[2].user_id, Some(3));
    }

    #[test]
    fn test_recent_respects_limit() {
        let sink = sink(10);
        for _ in 0..4 {
            sink.log_event(SecurityEvent::new(SecurityEventType::RateLimitExceeded));
        }
        assert_eq!(sink.recent(2).len(), 2);
    }

    #[test]
    fn test_counts_by_type() {
        let sink = sink(10);
        sink.log_event(SecurityEvent::new(SecurityEventType::RateLimitExceeded));
        sink.log_event(SecurityEvent::new(SecurityEventType::RateLimitExceeded));
        sink.log_event(SecurityEvent::new(SecurityEventType::AdminAuthFailed));

        let counts = sink.counts_by_type();
        assert_eq!(counts.get("rate_limit_exceeded"), Some(&2));
        assert_eq!(counts.get("admin_auth_failed"), Some(&1));
    }

    #[test]
    fn test_rule_fires_at_threshold_per_ip() {
        let rules = default_rules();
        let now = Utc::now();
        let mut window: Vec<SecurityEvent> =
            (0..4).map(|_| auth_failure("1.2.3.4", now)).collect();
        window.push(auth_failure("5.6.7.8", now));

        let latest = auth_failure("1.2.3.4", now);
        assert!(evaluate_rules(&rules, window.iter(), &latest).is_empty());

        window.push(latest.clone());
        let triggers = evaluate_rules(&rules, window.iter(), &latest);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].group_key, "1.2.3.4");
        assert_eq!(triggers[0].count, 5);
    }

    #[test]
    fn test_rule_ignores_events_outside_window() {
        let rules = default_rules();
        let now = Utc::now();
        let old = now - chrono::Duration::minutes(6);
        let mut window: Vec<SecurityEvent> =
            (0..4).map(|_| auth_failure("1.2.3.4", old)).collect();
        let latest = auth_failure("1.2.3.4", now);
        window.push(latest.clone());

        assert!(evaluate_rules(&rules, window.iter(), &latest).is_empty());
    }

    #[test]
    fn test_user_grouped_rule_needs_user() {
        let rules = default_rules();
        let anonymous = SecurityEvent::new(SecurityEventType::RecoveryFailure);
        assert!(evaluate_rules(&rules, [anonymous.clone()].iter(), &anonymous).is_empty());

        let tenant = SecurityEvent::new(SecurityEventType::RecoveryFailure).with_user(9);
        let triggers = evaluate_rules(&rules, [tenant.clone()].iter(), &tenant);
        assert_eq!(triggers[0].group_key, "9");
    }

    #[test]
    fn test_cooldown_mutes_repeat_alerts() {
        let sink = sink(100);
        let now = Utc::now();
        let trigger = AlertTrigger {
            event_type: SecurityEventType::BruteForceBlocked,
            group_key: "1.2.3.4".to_string(),
            count: 1,
            window: Duration::from_secs(900),
            severity: Severity::Critical,
        };

        assert!(!sink.cooling_down(&trigger, now));
        assert!(sink.cooling_down(&trigger, now + chrono::Duration::minutes(1)));
        assert!(!sink.cooling_down(&trigger, now + chrono::Duration::minutes(16)));
    }

    #[test]
    fn test_cooldowns_stay_bounded_across_many_ips() {
        let sink = sink(10);
        for i in 0..500u32 {
            sink.log_event(
                SecurityEvent::new(SecurityEventType::BruteForceBlocked)
                    .with_ip(format!("10.0.{}.{}", i / 256, i % 256)),
            );
        }

        assert!(sink.inner.cooldowns.lock().len() <= 10);
    }

    #[test]
    fn test_expired_cooldowns_are_dropped() {
        let sink = sink(100);
        let now = Utc::now();
        sink.log_event(
            SecurityEvent::new(SecurityEventType::BruteForceBlocked)
                .with_ip("1.1.1.1")
                .at(now),
        );
        sink.log_event(
            SecurityEvent::new(SecurityEventType::BruteForceBlocked)
                .with_ip("2.2.2.2")
                .at(now + chrono::Duration::minutes(16)),
        );

        let cooldowns = sink.inner.cooldowns.lock();
        assert_eq!(cooldowns.len(), 1);
        assert!(cooldowns.contains_key(&(
            SecurityEventType::BruteForceBlocked,
            "2.2.2.2".to_string()
        )));
    }

    #[test]
    fn test_log_event_without_runtime_does_not_panic() {
        let sink = SecurityEventSink::new(
            10,
            Some("http://127.0.0.1:1/alerts".to_string()),
            TaskTracker::new(),
        );
        sink.log_event(SecurityEvent::new(SecurityEventType::BruteForceBlocked).with_ip("1.2.3.4"));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_event_serializes_type_field() {
        let event = SecurityEvent::new(SecurityEventType::WebhookIpRejected)
            .with_ip("9.9.9.9")
            .with_detail("reason", "not allowlisted");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "webhook_ip_rejected");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["details"]["reason"], "not allowlisted");
    }
}
