use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Marketplace event category.
///
/// Only these topics are accepted on the wire. Shipments and payments are
/// acknowledged but have no refresh handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    #[serde(rename = "orders_v2")]
    OrdersV2,
    Items,
    Questions,
    Messages,
    Shipments,
    Payments,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::OrdersV2,
        Topic::Items,
        Topic::Questions,
        Topic::Messages,
        Topic::Shipments,
        Topic::Payments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::OrdersV2 => "orders_v2",
            Topic::Items => "items",
            Topic::Questions => "questions",
            Topic::Messages => "messages",
            Topic::Shipments => "shipments",
            Topic::Payments => "payments",
        }
    }

    /// Whether the topic processor refreshes state for this topic.
    pub fn has_handler(&self) -> bool {
        matches!(
            self,
            Topic::OrdersV2 | Topic::Items | Topic::Questions | Topic::Messages
        )
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a topic string is not on the allowlist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported topic '{0}'")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

/// Validated inbound notification envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookNotification {
    pub user_id: u64,
    pub topic: Topic,
    pub resource: String,
    pub application_id: String,
    pub attempts: u32,
    pub sent: DateTime<Utc>,
    pub received: DateTime<Utc>,
}

impl WebhookNotification {
    /// Stable id used for processed markers.
    pub fn notification_id(&self) -> NotificationId {
        NotificationId::derive(self.user_id, self.topic, &self.resource, self.sent)
    }
}

/// Idempotency key for a notification.
///
/// Pushed notifications and pulled feeds describing the same event hash to
/// the same id, so either path dedupes against the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    const HEX_LEN: usize = 32;

    pub fn derive(user_id: u64, topic: Topic, resource: &str, sent: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user_id.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(topic.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(resource.as_bytes());
        hasher.update(b"|");
        hasher.update(sent.timestamp_millis().to_string().as_bytes());
        let digest = hasher.finalize();

        let mut id = String::with_capacity(Self::HEX_LEN);
        for byte in digest.iter().take(Self::HEX_LEN / 2) {
            let _ = write!(id, "{byte:02x}");
        }
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
