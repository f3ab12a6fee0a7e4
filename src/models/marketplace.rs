use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};

use super::{Topic, WebhookNotification};

// =============================================================================
// Entities refreshed by topic handlers
// =============================================================================

/// Order as returned by `GET /orders/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub status: String,
    #[serde(default)]
    pub status_detail: Option<String>,
    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_closed: Option<DateTime<Utc>>,
    pub total_amount: Decimal,
    #[serde(default)]
    pub paid_amount: Option<Decimal>,
    pub currency_id: String,
    #[serde(default)]
    pub pack_id: Option<u64>,
    #[serde(default)]
    pub buyer: Option<OrderBuyer>,
    #[serde(default)]
    pub order_items: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBuyer {
    pub id: u64,
    #[serde(default)]
    pub nickname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub item: OrderLineItem,
    pub quantity: u32,
    pub unit_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLineItem {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Listing as returned by `GET /items/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub title: String,
    pub price: Decimal,
    pub currency_id: String,
    #[serde(default)]
    pub available_quantity: i64,
    #[serde(default)]
    pub sold_quantity: i64,
    pub status: String,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Buyer question as returned by `GET /questions/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: u64,
    pub item_id: String,
    pub text: String,
    pub status: String,
    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub answer: Option<Answer>,
    #[serde(default)]
    pub from: Option<QuestionAuthor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub status: String,
    #[serde(default)]
    pub date_created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionAuthor {
    pub id: u64,
}

/// Post-sale conversation of a pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackMessages {
    #[serde(default)]
    pub messages: Vec<PackMessage>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackMessage {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub from: Option<MessageParty>,
    #[serde(default)]
    pub to: Option<MessageParty>,
    #[serde(default)]
    pub message_date: Option<MessageDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageParty {
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDate {
    #[serde(default)]
    pub received: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: Option<DateTime<Utc>>,
}

/// Typed result of a topic handler's fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TopicPayload {
    Order(Order),
    Item(Item),
    Question(Question),
    Messages(PackMessages),
    Unrecognized { topic: String },
}

// =============================================================================
// Missed feeds
// =============================================================================

/// One undelivered notification from the missed-feeds listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissedFeed {
    #[serde(default, alias = "_id")]
    pub id: Option<String>,
    pub resource: String,
    pub user_id: u64,
    pub topic: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub application_id: String,
    #[serde(default)]
    pub attempts: u32,
    pub sent: DateTime<Utc>,
    #[serde(default)]
    pub received: Option<DateTime<Utc>>,
}

impl MissedFeed {
    /// The feed's topic if it is on the allowlist.
    pub fn parsed_topic(&self) -> Option<Topic> {
        self.topic.parse().ok()
    }

    /// The feed as a notification envelope, so pushed and pulled events
    /// share one processing path. `None` for topics off the allowlist.
    pub fn to_notification(&self, now: DateTime<Utc>) -> Option<WebhookNotification> {
        Some(WebhookNotification {
            user_id: self.user_id,
            topic: self.parsed_topic()?,
            resource: self.resource.clone(),
            application_id: self.application_id.clone(),
            attempts: self.attempts,
            sent: self.sent,
            received: self.received.unwrap_or(now),
        })
    }
}

/// A page of the missed-feeds listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissedFeedsPage {
    #[serde(default, alias = "messages")]
    pub feeds: Vec<MissedFeed>,
    #[serde(default)]
    pub paging: Paging,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: u64,
}

// =============================================================================
// Credentials
// =============================================================================

/// Per-tenant OAuth tokens, written by the login flow at `ml_tokens:{user_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl StoredCredentials {
    pub fn cache_key(user_id: u64) -> String {
        format!("ml_tokens:{user_id}")
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Accept either a JSON string or number and keep it as a string.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}
