mod api;
mod marketplace;
mod notification;

pub use api::{
    HealthResponse, RecoveryRequest, RecoveryResult, SecurityEventsQuery, SecurityEventsResponse,
    WebhookAck, WebhookStatusResponse,
};
pub use marketplace::{
    Answer, Item, MessageDate, MessageParty, MissedFeed, MissedFeedsPage, Order, OrderBuyer,
    OrderLine, OrderLineItem, PackMessage, PackMessages, Paging, Question, QuestionAuthor,
    StoredCredentials, TopicPayload,
};
pub use notification::{NotificationId, Topic, UnknownTopic, WebhookNotification};
