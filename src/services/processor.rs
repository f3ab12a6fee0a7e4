//! Topic handlers: refresh cached marketplace state for one notification.
//!
//! Each handler derives an entity id from the notification's `resource`,
//! fetches the entity with the tenant's cached access token, overwrites its
//! canonical cache key, and deletes the coarser aggregates it could affect.
//! Every step is an overwrite or a delete, so running the same notification
//! twice leaves the same cache state. Abandoned webhook work that finishes
//! after its response was sent relies on this.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::error::{AppError, AppResult};
use crate::marketplace::SharedMarketplace;
use crate::models::{StoredCredentials, Topic, TopicPayload};
use crate::store::{JsonStoreExt, SharedStore};

/// What a handler did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The entity was re-fetched and written under `key`.
    Refreshed {
        key: String,
        invalidated: Vec<String>,
    },
    /// The topic is allowed but has no handler.
    Ignored { topic: Topic },
}

/// Entity reference parsed out of a notification resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    Order(String),
    Item(String),
    Question(String),
    Pack { pack_id: String, seller_id: String },
    Unhandled(Topic),
}

impl ResourceRef {
    /// Parse `resource` for `topic`. Query strings are ignored.
    ///
    /// A plain `/messages/{id}` is read as a pack sold by `user_id`.
    pub fn parse(topic: Topic, resource: &str, user_id: u64) -> AppResult<Self> {
        let path = resource.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        let invalid = || AppError::InvalidResource(format!("{topic}: {resource}"));

        let parsed = match (topic, segments.as_slice()) {
            (Topic::OrdersV2, ["orders", id]) => ResourceRef::Order(entity_id(id).ok_or_else(invalid)?),
            (Topic::Items, ["items", id]) => ResourceRef::Item(entity_id(id).ok_or_else(invalid)?),
            (Topic::Questions, ["questions", id]) => {
                ResourceRef::Question(entity_id(id).ok_or_else(invalid)?)
            }
            (Topic::Messages, ["messages", "packs", pack, "sellers", seller]) => ResourceRef::Pack {
                pack_id: entity_id(pack).ok_or_else(invalid)?,
                seller_id: entity_id(seller).ok_or_else(invalid)?,
            },
            (Topic::Messages, ["messages", id]) => ResourceRef::Pack {
                pack_id: entity_id(id).ok_or_else(invalid)?,
                seller_id: user_id.to_string(),
            },
            (topic, _) if !topic.has_handler() => ResourceRef::Unhandled(topic),
            _ => return Err(invalid()),
        };
        Ok(parsed)
    }
}

/// Ids are interpolated into API paths and cache keys.
fn entity_id(raw: &str) -> Option<String> {
    let valid = !raw.is_empty()
        && raw.len() <= 64
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then(|| raw.to_string())
}

/// Canonical key for a refreshed entity.
pub fn entity_key(kind: &str, user_id: u64, id: &str) -> String {
    format!("ml:{kind}:{user_id}:{id}")
}

/// Aggregates a payload of this kind can make stale.
fn aggregate_keys(payload: &TopicPayload, user_id: u64) -> Vec<String> {
    match payload {
        TopicPayload::Order(_) => vec![
            format!("ml:orders:{user_id}:recent"),
            format!("ml:dashboard:{user_id}"),
        ],
        TopicPayload::Item(_) => vec![
            format!("ml:products:{user_id}:active"),
            format!("ml:products:{user_id}:all"),
        ],
        TopicPayload::Question(_) => vec![format!("ml:questions:{user_id}:unanswered")],
        TopicPayload::Messages(_) => vec![format!("ml:messages:{user_id}:unread")],
        TopicPayload::Unrecognized { .. } => Vec::new(),
    }
}

/// Dispatches notifications to the per-topic handlers.
#[derive(Clone)]
pub struct TopicProcessor {
    store: SharedStore,
    api: SharedMarketplace,
    entity_ttl: Duration,
}

impl TopicProcessor {
    pub fn new(store: SharedStore, api: SharedMarketplace, entity_ttl: Duration) -> Self {
        Self {
            store,
            api,
            entity_ttl,
        }
    }

    /// Cached access token for a tenant.
    ///
    /// # Errors
    ///
    /// `CredentialsUnavailable` when the tenant has no tokens or they expired.
    pub async fn access_token(&self, user_id: u64) -> AppResult<String> {
        let credentials: Option<StoredCredentials> = self
            .store
            .get_json(&StoredCredentials::cache_key(user_id))
            .await?;

        match credentials {
            Some(c) if !c.is_expired(Utc::now()) => Ok(c.access_token),
            Some(_) => {
                debug!(user_id, "Stored marketplace credentials expired");
                Err(AppError::CredentialsUnavailable(user_id))
            }
            None => Err(AppError::CredentialsUnavailable(user_id)),
        }
    }

    /// Handle one notification.
    #[instrument(skip(self))]
    pub async fn process(
        &self,
        user_id: u64,
        topic: Topic,
        resource: &str,
    ) -> AppResult<ProcessOutcome> {
        let target = ResourceRef::parse(topic, resource, user_id)?;
        let (key, payload) = self.fetch(user_id, &target).await?;

        match &payload {
            TopicPayload::Order(order) => self.store.set_json(&key, order, self.entity_ttl).await?,
            TopicPayload::Item(item) => self.store.set_json(&key, item, self.entity_ttl).await?,
            TopicPayload::Question(question) => {
                self.store.set_json(&key, question, self.entity_ttl).await?
            }
            TopicPayload::Messages(messages) => {
                self.store.set_json(&key, messages, self.entity_ttl).await?
            }
            TopicPayload::Unrecognized { .. } => {
                debug!(user_id, resource, "No handler for topic, ignoring");
                return Ok(ProcessOutcome::Ignored { topic });
            }
        }

        let invalidated = aggregate_keys(&payload, user_id);
        for aggregate in &invalidated {
            self.store.del(aggregate).await?;
        }

        info!(user_id, key = %key, "Refreshed marketplace entity");
        Ok(ProcessOutcome::Refreshed { key, invalidated })
    }

    /// Fetch the entity and its canonical key. Credentials are only looked up
    /// for topics that have a handler.
    async fn fetch(&self, user_id: u64, target: &ResourceRef) -> AppResult<(String, TopicPayload)> {
        let token = || self.access_token(user_id);

        Ok(match target {
            ResourceRef::Order(id) => (
                entity_key("order", user_id, id),
                TopicPayload::Order(self.api.get_order(&token().await?, id).await?),
            ),
            ResourceRef::Item(id) => (
                entity_key("item", user_id, id),
                TopicPayload::Item(self.api.get_item(&token().await?, id).await?),
            ),
            ResourceRef::Question(id) => (
                entity_key("question", user_id, id),
                TopicPayload::Question(self.api.get_question(&token().await?, id).await?),
            ),
            ResourceRef::Pack { pack_id, seller_id } => (
                entity_key("messages", user_id, pack_id),
                TopicPayload::Messages(
                    self.api
                        .get_pack_messages(&token().await?, pack_id, seller_id)
                        .await?,
                ),
            ),
            ResourceRef::Unhandled(topic) => (
                String::new(),
                TopicPayload::Unrecognized {
                    topic: topic.as_str().to_string(),
                },
            ),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::marketplace::{MarketplaceApi, MissedFeedsQuery};
    use crate::models::{Item, MissedFeedsPage, Order, PackMessages, Question};
    use crate::store::{CacheStore, MemoryStore};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::Arc;

    struct ItemsOnly;

    #[async_trait]
    impl MarketplaceApi for ItemsOnly {
        async fn get_order(&self, _: &str, id: &str) -> AppResult<Order> {
            Err(AppError::NotFound(id.to_string()))
        }

        async fn get_item(&self, token: &str, id: &str) -> AppResult<Item> {
            assert_eq!(token, "tok");
            Ok(Item {
                id: id.to_string(),
                title: "Mate".into(),
                price: Decimal::new(1999, 2),
                currency_id: "BRL".into(),
                available_quantity: 3,
                sold_quantity: 1,
                status: "active".into(),
                permalink: None,
                last_updated: None,
            })
        }

        async fn get_question(&self, _: &str, id: &str) -> AppResult<Question> {
            Err(AppError::NotFound(id.to_string()))
        }

        async fn get_pack_messages(&self, _: &str, id: &str, _: &str) -> AppResult<PackMessages> {
            Err(AppError::NotFound(id.to_string()))
        }

        async fn missed_feeds(
            &self,
            _: &str,
            _: &str,
            _: &MissedFeedsQuery,
        ) -> AppResult<MissedFeedsPage> {
            Err(AppError::NotFound("feeds".into()))
        }
    }

    async fn processor_with_token(expires_in: chrono::Duration) -> (TopicProcessor, SharedStore) {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let credentials = StoredCredentials {
            access_token: "tok".into(),
            expires_at: Utc::now() + expires_in,
            refresh_token: None,
        };
        store
            .set_json(
                &StoredCredentials::cache_key(5),
                &credentials,
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let processor = TopicProcessor::new(
            store.clone(),
            Arc::new(ItemsOnly),
            Duration::from_secs(3600),
        );
        (processor, store)
    }

    #[tokio::test]
    async fn test_item_refresh_writes_entity_and_drops_aggregates() {
        let (processor, store) = processor_with_token(chrono::Duration::hours(1)).await;
        store
            .set("ml:products:5:active", "[]", Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = processor
            .process(5, Topic::Items, "/items/MLB1")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::Refreshed {
                key: "ml:item:5:MLB1".into(),
                invalidated: vec![
                    "ml:products:5:active".into(),
                    "ml:products:5:all".into()
                ],
            }
        );
        let cached: Item = store.get_json("ml:item:5:MLB1").await.unwrap().unwrap();
        assert_eq!(cached.title, "Mate");
        assert!(store.get("ml:products:5:active").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_credentials_fail() {
        let (processor, _) = processor_with_token(chrono::Duration::hours(-1)).await;
        let err = processor
            .process(5, Topic::Items, "/items/MLB1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CredentialsUnavailable(5)));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail() {
        let (processor, _) = processor_with_token(chrono::Duration::hours(1)).await;
        let err = processor
            .process(6, Topic::Items, "/items/MLB1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CredentialsUnavailable(6)));
    }

    #[tokio::test]
    async fn test_shipments_ignored_without_credentials() {
        let (processor, _) = processor_with_token(chrono::Duration::hours(1)).await;
        let outcome = processor
            .process(99, Topic::Shipments, "/shipments/1")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Ignored {
                topic: Topic::Shipments
            }
        );
    }

    #[test]
    fn test_parse_order_and_item() {
        assert_eq!(
            ResourceRef::parse(Topic::OrdersV2, "/orders/2000001", 1).unwrap(),
            ResourceRef::Order("2000001".into())
        );
        assert_eq!(
            ResourceRef::parse(Topic::Items, "/items/MLB123?attributes=price", 1).unwrap(),
            ResourceRef::Item("MLB123".into())
        );
    }

    #[test]
    fn test_parse_messages_forms() {
        assert_eq!(
            ResourceRef::parse(Topic::Messages, "/messages/packs/77/sellers/42", 42).unwrap(),
            ResourceRef::Pack {
                pack_id: "77".into(),
                seller_id: "42".into()
            }
        );
        assert_eq!(
            ResourceRef::parse(Topic::Messages, "/messages/abc123", 42).unwrap(),
            ResourceRef::Pack {
                pack_id: "abc123".into(),
                seller_id: "42".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_mismatch_and_bad_ids() {
        assert!(ResourceRef::parse(Topic::Items, "/orders/1", 1).is_err());
        assert!(ResourceRef::parse(Topic::Questions, "/questions/", 1).is_err());
        assert!(ResourceRef::parse(Topic::Items, "/items/a%2Fb", 1).is_err());
        assert!(matches!(
            ResourceRef::parse(Topic::OrdersV2, "/orders/1/extra", 1),
            Err(AppError::InvalidResource(_))
        ));
    }

    #[test]
    fn test_unhandled_topics_parse_to_unhandled() {
        assert_eq!(
            ResourceRef::parse(Topic::Shipments, "/shipments/9", 1).unwrap(),
            ResourceRef::Unhandled(Topic::Shipments)
        );
    }

    #[test]
    fn test_aggregates_per_kind() {
        let keys = aggregate_keys(
            &TopicPayload::Unrecognized {
                topic: "payments".into(),
            },
            5,
        );
        assert!(keys.is_empty());
        assert_eq!(entity_key("item", 5, "MLB1"), "ml:item:5:MLB1");
    }
}
