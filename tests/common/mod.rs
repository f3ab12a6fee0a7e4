//! Shared fixtures: an in-process store, a scripted marketplace and a router.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::json;

use meli_webhook_gateway::error::{AppError, AppResult};
use meli_webhook_gateway::marketplace::{MarketplaceApi, MissedFeedsQuery};
use meli_webhook_gateway::models::{
    Item, MissedFeed, MissedFeedsPage, Order, PackMessages, Paging, Question, StoredCredentials,
};
use meli_webhook_gateway::store::{JsonStoreExt, MemoryStore, SharedStore};
use meli_webhook_gateway::{AppState, Config, build_router};

pub const SECRET: &str = "test-webhook-secret";
pub const APP_ID: &str = "app123";
pub const ADMIN_KEY: &str = "admin-key";
pub const TENANT: u64 = 123;

/// Marketplace double. Items resolve after `item_delay`; the missed-feeds
/// listing serves `pages` in order and then empty pages.
#[derive(Default)]
pub struct FakeMarketplace {
    pub item_delay: Duration,
    pub item_calls: AtomicUsize,
    pub listing_calls: AtomicUsize,
    pub pages: Mutex<VecDeque<AppResult<MissedFeedsPage>>>,
    pub listing_queries: Mutex<Vec<MissedFeedsQuery>>,
}

impl FakeMarketplace {
    pub fn with_item_delay(delay: Duration) -> Self {
        Self {
            item_delay: delay,
            ..Self::default()
        }
    }

    pub fn with_pages(pages: Vec<AppResult<MissedFeedsPage>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            ..Self::default()
        }
    }

    pub fn item_calls(&self) -> usize {
        self.item_calls.load(Ordering::SeqCst)
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketplaceApi for FakeMarketplace {
    async fn get_order(&self, _: &str, order_id: &str) -> AppResult<Order> {
        Err(AppError::NotFound(format!("order {order_id}")))
    }

    async fn get_item(&self, _: &str, item_id: &str) -> AppResult<Item> {
        self.item_calls.fetch_add(1, Ordering::SeqCst);
        if !self.item_delay.is_zero() {
            tokio::time::sleep(self.item_delay).await;
        }
        if item_id.starts_with("BROKEN") {
            return Err(AppError::MarketplaceStatus {
                status: 500,
                message: "upstream exploded".to_string(),
            });
        }
        Ok(Item {
            id: item_id.to_string(),
            title: "Cuia de porongo".to_string(),
            price: Decimal::new(4990, 2),
            currency_id: "BRL".to_string(),
            available_quantity: 7,
            sold_quantity: 2,
            status: "active".to_string(),
            permalink: None,
            last_updated: None,
        })
    }

    async fn get_question(&self, _: &str, question_id: &str) -> AppResult<Question> {
        Err(AppError::NotFound(format!("question {question_id}")))
    }

    async fn get_pack_messages(&self, _: &str, pack_id: &str, _: &str) -> AppResult<PackMessages> {
        Err(AppError::NotFound(format!("pack {pack_id}")))
    }

    async fn missed_feeds(
        &self,
        _: &str,
        _: &str,
        query: &MissedFeedsQuery,
    ) -> AppResult<MissedFeedsPage> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        self.listing_queries.lock().push(query.clone());
        self.pages.lock().pop_front().unwrap_or_else(|| {
            Ok(MissedFeedsPage {
                feeds: Vec::new(),
                paging: Paging::default(),
            })
        })
    }
}

pub fn test_config() -> Config {
    Config {
        webhook_secret: Some(SECRET.to_string()),
        ml_app_id: Some(APP_ID.to_string()),
        admin_api_key: Some(ADMIN_KEY.to_string()),
        recovery_batch_delay: Duration::ZERO,
        metrics_port: 0,
        ..Config::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: SharedStore,
    pub api: Arc<FakeMarketplace>,
}

pub async fn app_with(config: Config, api: FakeMarketplace) -> TestApp {
    app_with_store(config, api, Arc::new(MemoryStore::new())).await
}

pub async fn app_with_store(config: Config, api: FakeMarketplace, store: SharedStore) -> TestApp {
    store_credentials(&store, TENANT).await;
    let api = Arc::new(api);
    let state = AppState::new(config, store.clone(), api.clone());
    TestApp {
        router: build_router(state.clone()),
        state,
        store,
        api,
    }
}

pub async fn store_credentials(store: &SharedStore, user_id: u64) {
    let credentials = StoredCredentials {
        access_token: "APP_USR-token".to_string(),
        expires_at: Utc::now() + chrono::Duration::hours(6),
        refresh_token: None,
    };
    store
        .set_json(
            &StoredCredentials::cache_key(user_id),
            &credentials,
            Duration::from_secs(6 * 3600),
        )
        .await
        .expect("credentials should be stored");
}

pub fn notification_body(user_id: u64, resource: &str, sent: DateTime<Utc>) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "user_id": user_id,
        "topic": "items",
        "resource": resource,
        "application_id": APP_ID,
        "attempts": 1,
        "sent": sent.to_rfc3339(),
        "received": sent.to_rfc3339(),
    }))
    .expect("body should serialize")
}

pub fn missed_feed(user_id: u64, topic: &str, resource: &str, age: chrono::Duration) -> MissedFeed {
    MissedFeed {
        id: None,
        resource: resource.to_string(),
        user_id,
        topic: topic.to_string(),
        application_id: APP_ID.to_string(),
        attempts: 3,
        sent: Utc::now() - age,
        received: None,
    }
}

pub fn page(feeds: Vec<MissedFeed>, total: u64) -> AppResult<MissedFeedsPage> {
    Ok(MissedFeedsPage {
        feeds,
        paging: Paging {
            total,
            offset: 0,
            limit: 50,
        },
    })
}
