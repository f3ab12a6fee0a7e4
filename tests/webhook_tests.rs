//! End-to-end tests for the webhook route, driven through the router with
//! `tower::ServiceExt::oneshot` against the in-process store.
//!
//! Run with: `cargo test --test webhook_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use chrono::Utc;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{
    ADMIN_KEY, FakeMarketplace, SECRET, TENANT, app_with, app_with_store, notification_body,
    test_config,
};
use meli_webhook_gateway::error::AppResult;
use meli_webhook_gateway::models::Item;
use meli_webhook_gateway::security::{SECRET_HEADER, SIGNATURE_HEADER, sign};
use meli_webhook_gateway::services::entity_key;
use meli_webhook_gateway::store::{CacheStore, JsonStoreExt, MemoryStore};

const PATH: &str = "/webhooks/mercadolibre";

fn post() -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(PATH)
        .header(header::CONTENT_TYPE, "application/json")
}

fn with_secret(body: Vec<u8>, secret: &str) -> Request<Body> {
    post()
        .header(SECRET_HEADER, secret)
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// =============================================================================
// Acceptance
// =============================================================================

#[tokio::test]
async fn test_valid_secret_processes_notification() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;
    let body = notification_body(TENANT, "/items/123", Utc::now());

    let response = app
        .router
        .clone()
        .oneshot(with_secret(body, SECRET))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["received"], true);
    assert_eq!(json["success"], true);
    assert_eq!(json["topic"], "items");
    assert!(json["notification_id"].is_string());
    assert!(json.get("timeout").is_none());

    let cached: Option<Item> = app
        .store
        .get_json(&entity_key("item", TENANT, "123"))
        .await
        .unwrap();
    assert_eq!(cached.unwrap().id, "123");
}

#[tokio::test]
async fn test_signature_without_secret_header_is_accepted() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;
    let body = notification_body(TENANT, "/items/124", Utc::now());
    let signature = sign(SECRET, &body);

    let request = post()
        .header(SIGNATURE_HEADER, signature)
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_duplicate_delivery_short_circuits() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;
    let body = notification_body(TENANT, "/items/125", Utc::now());

    let first = app
        .router
        .clone()
        .oneshot(with_secret(body.clone(), SECRET))
        .await
        .unwrap();
    let first = json_body(first).await;
    let second = app
        .router
        .clone()
        .oneshot(with_secret(body, SECRET))
        .await
        .unwrap();
    let second = json_body(second).await;

    assert!(first.get("duplicate").is_none());
    assert_eq!(second["duplicate"], true);
    assert_eq!(second["notification_id"], first["notification_id"]);
    assert_eq!(app.api.item_calls(), 1);
}

#[tokio::test]
async fn test_processing_failure_still_answers_200() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;
    let body = notification_body(TENANT, "/items/BROKEN1", Utc::now());

    let response = app
        .router
        .clone()
        .oneshot(with_secret(body, SECRET))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["received"], true);
    assert_eq!(json["success"], false);
    assert_eq!(json["error"], "marketplace_status");

    let counts = app.state.security_events.counts_by_type();
    assert_eq!(counts.get("processing_failure"), Some(&1));
}

#[tokio::test]
async fn test_unknown_tenant_still_answers_200() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;
    let body = notification_body(999, "/items/126", Utc::now());

    let response = app
        .router
        .clone()
        .oneshot(with_secret(body, SECRET))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["error"], "credentials_unavailable");
    assert_eq!(app.api.item_calls(), 0);
}

// =============================================================================
// Deadline
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_processing_answers_before_deadline() {
    let app = app_with(
        test_config(),
        FakeMarketplace::with_item_delay(Duration::from_secs(2)),
    )
    .await;
    let body = notification_body(TENANT, "/items/127", Utc::now());

    let response = app
        .router
        .clone()
        .oneshot(with_secret(body, SECRET))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["received"], true);
    assert_eq!(json["timeout"], true);
    let ms = json["processing_time_ms"].as_u64().unwrap();
    assert!((475..500).contains(&ms), "answered after {ms}ms");

    // Abandoned work keeps running and lands in the store
    app.state.shutdown().await;
    let cached: Option<Item> = app
        .store
        .get_json(&entity_key("item", TENANT, "127"))
        .await
        .unwrap();
    assert!(cached.is_some());
}

/// Store whose reads hang for seconds, as a wedged Redis would.
struct StalledReads {
    inner: MemoryStore,
}

#[async_trait]
impl CacheStore for StalledReads {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        self.inner.set(key, value, ttl).await
    }
    async fn del(&self, key: &str) -> AppResult<()> {
        self.inner.del(key).await
    }
    async fn keys(&self, pattern: &str) -> AppResult<Vec<String>> {
        self.inner.keys(pattern).await
    }
    fn backend(&self) -> &'static str {
        "stalled"
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_store_still_answers_before_deadline() {
    let store = Arc::new(StalledReads {
        inner: MemoryStore::new(),
    });
    let app = app_with_store(test_config(), FakeMarketplace::default(), store).await;
    let body = notification_body(TENANT, "/items/128", Utc::now());

    let started = tokio::time::Instant::now();
    let response = app
        .router
        .clone()
        .oneshot(with_secret(body, SECRET))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(elapsed < Duration::from_millis(500), "answered after {elapsed:?}");
    let json = json_body(response).await;
    assert_eq!(json["received"], true);
    assert_eq!(json["timeout"], true);
}

// =============================================================================
// Rejections
// =============================================================================

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;
    let body = notification_body(TENANT, "/items/123", Utc::now());

    let response = app
        .router
        .clone()
        .oneshot(with_secret(body, "not-the-secret"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await, json!({ "error": "Unauthorized" }));
    assert_eq!(app.api.item_calls(), 0);

    let counts = app.state.security_events.counts_by_type();
    assert_eq!(counts.get("webhook_auth_failed"), Some(&1));
}

#[tokio::test]
async fn test_missing_credentials_are_rejected() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;
    let body = notification_body(TENANT, "/items/123", Utc::now());

    let request = post().body(Body::from(body)).unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_disallowed_ip_is_forbidden_even_when_signed() {
    let config = meli_webhook_gateway::Config {
        enforce_ip_allowlist: true,
        ..test_config()
    };
    let app = app_with(config, FakeMarketplace::default()).await;
    let body = notification_body(TENANT, "/items/123", Utc::now());
    let signature = sign(SECRET, &body);

    let request = post()
        .header(SIGNATURE_HEADER, signature)
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        json_body(response).await,
        json!({ "error": "Unauthorized IP", "ml_compliance": "ip_validation_failed" })
    );
    let counts = app.state.security_events.counts_by_type();
    assert_eq!(counts.get("webhook_ip_rejected"), Some(&1));
}

#[tokio::test]
async fn test_allowlisted_ip_passes_enforcement() {
    let config = meli_webhook_gateway::Config {
        enforce_ip_allowlist: true,
        ..test_config()
    };
    let app = app_with(config, FakeMarketplace::default()).await;
    let body = notification_body(TENANT, "/items/128", Utc::now());

    let request = post()
        .header(SECRET_HEADER, SECRET)
        .header("x-forwarded-for", "54.88.218.97, 10.0.0.1")
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_malformed_bodies_are_rejected() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;

    let not_json = b"user_id=1&topic=items".to_vec();
    let response = app
        .router
        .clone()
        .oneshot(with_secret(not_json, SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await,
        json!({ "error": "Invalid JSON payload" })
    );

    let missing_topic = serde_json::to_vec(&json!({
        "user_id": TENANT,
        "resource": "/items/1",
        "application_id": common::APP_ID,
        "attempts": 1,
        "sent": Utc::now().to_rfc3339(),
        "received": Utc::now().to_rfc3339(),
    }))
    .unwrap();
    let response = app
        .router
        .clone()
        .oneshot(with_secret(missing_topic, SECRET))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await,
        json!({ "error": "Invalid payload schema" })
    );
}

#[tokio::test]
async fn test_throttled_sender_gets_retry_after() {
    let config = meli_webhook_gateway::Config {
        webhook_rate_limit_max: 1,
        ..test_config()
    };
    let app = app_with(config, FakeMarketplace::default()).await;

    let first = app
        .router
        .clone()
        .oneshot(with_secret(
            notification_body(TENANT, "/items/130", Utc::now()),
            SECRET,
        ))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .router
        .clone()
        .oneshot(with_secret(
            notification_body(TENANT, "/items/131", Utc::now()),
            SECRET,
        ))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key(header::RETRY_AFTER));
    assert_eq!(json_body(second).await["error"], "Rate limit exceeded");
    assert_eq!(app.api.item_calls(), 1);
}

// =============================================================================
// Descriptor, health and admin surface
// =============================================================================

#[tokio::test]
async fn test_status_descriptor() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;

    let request = Request::builder().uri(PATH).body(Body::empty()).unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let json = json_body(response).await;
    assert_eq!(json["status"], "active");
    assert_eq!(json["timeout_ms"], 500);
    assert_eq!(json["deadline_buffer_ms"], 25);
    assert_eq!(json["supported_topics"].as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn test_health_and_readiness() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["store"], "memory");

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_security_events_require_api_key() {
    let app = app_with(test_config(), FakeMarketplace::default()).await;
    app.router
        .clone()
        .oneshot(with_secret(
            notification_body(TENANT, "/items/1", Utc::now()),
            "wrong",
        ))
        .await
        .unwrap();

    let anonymous = Request::builder()
        .uri("/admin/security/events")
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(anonymous).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let authorized = Request::builder()
        .uri("/admin/security/events?limit=10")
        .header("x-api-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(authorized).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = json_body(response).await;
    let events = json["events"].as_array().unwrap();
    // Newest first: the admin failure above precedes the listing
    assert_eq!(events[0]["type"], "admin_auth_failed");
    assert_eq!(events[1]["type"], "webhook_auth_failed");
    assert_eq!(json["counts"]["webhook_auth_failed"], 1);
}

#[tokio::test]
async fn test_admin_routes_absent_without_key() {
    let config = meli_webhook_gateway::Config {
        admin_api_key: None,
        ..test_config()
    };
    let app = app_with(config, FakeMarketplace::default()).await;

    let request = Request::builder()
        .uri("/admin/security/events")
        .header("x-api-key", ADMIN_KEY)
        .body(Body::empty())
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
