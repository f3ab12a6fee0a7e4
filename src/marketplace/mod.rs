//! Client for the Mercado Libre REST API.
//!
//! Topic handlers and the recovery service talk to the marketplace through the
//! [`MarketplaceApi`] trait so tests can swap in a fake. The production
//! implementation, [`MercadoLibreClient`], adds:
//!
//! - **Operation Timeouts**: every call is bounded by `operation_timeout`
//! - **Circuit Breaker**: fail fast while the API is unhealthy
//! - **One Retry**: transport errors, timeouts, 5xx and 429 are retried once
//!   after a jittered exponential backoff
//! - **Observability**: per-operation latency and status metrics
//!
//! # Module Structure
//!
//! - `circuit_breaker` - Closed / Open / HalfOpen breaker
//! - `params` - Query types like `MissedFeedsQuery`

mod circuit_breaker;
mod params;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Item, MissedFeedsPage, Order, PackMessages, Question};

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use params::{DEFAULT_FEED_PAGE_SIZE, MissedFeedsQuery};

// =============================================================================
// Constants
// =============================================================================

/// Jitter percentage for retry backoff (±20%).
const BACKOFF_JITTER_PERCENT: f64 = 0.2;

/// Retries after the first attempt.
const MAX_RETRIES: u32 = 1;

/// Base delay before the first retry.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Floor for any retry delay.
const MIN_RETRY_DELAY_MS: u64 = 20;

/// Upstream error bodies are truncated to this many characters.
const MAX_ERROR_BODY_CHARS: usize = 200;

// =============================================================================
// MarketplaceApi
// =============================================================================

/// Marketplace operations used by the ingestion core.
///
/// Every call takes the tenant's access token.
#[async_trait]
pub trait MarketplaceApi: Send + Sync {
    async fn get_order(&self, access_token: &str, order_id: &str) -> AppResult<Order>;

    async fn get_item(&self, access_token: &str, item_id: &str) -> AppResult<Item>;

    async fn get_question(&self, access_token: &str, question_id: &str) -> AppResult<Question>;

    async fn get_pack_messages(
        &self,
        access_token: &str,
        pack_id: &str,
        seller_id: &str,
    ) -> AppResult<PackMessages>;

    /// One page of notifications the marketplace failed to deliver.
    async fn missed_feeds(
        &self,
        access_token: &str,
        app_id: &str,
        query: &MissedFeedsQuery,
    ) -> AppResult<MissedFeedsPage>;
}

pub type SharedMarketplace = Arc<dyn MarketplaceApi>;

// =============================================================================
// MercadoLibreClient
// =============================================================================

/// `reqwest`-backed [`MarketplaceApi`].
///
/// Cheap to clone; clones share the connection pool and circuit breaker.
#[derive(Clone)]
pub struct MercadoLibreClient {
    http: reqwest::Client,
    base_url: String,
    operation_timeout: Duration,
    retry_delay: Duration,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl MercadoLibreClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> AppResult<Self> {
        let breaker = CircuitBreakerConfig::new(
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_success_threshold,
            config.circuit_breaker_open_duration,
        );
        Self::with_settings(&config.ml_api_base_url, config.operation_timeout, breaker)
    }

    pub fn with_settings(
        base_url: &str,
        operation_timeout: Duration,
        breaker: CircuitBreakerConfig,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("meli-webhook-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            operation_timeout,
            retry_delay: DEFAULT_RETRY_DELAY,
            circuit_breaker: Arc::new(CircuitBreaker::new(breaker)),
        })
    }

    /// Override the base retry delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    /// Run `request` under the breaker with a timeout and at most one retry.
    ///
    /// Only transient errors count against the breaker; a 404 for a single
    /// entity says nothing about upstream health.
    async fn with_resilience<F, Fut, T>(&self, operation: &'static str, request: F) -> AppResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        if !self.circuit_breaker.allow_request() {
            return Err(AppError::CircuitOpen(format!(
                "Circuit breaker is {} - marketplace temporarily unavailable",
                self.circuit_breaker.state()
            )));
        }

        let mut attempt = 0;
        loop {
            let started = Instant::now();
            let result = match tokio::time::timeout(self.operation_timeout, request()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::OperationTimeout(format!(
                    "{operation} timed out after {:?}",
                    self.operation_timeout
                ))),
            };
            metrics::record_marketplace_request(
                operation,
                status_label(&result),
                started.elapsed().as_secs_f64(),
            );

            match result {
                Ok(value) => {
                    self.circuit_breaker.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    self.circuit_breaker.record_failure();
                    if attempt >= MAX_RETRIES || !self.circuit_breaker.allow_request() {
                        return Err(e);
                    }
                    attempt += 1;
                    let delay = backoff_delay(self.retry_delay, attempt);
                    warn!(
                        operation,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Marketplace call failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        access_token: &str,
        url: &str,
        query: &[(&'static str, String)],
    ) -> AppResult<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| AppError::MarketplaceTransport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!("Marketplace resource {url}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::MarketplaceStatus {
                status: status.as_u16(),
                message: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AppError::MarketplaceDecode(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        access_token: &str,
        path: String,
        query: Vec<(&'static str, String)>,
    ) -> AppResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(operation, url = %url, "Calling marketplace API");
        self.with_resilience(operation, || self.fetch(access_token, &url, &query))
            .await
    }
}

#[async_trait]
impl MarketplaceApi for MercadoLibreClient {
    #[instrument(skip(self, access_token))]
    async fn get_order(&self, access_token: &str, order_id: &str) -> AppResult<Order> {
        self.get("get_order", access_token, format!("/orders/{order_id}"), Vec::new())
            .await
    }

    #[instrument(skip(self, access_token))]
    async fn get_item(&self, access_token: &str, item_id: &str) -> AppResult<Item> {
        self.get("get_item", access_token, format!("/items/{item_id}"), Vec::new())
            .await
    }

    #[instrument(skip(self, access_token))]
    async fn get_question(&self, access_token: &str, question_id: &str) -> AppResult<Question> {
        self.get(
            "get_question",
            access_token,
            format!("/questions/{question_id}"),
            Vec::new(),
        )
        .await
    }

    #[instrument(skip(self, access_token))]
    async fn get_pack_messages(
        &self,
        access_token: &str,
        pack_id: &str,
        seller_id: &str,
    ) -> AppResult<PackMessages> {
        self.get(
            "get_pack_messages",
            access_token,
            format!("/messages/packs/{pack_id}/sellers/{seller_id}"),
            vec![
                ("tag", "post_sale".to_string()),
                ("mark_as_read", "false".to_string()),
            ],
        )
        .await
    }

    #[instrument(skip(self, access_token, query), fields(offset = query.offset, limit = query.limit))]
    async fn missed_feeds(
        &self,
        access_token: &str,
        app_id: &str,
        query: &MissedFeedsQuery,
    ) -> AppResult<MissedFeedsPage> {
        self.get(
            "missed_feeds",
            access_token,
            "/missed_feeds".to_string(),
            query.to_pairs(app_id),
        )
        .await
    }
}

fn status_label<T>(result: &AppResult<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}

/// Exponential backoff with ±[`BACKOFF_JITTER_PERCENT`] jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let jitter = (delay_ms as f64 * BACKOFF_JITTER_PERCENT * (rand_jitter() * 2.0 - 1.0)) as i64;
    let final_ms = (delay_ms as i64 + jitter).max(MIN_RETRY_DELAY_MS as i64) as u64;
    Duration::from_millis(final_ms)
}

/// Uniform value in `[0.0, 1.0)`.
fn rand_jitter() -> f64 {
    rand::rng().random::<f64>()
}
