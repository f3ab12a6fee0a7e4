//! # Mercado Livre Webhook Gateway
//!
//! Deadline-bound ingestion of Mercado Livre marketplace notifications,
//! featuring:
//!
//! - **Deadline compliance**: every accepted delivery is answered inside the
//!   sender's hard timeout; slow processing is abandoned, not cancelled
//! - **Idempotency**: processed markers keyed by a derived notification id
//!   dedupe retries, duplicate pushes and recovery replays
//! - **Recovery**: paged replay of the marketplace's missed-feeds listing
//! - **Security**: HMAC or shared-secret auth, sender IP allowlist, sliding
//!   window rate limits, audit events with alert rules
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Webhook: rate limit → auth → parse → deadline dispatch     │
//! │  Admin:   rate limit layer → API key layer → handlers       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  IngestPipeline (markers → TopicProcessor)  RecoveryService │
//! ├─────────────────────────────────────────────────────────────┤
//! │  MercadoLibreClient (timeout, retry, circuit breaker)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CacheStore (Redis or in-process)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meli_webhook_gateway::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::connect(config).await?;
//!     let app = build_router(state.clone());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! ```bash
//! ML_WEBHOOK_SECRET=shared-secret ML_APP_ID=123456 ADMIN_API_KEY=admin-key cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod marketplace;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod security;
pub mod services;
pub mod state;
pub mod store;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use marketplace::{MarketplaceApi, MercadoLibreClient};
pub use routes::build_router;
pub use state::AppState;
pub use store::{CacheStore, MemoryStore, RedisStore};
