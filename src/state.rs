//! Shared application state for Axum handlers.
//!
//! The state wires one store, one marketplace client and one security event
//! sink into every component that needs them:
//!
//! - **Ingestion**: webhook authenticator, deadline dispatcher, ingest pipeline
//! - **Recovery**: missed-feed replay over the same pipeline
//! - **Security**: named rate-limit policies and the event buffer
//!
//! # Structured Concurrency
//!
//! Abandoned webhook work, alert deliveries and the scheduled recovery sweep
//! all run on one `TaskTracker`. `shutdown()` cancels the sweep, then waits for
//! everything still in flight, so a deploy never cuts off a late write.

use std::sync::Arc;
use std::time::Instant;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::AppResult;
use crate::marketplace::{MercadoLibreClient, SharedMarketplace};
use crate::middleware::IpAllowlist;
use crate::security::{PolicyLimits, RateLimitPolicies, SecurityEventSink, WebhookAuthenticator};
use crate::services::{
    DeadlineDispatcher, IngestPipeline, ProcessedMarkerStore, RecoveryService, RecoverySettings,
    TopicProcessor,
};
use crate::store::{MemoryStore, RedisStore, SharedStore};

/// Shared application state for Axum handlers.
///
/// Cloned per request; every field is either `Arc`-backed or a cheap handle.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::connect(config).await?;
/// // ... serve ...
/// state.shutdown().await;  // waits for abandoned work and the sweep
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Key-value store for markers, entities and rate-limit windows
    pub store: SharedStore,
    /// Named sliding-window policies
    pub rate_limits: RateLimitPolicies,
    /// Webhook secret/signature and sender IP checks
    pub authenticator: Arc<WebhookAuthenticator>,
    /// Races processing against the response deadline
    pub dispatcher: DeadlineDispatcher,
    /// Marker-guarded topic processing
    pub pipeline: IngestPipeline,
    /// Missed-feed replay
    pub recovery: RecoveryService,
    /// Bounded audit trail with alert rules
    pub security_events: SecurityEventSink,
    /// Timestamp when the application started
    pub started_at: Instant,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the state from an already-connected store and marketplace client.
    ///
    /// Spawns the recovery sweep when `RECOVERY_SCHEDULE_INTERVAL_SECS` and
    /// `RECOVERY_SCHEDULED_TENANTS` are both set.
    pub fn new(config: Config, store: SharedStore, api: SharedMarketplace) -> Self {
        let config = Arc::new(config);
        let task_tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();

        let security_events = SecurityEventSink::new(
            config.security_event_buffer,
            config.security_alert_webhook_url.clone(),
            task_tracker.clone(),
        );
        let rate_limits = RateLimitPolicies::new(
            store.clone(),
            PolicyLimits::from_config(&config),
            IpAllowlist::new(&config.rate_limit_whitelist),
            security_events.clone(),
        );
        let authenticator = Arc::new(WebhookAuthenticator::new(
            config.webhook_secret.clone(),
            IpAllowlist::new(&config.allowed_sender_ips),
            config.enforce_ip_allowlist,
        ));

        let markers = ProcessedMarkerStore::new(store.clone(), config.processed_marker_ttl);
        let processor = TopicProcessor::new(store.clone(), api.clone(), config.entity_cache_ttl);
        let pipeline = IngestPipeline::new(markers, processor, security_events.clone());
        let recovery = RecoveryService::new(
            api,
            pipeline.clone(),
            store.clone(),
            security_events.clone(),
            RecoverySettings::from_config(&config),
        );
        let dispatcher = DeadlineDispatcher::new(config.processing_budget(), task_tracker.clone());

        let state = Self {
            config,
            store,
            rate_limits,
            authenticator,
            dispatcher,
            pipeline,
            recovery,
            security_events,
            started_at: Instant::now(),
            task_tracker,
            cancellation_token,
        };

        if state.config.recovery_scheduling_enabled() {
            state.spawn_recovery_sweep();
        }
        if !state.config.store_purge_interval.is_zero() {
            state.spawn_store_purge();
        }

        state
    }

    /// Connect the configured store (Redis when `REDIS_URL` is set, in-memory
    /// otherwise) and the marketplace client, then build the state.
    pub async fn connect(config: Config) -> AppResult<Self> {
        let store: SharedStore = match config.redis_url.as_deref() {
            Some(url) => Arc::new(
                RedisStore::connect(url, config.store_response_timeout, config.store_connect_timeout)
                    .await?,
            ),
            None => {
                info!("REDIS_URL not set, using the in-process store");
                Arc::new(MemoryStore::with_max_entries(config.memory_store_max_entries))
            }
        };
        let api: SharedMarketplace = Arc::new(MercadoLibreClient::new(&config)?);

        Ok(Self::new(config, store, api))
    }

    /// Periodic recovery over the configured tenants.
    ///
    /// The first tick is skipped so startup does not hit the listing API.
    fn spawn_recovery_sweep(&self) {
        let recovery = self.recovery.clone();
        let tenants = self.config.recovery_scheduled_tenants.clone();
        let period = self.config.recovery_schedule_interval;
        let cancel = self.cancellation_token.clone();

        info!(
            interval_secs = period.as_secs(),
            tenants = tenants.len(),
            "Scheduled missed-feed recovery enabled"
        );

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Recovery sweep received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        recovery.sweep(&tenants).await;
                    }
                }
            }

            debug!("Recovery sweep shutting down");
        });
    }

    /// Periodic purge of expired store entries. A no-op for Redis, which
    /// expires keys itself.
    fn spawn_store_purge(&self) {
        let store = self.store.clone();
        let period = self.config.store_purge_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = store.purge_expired();
                        if purged > 0 {
                            debug!(purged, backend = store.backend(), "Purged expired store entries");
                        }
                    }
                }
            }

            debug!("Store purge shutting down");
        });
    }

    /// Gracefully shutdown all background work.
    ///
    /// 1. Signals the sweep to stop via the cancellation token
    /// 2. Closes the task tracker
    /// 3. Waits for abandoned webhook work and pending alert deliveries
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
