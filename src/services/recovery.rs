//! Missed-feed recovery: pull-based reconciliation for webhook deliveries
//! the marketplace never got credit for.
//!
//! A run pages through the missed-feeds listing, filters each page by topic,
//! age and tenant, and replays retained feeds through the same
//! [`IngestPipeline`] the webhook uses, so completed markers from either path
//! short-circuit the other. Pages are handled strictly in order with a small
//! politeness delay in between, and a run never fetches more than
//! `max_pages` pages even if the listing keeps reporting more.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::marketplace::{MissedFeedsQuery, SharedMarketplace};
use crate::metrics;
use crate::models::{MissedFeed, RecoveryRequest, RecoveryResult, Topic};
use crate::security::{SecurityEvent, SecurityEventSink, SecurityEventType};
use crate::store::{JsonStoreExt, SharedStore};

use super::ingest::{IngestOutcome, IngestPipeline};

/// How long the last run summary is kept.
const LAST_RESULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Static knobs for recovery runs.
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub app_id: Option<String>,
    pub batch_size: u32,
    pub batch_delay: Duration,
    pub max_pages: u32,
    pub default_max_age_hours: u32,
}

impl RecoverySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            app_id: config.ml_app_id.clone(),
            batch_size: config.recovery_batch_size,
            batch_delay: config.recovery_batch_delay,
            max_pages: config.recovery_max_pages,
            default_max_age_hours: config.recovery_default_max_age_hours,
        }
    }
}

#[derive(Debug, Default)]
struct Tally {
    processed: u32,
    failed: u32,
    skipped: u32,
    filtered: u32,
}

/// Why a feed was dropped before processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedFilter {
    OtherTenant,
    UnknownTopic,
    TopicNotRequested,
    TooOld,
}

#[derive(Clone)]
pub struct RecoveryService {
    api: SharedMarketplace,
    pipeline: IngestPipeline,
    store: SharedStore,
    events: SecurityEventSink,
    settings: Arc<RecoverySettings>,
}

impl RecoveryService {
    pub fn new(
        api: SharedMarketplace,
        pipeline: IngestPipeline,
        store: SharedStore,
        events: SecurityEventSink,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            api,
            pipeline,
            store,
            events,
            settings: Arc::new(settings),
        }
    }

    pub fn last_result_key(tenant_id: u64) -> String {
        format!("ml_recovery:last:{tenant_id}")
    }

    /// Replay every missed feed for `tenant_id`.
    ///
    /// Individual feed failures are counted, never fatal. The run itself
    /// fails only when it cannot start: no application id, no usable
    /// credentials, or the first page cannot be listed. Those failures are
    /// also raised as `recovery_failure` security events.
    #[instrument(skip(self, options), fields(dry_run = options.dry_run))]
    pub async fn recover_all_missed_feeds(
        &self,
        tenant_id: u64,
        options: &RecoveryRequest,
    ) -> AppResult<RecoveryResult> {
        let started = Instant::now();
        let result = self.run(tenant_id, options, started).await;
        metrics::record_recovery_duration(started.elapsed().as_secs_f64());

        match &result {
            Ok(summary) => {
                metrics::record_recovery_run(if summary.truncated {
                    "truncated"
                } else {
                    "completed"
                });
                if !summary.dry_run {
                    metrics::record_recovery_feeds("processed", u64::from(summary.processed));
                    metrics::record_recovery_feeds("failed", u64::from(summary.failed));
                    metrics::record_recovery_feeds("skipped", u64::from(summary.skipped));
                }
                metrics::record_recovery_feeds("filtered", u64::from(summary.filtered));

                if let Err(e) = self
                    .store
                    .set_json(&Self::last_result_key(tenant_id), summary, LAST_RESULT_TTL)
                    .await
                {
                    warn!(tenant_id, error = %e, "Failed to persist recovery summary");
                }
            }
            Err(e) => {
                metrics::record_recovery_run("failed");
                error!(tenant_id, error = %e, "Missed-feed recovery failed");
                self.report_failure(tenant_id, e, 0);
            }
        }

        result
    }

    /// Summary of the most recent run for `tenant_id`, if still retained.
    pub async fn last_result(&self, tenant_id: u64) -> AppResult<Option<RecoveryResult>> {
        self.store.get_json(&Self::last_result_key(tenant_id)).await
    }

    /// One scheduled pass over `tenants` with default options. Failures are
    /// logged and reported by [`Self::recover_all_missed_feeds`].
    pub async fn sweep(&self, tenants: &[u64]) {
        let options = RecoveryRequest::default();
        for &tenant_id in tenants {
            if let Ok(summary) = self.recover_all_missed_feeds(tenant_id, &options).await {
                info!(
                    tenant_id,
                    processed = summary.processed,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    "Scheduled recovery finished"
                );
            }
        }
    }

    async fn run(
        &self,
        tenant_id: u64,
        options: &RecoveryRequest,
        started: Instant,
    ) -> AppResult<RecoveryResult> {
        let run_id = Uuid::new_v4();
        let app_id = self
            .settings
            .app_id
            .as_deref()
            .ok_or_else(|| AppError::ConfigError("ML_APP_ID is not configured".to_string()))?;
        let token = self.pipeline.processor().access_token(tenant_id).await?;

        let topics: Option<&[Topic]> = options.topics.as_deref().filter(|t| !t.is_empty());
        let max_age_hours = options
            .max_age_hours
            .unwrap_or(self.settings.default_max_age_hours);
        let now = Utc::now();
        let cutoff = (max_age_hours > 0).then(|| now - chrono::Duration::hours(i64::from(max_age_hours)));

        let mut query = MissedFeedsQuery::new(self.settings.batch_size);
        if let Some([only]) = topics {
            query = query.with_topic(*only);
        }

        info!(
            tenant_id,
            run_id = %run_id,
            max_age_hours,
            "Starting missed-feed recovery"
        );

        let mut tally = Tally::default();
        let mut pages: u32 = 0;
        let mut offset: u64 = 0;
        let mut truncated = false;

        loop {
            if pages >= self.settings.max_pages {
                warn!(
                    tenant_id,
                    pages,
                    offset,
                    "Recovery page cap reached, stopping before the listing is exhausted"
                );
                truncated = true;
                break;
            }

            let page_query = query.clone().with_offset(offset);
            let page = match self.api.missed_feeds(&token, app_id, &page_query).await {
                Ok(page) => page,
                Err(e) if pages == 0 => return Err(e),
                Err(e) => {
                    warn!(tenant_id, pages, error = %e, "Listing failed mid-run, keeping partial result");
                    self.report_failure(tenant_id, &e, pages);
                    truncated = true;
                    break;
                }
            };
            pages += 1;

            for feed in &page.feeds {
                if let Err(reason) = retain(feed, tenant_id, topics, cutoff) {
                    debug!(resource = %feed.resource, reason = ?reason, "Feed filtered");
                    tally.filtered += 1;
                    continue;
                }
                self.replay(feed, options.dry_run, &mut tally).await;
            }

            let fetched = page.feeds.len() as u64;
            offset += fetched;
            if fetched == 0 || offset >= page.paging.total {
                break;
            }

            sleep(self.settings.batch_delay).await;
        }

        let summary = RecoveryResult {
            tenant_id,
            run_id,
            dry_run: options.dry_run,
            processed: tally.processed,
            failed: tally.failed,
            skipped: tally.skipped,
            total: tally.processed + tally.failed + tally.skipped,
            filtered: tally.filtered,
            pages,
            truncated,
            duration_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        };

        info!(
            tenant_id,
            run_id = %run_id,
            processed = summary.processed,
            failed = summary.failed,
            skipped = summary.skipped,
            filtered = summary.filtered,
            pages,
            truncated,
            "Missed-feed recovery finished"
        );

        Ok(summary)
    }

    async fn replay(&self, feed: &MissedFeed, dry_run: bool, tally: &mut Tally) {
        let Some(notification) = feed.to_notification(Utc::now()) else {
            tally.filtered += 1;
            return;
        };

        if dry_run {
            let id = notification.notification_id();
            match self.pipeline.markers().is_completed(&id).await {
                Ok(true) => tally.skipped += 1,
                Ok(false) => tally.processed += 1,
                Err(e) => {
                    warn!(notification_id = %id, error = %e, "Marker lookup failed during dry run");
                    tally.processed += 1;
                }
            }
            return;
        }

        match self.pipeline.handle(&notification).await {
            IngestOutcome::Processed { .. } => tally.processed += 1,
            IngestOutcome::Duplicate { .. } => tally.skipped += 1,
            IngestOutcome::Failed { .. } => tally.failed += 1,
        }
    }

    fn report_failure(&self, tenant_id: u64, error: &AppError, pages: u32) {
        self.events.log_event(
            SecurityEvent::new(SecurityEventType::RecoveryFailure)
                .with_user(tenant_id)
                .with_detail("error_kind", error.kind())
                .with_detail("error", error.to_string())
                .with_detail("pages_completed", pages),
        );
    }
}

fn retain(
    feed: &MissedFeed,
    tenant_id: u64,
    topics: Option<&[Topic]>,
    cutoff: Option<chrono::DateTime<Utc>>,
) -> Result<(), FeedFilter> {
    if feed.user_id != tenant_id {
        return Err(FeedFilter::OtherTenant);
    }
    let topic = feed.parsed_topic().ok_or(FeedFilter::UnknownTopic)?;
    if let Some(topics) = topics
        && !topics.contains(&topic)
    {
        return Err(FeedFilter::TopicNotRequested);
    }
    if let Some(cutoff) = cutoff
        && feed.sent < cutoff
    {
        return Err(FeedFilter::TooOld);
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn feed(user_id: u64, topic: &str, age_hours: i64) -> MissedFeed {
        MissedFeed {
            id: None,
            resource: "/items/MLB1".to_string(),
            user_id,
            topic: topic.to_string(),
            application_id: "app".to_string(),
            attempts: 1,
            sent: Utc::now() - chrono::Duration::hours(age_hours),
            received: None,
        }
    }

    #[test]
    fn test_retain_filters() {
        let cutoff = Some(Utc::now() - chrono::Duration::hours(48));
        let items = [Topic::Items];

        assert_eq!(retain(&feed(1, "items", 1), 1, Some(&items), cutoff), Ok(()));
        assert_eq!(
            retain(&feed(2, "items", 1), 1, None, cutoff),
            Err(FeedFilter::OtherTenant)
        );
        assert_eq!(
            retain(&feed(1, "claims", 1), 1, None, cutoff),
            Err(FeedFilter::UnknownTopic)
        );
        assert_eq!(
            retain(&feed(1, "questions", 1), 1, Some(&items), cutoff),
            Err(FeedFilter::TopicNotRequested)
        );
        assert_eq!(
            retain(&feed(1, "items", 72), 1, None, cutoff),
            Err(FeedFilter::TooOld)
        );
        assert_eq!(retain(&feed(1, "items", 72), 1, None, None), Ok(()));
    }

    #[test]
    fn test_last_result_key() {
        assert_eq!(RecoveryService::last_result_key(9), "ml_recovery:last:9");
    }
}
