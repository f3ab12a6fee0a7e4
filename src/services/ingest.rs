//! Idempotent processing of one notification.
//!
//! Shared by the webhook handler (inside the deadline dispatcher) and the
//! recovery service. The marker check short-circuits re-deliveries before the
//! topic processor runs. Marker writes are best effort: a store hiccup is
//! logged and the notification is still processed, since handlers are
//! idempotent and recovery backfills anything that slips through.

use tracing::{error, instrument, warn};

use crate::error::AppError;
use crate::models::{NotificationId, WebhookNotification};
use crate::security::{SecurityEvent, SecurityEventSink, SecurityEventType};

use super::markers::ProcessedMarkerStore;
use super::processor::{ProcessOutcome, TopicProcessor};

/// Result of [`IngestPipeline::handle`].
#[derive(Debug)]
pub enum IngestOutcome {
    Processed {
        id: NotificationId,
        outcome: ProcessOutcome,
    },
    /// A `completed` marker already exists.
    Duplicate { id: NotificationId },
    Failed {
        id: NotificationId,
        error: AppError,
    },
}

impl IngestOutcome {
    pub fn notification_id(&self) -> &NotificationId {
        match self {
            IngestOutcome::Processed { id, .. }
            | IngestOutcome::Duplicate { id }
            | IngestOutcome::Failed { id, .. } => id,
        }
    }

    /// Label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Processed {
                outcome: ProcessOutcome::Ignored { .. },
                ..
            } => "ignored",
            IngestOutcome::Processed { .. } => "processed",
            IngestOutcome::Duplicate { .. } => "duplicate",
            IngestOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Clone)]
pub struct IngestPipeline {
    markers: ProcessedMarkerStore,
    processor: TopicProcessor,
    events: SecurityEventSink,
}

impl IngestPipeline {
    pub fn new(
        markers: ProcessedMarkerStore,
        processor: TopicProcessor,
        events: SecurityEventSink,
    ) -> Self {
        Self {
            markers,
            processor,
            events,
        }
    }

    pub fn markers(&self) -> &ProcessedMarkerStore {
        &self.markers
    }

    pub fn processor(&self) -> &TopicProcessor {
        &self.processor
    }

    /// Check the marker, process, and record the outcome. Never returns an
    /// error: failures come back as [`IngestOutcome::Failed`] and are raised
    /// as `processing_failure` security events.
    #[instrument(
        skip(self, notification),
        fields(user_id = notification.user_id, topic = %notification.topic)
    )]
    pub async fn handle(&self, notification: &WebhookNotification) -> IngestOutcome {
        let id = notification.notification_id();
        let topic = notification.topic;
        let resource = notification.resource.as_str();
        let attempts = notification.attempts;

        match self.markers.is_completed(&id).await {
            Ok(true) => return IngestOutcome::Duplicate { id },
            Ok(false) => {}
            Err(e) => warn!(notification_id = %id, error = %e, "Marker lookup failed, processing anyway"),
        }

        if let Err(e) = self
            .markers
            .mark_pending(&id, topic, resource, attempts)
            .await
        {
            warn!(notification_id = %id, error = %e, "Failed to write pending marker");
        }

        match self
            .processor
            .process(notification.user_id, topic, resource)
            .await
        {
            Ok(outcome) => {
                if let Err(e) = self
                    .markers
                    .mark_completed(&id, topic, resource, attempts)
                    .await
                {
                    warn!(notification_id = %id, error = %e, "Failed to write completed marker");
                }
                IngestOutcome::Processed { id, outcome }
            }
            Err(error) => {
                error!(
                    notification_id = %id,
                    resource,
                    error = %error,
                    "Notification processing failed"
                );
                if let Err(e) = self
                    .markers
                    .mark_failed(&id, topic, resource, attempts, &error.to_string())
                    .await
                {
                    warn!(notification_id = %id, error = %e, "Failed to write failed marker");
                }
                self.events.log_event(
                    SecurityEvent::new(SecurityEventType::ProcessingFailure)
                        .with_user(notification.user_id)
                        .with_detail("notification_id", id.as_str())
                        .with_detail("topic", topic.as_str())
                        .with_detail("resource", resource)
                        .with_detail("error_kind", error.kind()),
                );
                IngestOutcome::Failed { id, error }
            }
        }
    }
}
