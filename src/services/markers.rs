//! Processed markers: idempotency records keyed by notification id.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppResult;
use crate::models::{NotificationId, Topic};
use crate::store::{JsonStoreExt, SharedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerStatus {
    /// Claimed, handler not finished. Records written as `processing` read
    /// back as this.
    #[serde(alias = "processing")]
    Pending,
    Completed,
    Failed,
}

/// Outcome record for one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMarker {
    pub status: MarkerStatus,
    pub processed_at: DateTime<Utc>,
    pub topic: Topic,
    pub resource: String,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Marker access over the shared store at `ml_processed:{id}`.
#[derive(Clone)]
pub struct ProcessedMarkerStore {
    store: SharedStore,
    ttl: Duration,
}

impl ProcessedMarkerStore {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn key(id: &NotificationId) -> String {
        format!("ml_processed:{id}")
    }

    pub async fn get(&self, id: &NotificationId) -> AppResult<Option<ProcessedMarker>> {
        self.store.get_json(&Self::key(id)).await
    }

    /// Whether the notification already finished successfully.
    pub async fn is_completed(&self, id: &NotificationId) -> AppResult<bool> {
        Ok(self
            .get(id)
            .await?
            .is_some_and(|m| m.status == MarkerStatus::Completed))
    }

    pub async fn mark_pending(
        &self,
        id: &NotificationId,
        topic: Topic,
        resource: &str,
        attempts: u32,
    ) -> AppResult<()> {
        self.write(id, MarkerStatus::Pending, topic, resource, attempts, None)
            .await
    }

    pub async fn mark_completed(
        &self,
        id: &NotificationId,
        topic: Topic,
        resource: &str,
        attempts: u32,
    ) -> AppResult<()> {
        self.write(id, MarkerStatus::Completed, topic, resource, attempts, None)
            .await
    }

    pub async fn mark_failed(
        &self,
        id: &NotificationId,
        topic: Topic,
        resource: &str,
        attempts: u32,
        error: &str,
    ) -> AppResult<()> {
        self.write(
            id,
            MarkerStatus::Failed,
            topic,
            resource,
            attempts,
            Some(error.to_string()),
        )
        .await
    }

    async fn write(
        &self,
        id: &NotificationId,
        status: MarkerStatus,
        topic: Topic,
        resource: &str,
        attempts: u32,
        error: Option<String>,
    ) -> AppResult<()> {
        let marker = ProcessedMarker {
            status,
            processed_at: Utc::now(),
            topic,
            resource: resource.to_string(),
            attempts,
            error,
        };
        debug!(notification_id = %id, status = ?status, "Writing processed marker");
        self.store.set_json(&Self::key(id), &marker, self.ttl).await
    }
}
