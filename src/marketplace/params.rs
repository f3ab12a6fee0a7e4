//! Parameter types for marketplace API calls.

use crate::models::Topic;

/// Page size used when a caller does not pick one.
pub const DEFAULT_FEED_PAGE_SIZE: u32 = 50;

/// Query for one page of the missed-feeds listing.
///
/// # Example
///
/// ```rust,ignore
/// let query = MissedFeedsQuery::new(50)
///     .with_offset(100)
///     .with_topic(Topic::Items);
///
/// client.missed_feeds(&token, "app123", &query).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissedFeedsQuery {
    /// Maximum feeds per page
    pub limit: u32,
    /// Feeds to skip
    pub offset: u64,
    /// Server-side topic filter
    pub topic: Option<Topic>,
}

impl MissedFeedsQuery {
    /// A first-page query. A zero limit falls back to [`DEFAULT_FEED_PAGE_SIZE`].
    pub fn new(limit: u32) -> Self {
        Self {
            limit: if limit == 0 {
                DEFAULT_FEED_PAGE_SIZE
            } else {
                limit
            },
            offset: 0,
            topic: None,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Query-string pairs, `app_id` first.
    pub fn to_pairs(&self, app_id: &str) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("app_id", app_id.to_string()),
            ("limit", self.limit.to_string()),
            ("offset", self.offset.to_string()),
        ];
        if let Some(topic) = self.topic {
            pairs.push(("topic", topic.as_str().to_string()));
        }
        pairs
    }
}

impl Default for MissedFeedsQuery {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_PAGE_SIZE)
    }
}
