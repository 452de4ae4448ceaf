//! Subscription types for postfan.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

/// Maximum retries for a conflicted conditional upsert in the manager.
pub const MAX_UPSERT_RETRIES: u32 = 3;

/// A delivery destination registered on a subscription record.
///
/// `group_id` identifies the owning collection (server, workspace) and is
/// used for quota accounting; `destination_id` identifies the channel-like
/// sink itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Owning group ID.
    pub group_id: String,
    /// Destination (channel) ID.
    pub destination_id: String,
}

impl Destination {
    /// Create a new destination.
    pub fn new(group_id: impl Into<String>, destination_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            destination_id: destination_id.into(),
        }
    }
}

/// A subscription record for one tracked external account.
#[derive(Debug, Clone)]
pub struct AccountSubscription {
    /// Opaque stable identifier of the tracked account.
    pub account_id: String,
    /// Registered destinations, unique by destination ID.
    pub destinations: Vec<Destination>,
    /// Watermark: publish time of the most recent delivered item.
    /// Only ever advances forward.
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Time of the most recent sweep attempt. Diagnostic only.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency version, incremented on every persisted
    /// mutation.
    pub version: i64,
}

impl AccountSubscription {
    /// Create a new record with a single destination.
    pub fn new(account_id: impl Into<String>, destination: Destination) -> Self {
        Self {
            account_id: account_id.into(),
            destinations: vec![destination],
            last_seen_at: None,
            last_checked_at: None,
            version: 0,
        }
    }

    /// Whether a destination ID is already registered on this record.
    pub fn has_destination(&self, destination_id: &str) -> bool {
        self.destinations
            .iter()
            .any(|d| d.destination_id == destination_id)
    }

    /// Remove a destination by ID. Returns true if it was present.
    pub fn remove_destination(&mut self, destination_id: &str) -> bool {
        let before = self.destinations.len();
        self.destinations
            .retain(|d| d.destination_id != destination_id);
        self.destinations.len() < before
    }

    /// Advance the watermark, never moving it backwards.
    pub fn advance_watermark(&mut self, published_at: DateTime<Utc>) {
        match self.last_seen_at {
            Some(current) if current >= published_at => {}
            _ => self.last_seen_at = Some(published_at),
        }
    }
}

/// One piece of new content produced by the content resolver.
#[derive(Debug, Clone)]
pub struct ContentItem {
    /// When the item was published.
    pub published_at: DateTime<Utc>,
    /// Whether the item is a video.
    pub is_video: bool,
    /// Inline media bytes, when the resolver downloaded the payload.
    pub media: Option<Vec<u8>>,
    /// URL of the content, when the payload is not inline.
    pub content_url: Option<Url>,
    /// Caption text.
    pub caption: Option<String>,
    /// Whether the resolver processed this item successfully. A false
    /// value aborts the sweep for the owning account at this item.
    pub success: bool,
}

impl ContentItem {
    /// Create a successfully resolved item carrying a content URL.
    pub fn with_url(published_at: DateTime<Utc>, is_video: bool, content_url: Url) -> Self {
        Self {
            published_at,
            is_video,
            media: None,
            content_url: Some(content_url),
            caption: None,
            success: true,
        }
    }

    /// Create a successfully resolved item carrying inline media bytes.
    pub fn with_media(published_at: DateTime<Utc>, is_video: bool, media: Vec<u8>) -> Self {
        Self {
            published_at,
            is_video,
            media: Some(media),
            content_url: None,
            caption: None,
            success: true,
        }
    }

    /// Create a failed item marker at the given publish time.
    pub fn failed(published_at: DateTime<Utc>) -> Self {
        Self {
            published_at,
            is_video: false,
            media: None,
            content_url: None,
            caption: None,
            success: false,
        }
    }

    /// Set the caption.
    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

/// A rendered, destination-agnostic notification payload.
#[derive(Debug, Clone)]
pub struct NotificationPayload {
    /// Whether the content is a video.
    pub is_video: bool,
    /// Inline media bytes, when available.
    pub media: Option<Vec<u8>>,
    /// Content URL, when the payload is not inline.
    pub content_url: Option<Url>,
    /// Caption text.
    pub caption: Option<String>,
    /// When the content was published.
    pub published_at: DateTime<Utc>,
    /// Human-readable handle of the tracked account.
    pub account_handle: String,
}

impl NotificationPayload {
    /// Render a content item into a payload for the given account handle.
    pub fn render(item: &ContentItem, account_handle: impl Into<String>) -> Self {
        Self {
            is_video: item.is_video,
            media: item.media.clone(),
            content_url: item.content_url.clone(),
            caption: item.caption.clone(),
            published_at: item.published_at,
            account_handle: account_handle.into(),
        }
    }

    /// Suggested attachment filename for inline media.
    pub fn media_filename(&self) -> &'static str {
        if self.is_video {
            "media.mp4"
        } else {
            "media.jpg"
        }
    }
}

/// Policy for advancing the watermark over a partially failed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkPolicy {
    /// Advance using the batch's last item when that item is successful,
    /// even when an earlier item in the batch failed. This matches the
    /// original system and avoids retry loops on a permanently broken
    /// item, at the cost of silently dropping it.
    #[default]
    BatchTail,
    /// Advance only through the contiguous successful prefix, so a failed
    /// item is retried on the next sweep.
    StopAtFailure,
}

impl WatermarkPolicy {
    /// The watermark value a batch of items yields under this policy, if
    /// any. Items are expected in increasing publish-time order.
    pub fn watermark_for(&self, items: &[ContentItem]) -> Option<DateTime<Utc>> {
        match self {
            WatermarkPolicy::BatchTail => items
                .last()
                .filter(|item| item.success)
                .map(|item| item.published_at),
            WatermarkPolicy::StopAtFailure => items
                .iter()
                .take_while(|item| item.success)
                .last()
                .map(|item| item.published_at),
        }
    }
}
