//! External collaborator contracts for postfan.
//!
//! The engine never talks to a content platform or a chat platform
//! directly; the hosting application supplies implementations of these
//! traits. Tests use in-memory fakes.

use chrono::{DateTime, Utc};

use super::types::ContentItem;
use crate::Result;

/// Source of new content for tracked accounts.
#[allow(async_fn_in_trait)]
pub trait ContentResolver {
    /// Fetch items published after `since`, ordered by publish time.
    /// `None` means the account has never been swept. May return an empty
    /// sequence.
    async fn fetch_since(
        &self,
        account_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ContentItem>>;

    /// Resolve the human-readable handle for an account ID.
    async fn resolve_handle(&self, account_id: &str) -> Result<String>;

    /// Whether the account is publicly readable.
    async fn is_publicly_readable(&self, account_id: &str) -> Result<bool>;
}

/// A live destination capable of accepting deliveries.
#[allow(async_fn_in_trait)]
pub trait DeliverySink {
    /// Deliver a text message.
    async fn send_text(&self, message: &str) -> Result<()>;

    /// Deliver inline media with a filename and optional caption.
    async fn send_media(&self, media: &[u8], filename: &str, caption: Option<&str>)
        -> Result<()>;
}

/// Resolves destination IDs to live sinks.
#[allow(async_fn_in_trait)]
pub trait SinkResolver {
    /// The sink type produced by this resolver.
    type Sink: DeliverySink;

    /// Resolve a destination ID to a live sink. `Ok(None)` means the
    /// destination no longer exists (deleted channel, revoked
    /// permission); the caller prunes it.
    async fn resolve_sink(&self, destination_id: &str) -> Result<Option<Self::Sink>>;
}
