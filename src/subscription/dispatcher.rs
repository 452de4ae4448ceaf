//! Fanout dispatcher for postfan.
//!
//! Processes one subscription record per call: resolves what is new since
//! the record's watermark, renders each item once, delivers it to every
//! registered destination, prunes destinations that no longer resolve,
//! and persists the updated record (or deletes it when no destinations
//! remain).

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::repository::SubscriptionRepository;
use super::resolver::{ContentResolver, DeliverySink, SinkResolver};
use super::types::{AccountSubscription, NotificationPayload, WatermarkPolicy};
use crate::db::Database;
use crate::{PostfanError, Result};

/// Per-account outcome of one sweep pass.
#[derive(Debug, Clone, Default)]
pub struct AccountSweepOutcome {
    /// Number of successful deliveries (items x destinations).
    pub deliveries: usize,
    /// Number of destinations pruned as unreachable.
    pub pruned: usize,
    /// Whether item processing stopped at a failed item.
    pub aborted_on_failure: bool,
}

/// Dispatcher fanning new content out to registered destinations.
pub struct FanoutDispatcher<'a, C, S> {
    db: &'a Database,
    content: &'a C,
    sinks: &'a S,
    policy: WatermarkPolicy,
}

impl<'a, C, S> FanoutDispatcher<'a, C, S>
where
    C: ContentResolver,
    S: SinkResolver,
{
    /// Create a new dispatcher.
    pub fn new(db: &'a Database, content: &'a C, sinks: &'a S, policy: WatermarkPolicy) -> Self {
        Self {
            db,
            content,
            sinks,
            policy,
        }
    }

    /// Process one account: fetch, deliver, prune, persist.
    ///
    /// A content fetch failure propagates to the caller (the sweep loop
    /// logs it and moves on); everything past the fetch is handled
    /// locally and never aborts the record's persistence.
    pub async fn process_account(
        &self,
        mut record: AccountSubscription,
    ) -> Result<AccountSweepOutcome> {
        let repo = SubscriptionRepository::new(self.db.pool());
        let account_id = record.account_id.clone();
        debug!("Checking account {} for new content", account_id);

        record.last_checked_at = Some(Utc::now());

        let items = self
            .content
            .fetch_since(&account_id, record.last_seen_at)
            .await?;

        // Watermark advances once per sweep from the whole batch, under
        // the configured policy, independent of delivery success.
        if let Some(watermark) = self.policy.watermark_for(&items) {
            record.advance_watermark(watermark);
        }

        let mut outcome = AccountSweepOutcome::default();
        // Handle lookup is cached for the whole account sweep
        let mut handle: Option<String> = None;

        for item in &items {
            if !item.success {
                warn!(
                    "Content source failed to process item for account {} at {}, skipping rest of account",
                    account_id, item.published_at
                );
                outcome.aborted_on_failure = true;
                break;
            }

            let account_handle = match &handle {
                Some(h) => h.clone(),
                None => {
                    let resolved = match self.content.resolve_handle(&account_id).await {
                        Ok(h) => h,
                        Err(e) => {
                            // Cosmetic only; fall back to the raw ID
                            warn!("Handle resolution failed for account {}: {}", account_id, e);
                            account_id.clone()
                        }
                    };
                    handle = Some(resolved.clone());
                    resolved
                }
            };

            let payload = NotificationPayload::render(item, account_handle);

            // Iterate a snapshot; pruning mutates the authoritative set
            for dest in record.destinations.clone() {
                match self.sinks.resolve_sink(&dest.destination_id).await {
                    Ok(Some(sink)) => {
                        if let Err(e) = deliver(&sink, &payload).await {
                            warn!(
                                "Delivery to destination {} failed: {}",
                                dest.destination_id, e
                            );
                        } else {
                            outcome.deliveries += 1;
                        }
                    }
                    Ok(None) => {
                        info!(
                            "Destination {} no longer exists, pruning",
                            dest.destination_id
                        );
                        record.remove_destination(&dest.destination_id);
                        outcome.pruned += 1;
                    }
                    Err(e) => {
                        info!(
                            "Destination {} unreachable, pruning: {}",
                            dest.destination_id, e
                        );
                        record.remove_destination(&dest.destination_id);
                        outcome.pruned += 1;
                    }
                }
            }
        }

        if record.destinations.is_empty() {
            if let Err(e) = repo.delete(&account_id).await {
                error!("Failed to delete empty record for account {}: {}", account_id, e);
            } else {
                info!("Account {} has no destinations left, record deleted", account_id);
            }
        } else {
            match repo.upsert(&record).await {
                Ok(_) => {}
                Err(PostfanError::PersistenceConflict(_)) => {
                    // A subscribe raced this sweep; the watermark update
                    // is deferred to the next sweep.
                    warn!(
                        "Record for account {} changed during sweep, deferring update",
                        account_id
                    );
                }
                Err(e) => {
                    error!(
                        "Failed to persist record for account {} after sweep: {}",
                        account_id, e
                    );
                }
            }
        }

        Ok(outcome)
    }
}

/// Deliver a payload to a resolved sink: inline media when present, a
/// URL-bearing text message otherwise.
async fn deliver<K: DeliverySink>(sink: &K, payload: &NotificationPayload) -> Result<()> {
    if let Some(media) = &payload.media {
        sink.send_media(media, payload.media_filename(), payload.caption.as_deref())
            .await
    } else if let Some(url) = &payload.content_url {
        sink.send_text(&text_message(&payload.account_handle, url.as_str(), payload.caption.as_deref()))
            .await
    } else {
        Err(PostfanError::Delivery(
            "payload has neither media nor URL".to_string(),
        ))
    }
}

fn text_message(handle: &str, url: &str, caption: Option<&str>) -> String {
    match caption {
        Some(caption) => format!("New post from {handle}! {url}\n{caption}"),
        None => format!("New post from {handle}! {url}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::types::{ContentItem, Destination};
    use crate::Database;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use url::Url;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn url_item(secs: i64) -> ContentItem {
        ContentItem::with_url(
            ts(secs),
            false,
            Url::parse(&format!("https://example.com/p/{secs}")).unwrap(),
        )
    }

    struct FakeContent {
        items: HashMap<String, Vec<ContentItem>>,
        handle_lookups: AtomicUsize,
    }

    impl FakeContent {
        fn new(account_id: &str, items: Vec<ContentItem>) -> Self {
            let mut map = HashMap::new();
            map.insert(account_id.to_string(), items);
            Self {
                items: map,
                handle_lookups: AtomicUsize::new(0),
            }
        }
    }

    impl ContentResolver for FakeContent {
        async fn fetch_since(
            &self,
            account_id: &str,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<ContentItem>> {
            let items = self.items.get(account_id).cloned().unwrap_or_default();
            Ok(match since {
                Some(since) => items
                    .into_iter()
                    .filter(|i| i.published_at > since)
                    .collect(),
                None => items,
            })
        }

        async fn resolve_handle(&self, account_id: &str) -> Result<String> {
            self.handle_lookups.fetch_add(1, Ordering::SeqCst);
            Ok(format!("@{account_id}"))
        }

        async fn is_publicly_readable(&self, _account_id: &str) -> Result<bool> {
            Ok(true)
        }
    }

    type SentLog = Arc<Mutex<Vec<(String, String)>>>;

    struct FakeSinks {
        dead: HashSet<String>,
        sent: SentLog,
    }

    impl FakeSinks {
        fn new() -> Self {
            Self {
                dead: HashSet::new(),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn with_dead(mut self, destination_id: &str) -> Self {
            self.dead.insert(destination_id.to_string());
            self
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    struct FakeSink {
        destination_id: String,
        sent: SentLog,
    }

    impl DeliverySink for FakeSink {
        async fn send_text(&self, message: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((self.destination_id.clone(), message.to_string()));
            Ok(())
        }

        async fn send_media(
            &self,
            media: &[u8],
            filename: &str,
            _caption: Option<&str>,
        ) -> Result<()> {
            self.sent.lock().unwrap().push((
                self.destination_id.clone(),
                format!("media:{filename}:{}", media.len()),
            ));
            Ok(())
        }
    }

    impl SinkResolver for FakeSinks {
        type Sink = FakeSink;

        async fn resolve_sink(&self, destination_id: &str) -> Result<Option<FakeSink>> {
            if self.dead.contains(destination_id) {
                return Ok(None);
            }
            Ok(Some(FakeSink {
                destination_id: destination_id.to_string(),
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    async fn setup_record(db: &Database, destinations: &[(&str, &str)]) -> AccountSubscription {
        let repo = SubscriptionRepository::new(db.pool());
        let mut record = AccountSubscription::new(
            "acct-1",
            Destination::new(destinations[0].0, destinations[0].1),
        );
        for (group, dest) in &destinations[1..] {
            record.destinations.push(Destination::new(*group, *dest));
        }
        repo.create(&record).await.unwrap();
        repo.get("acct-1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_all_success_delivers_in_order_and_advances_watermark() {
        let db = Database::open_in_memory().await.unwrap();
        let record = setup_record(&db, &[("g1", "d1"), ("g1", "d2")]).await;

        let content = FakeContent::new("acct-1", vec![url_item(1), url_item(2), url_item(3)]);
        let sinks = FakeSinks::new();
        let dispatcher =
            FanoutDispatcher::new(&db, &content, &sinks, WatermarkPolicy::BatchTail);

        let outcome = dispatcher.process_account(record).await.unwrap();
        assert_eq!(outcome.deliveries, 6);
        assert_eq!(outcome.pruned, 0);
        assert!(!outcome.aborted_on_failure);

        // Items arrive in publish-time order at each destination
        let sent = sinks.sent();
        let d1_msgs: Vec<&String> = sent
            .iter()
            .filter(|(d, _)| d == "d1")
            .map(|(_, m)| m)
            .collect();
        assert_eq!(d1_msgs.len(), 3);
        assert!(d1_msgs[0].contains("/p/1"));
        assert!(d1_msgs[1].contains("/p/2"));
        assert!(d1_msgs[2].contains("/p/3"));

        let repo = SubscriptionRepository::new(db.pool());
        let stored = repo.get("acct-1").await.unwrap().unwrap();
        assert_eq!(stored.last_seen_at, Some(ts(3)));
        assert!(stored.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_trailing_failure_stops_and_holds_watermark() {
        let db = Database::open_in_memory().await.unwrap();
        let record = setup_record(&db, &[("g1", "d1")]).await;

        let content =
            FakeContent::new("acct-1", vec![url_item(1), ContentItem::failed(ts(2))]);
        let sinks = FakeSinks::new();
        let dispatcher =
            FanoutDispatcher::new(&db, &content, &sinks, WatermarkPolicy::BatchTail);

        let outcome = dispatcher.process_account(record).await.unwrap();
        assert_eq!(outcome.deliveries, 1);
        assert!(outcome.aborted_on_failure);

        // No success suffix, so the watermark does not move
        let repo = SubscriptionRepository::new(db.pool());
        let stored = repo.get("acct-1").await.unwrap().unwrap();
        assert_eq!(stored.last_seen_at, None);
    }

    #[tokio::test]
    async fn test_mid_batch_failure_batch_tail_jumps_watermark() {
        let db = Database::open_in_memory().await.unwrap();
        let record = setup_record(&db, &[("g1", "d1")]).await;

        let content = FakeContent::new(
            "acct-1",
            vec![url_item(1), ContentItem::failed(ts(2)), url_item(3)],
        );
        let sinks = FakeSinks::new();
        let dispatcher =
            FanoutDispatcher::new(&db, &content, &sinks, WatermarkPolicy::BatchTail);

        let outcome = dispatcher.process_account(record).await.unwrap();
        // Only t1 delivered; processing stops at the failure
        assert_eq!(outcome.deliveries, 1);
        assert!(outcome.aborted_on_failure);

        // But the watermark jumps to t3 under the batch-tail policy
        let repo = SubscriptionRepository::new(db.pool());
        let stored = repo.get("acct-1").await.unwrap().unwrap();
        assert_eq!(stored.last_seen_at, Some(ts(3)));
    }

    #[tokio::test]
    async fn test_mid_batch_failure_stop_at_failure_retries() {
        let db = Database::open_in_memory().await.unwrap();
        let record = setup_record(&db, &[("g1", "d1")]).await;

        let content = FakeContent::new(
            "acct-1",
            vec![url_item(1), ContentItem::failed(ts(2)), url_item(3)],
        );
        let sinks = FakeSinks::new();
        let dispatcher =
            FanoutDispatcher::new(&db, &content, &sinks, WatermarkPolicy::StopAtFailure);

        dispatcher.process_account(record).await.unwrap();

        // Watermark holds at t1 so the failed item is retried next sweep
        let repo = SubscriptionRepository::new(db.pool());
        let stored = repo.get("acct-1").await.unwrap().unwrap();
        assert_eq!(stored.last_seen_at, Some(ts(1)));
    }

    #[tokio::test]
    async fn test_dead_destination_pruned_live_one_still_delivered() {
        let db = Database::open_in_memory().await.unwrap();
        let record = setup_record(&db, &[("g1", "d-dead"), ("g1", "d-live")]).await;

        let content = FakeContent::new("acct-1", vec![url_item(1)]);
        let sinks = FakeSinks::new().with_dead("d-dead");
        let dispatcher =
            FanoutDispatcher::new(&db, &content, &sinks, WatermarkPolicy::BatchTail);

        let outcome = dispatcher.process_account(record).await.unwrap();
        assert_eq!(outcome.deliveries, 1);
        assert_eq!(outcome.pruned, 1);

        let sent = sinks.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "d-live");

        // Record persists without the dead destination
        let repo = SubscriptionRepository::new(db.pool());
        let stored = repo.get("acct-1").await.unwrap().unwrap();
        assert_eq!(stored.destinations.len(), 1);
        assert_eq!(stored.destinations[0].destination_id, "d-live");
    }

    #[tokio::test]
    async fn test_all_destinations_pruned_deletes_record() {
        let db = Database::open_in_memory().await.unwrap();
        let record = setup_record(&db, &[("g1", "d-dead")]).await;

        let content = FakeContent::new("acct-1", vec![url_item(1)]);
        let sinks = FakeSinks::new().with_dead("d-dead");
        let dispatcher =
            FanoutDispatcher::new(&db, &content, &sinks, WatermarkPolicy::BatchTail);

        let outcome = dispatcher.process_account(record).await.unwrap();
        assert_eq!(outcome.deliveries, 0);
        assert_eq!(outcome.pruned, 1);

        let repo = SubscriptionRepository::new(db.pool());
        assert!(repo.get("acct-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_batch_leaves_watermark() {
        let db = Database::open_in_memory().await.unwrap();
        let record = setup_record(&db, &[("g1", "d1")]).await;

        let content = FakeContent::new("acct-1", vec![]);
        let sinks = FakeSinks::new();
        let dispatcher =
            FanoutDispatcher::new(&db, &content, &sinks, WatermarkPolicy::BatchTail);

        let outcome = dispatcher.process_account(record).await.unwrap();
        assert_eq!(outcome.deliveries, 0);

        let repo = SubscriptionRepository::new(db.pool());
        let stored = repo.get("acct-1").await.unwrap().unwrap();
        assert_eq!(stored.last_seen_at, None);
        assert!(stored.last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_handle_resolved_once_per_account() {
        let db = Database::open_in_memory().await.unwrap();
        let record = setup_record(&db, &[("g1", "d1"), ("g1", "d2")]).await;

        let content = FakeContent::new("acct-1", vec![url_item(1), url_item(2), url_item(3)]);
        let sinks = FakeSinks::new();
        let dispatcher =
            FanoutDispatcher::new(&db, &content, &sinks, WatermarkPolicy::BatchTail);

        dispatcher.process_account(record).await.unwrap();
        assert_eq!(content.handle_lookups.load(Ordering::SeqCst), 1);

        let sent = sinks.sent();
        assert!(sent.iter().all(|(_, m)| m.contains("@acct-1")));
    }

    #[tokio::test]
    async fn test_media_item_delivered_as_attachment() {
        let db = Database::open_in_memory().await.unwrap();
        let record = setup_record(&db, &[("g1", "d1")]).await;

        let item = ContentItem::with_media(ts(1), true, vec![0u8; 16]).with_caption("clip");
        let content = FakeContent::new("acct-1", vec![item]);
        let sinks = FakeSinks::new();
        let dispatcher =
            FanoutDispatcher::new(&db, &content, &sinks, WatermarkPolicy::BatchTail);

        dispatcher.process_account(record).await.unwrap();

        let sent = sinks.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "media:media.mp4:16");
    }

    #[test]
    fn test_text_message_format() {
        assert_eq!(
            text_message("@user", "https://e.com/p/1", None),
            "New post from @user! https://e.com/p/1"
        );
        assert_eq!(
            text_message("@user", "https://e.com/p/1", Some("hi")),
            "New post from @user! https://e.com/p/1\nhi"
        );
    }
}
