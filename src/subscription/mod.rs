//! Subscription poll-and-fanout engine for postfan.
//!
//! This module provides the subscription registry, the periodic sweep
//! scheduler, and the per-destination fanout with pruning.

pub mod dispatcher;
pub mod manager;
pub mod repository;
pub mod resolver;
pub mod sweeper;
pub mod types;

pub use dispatcher::{AccountSweepOutcome, FanoutDispatcher};
pub use manager::SubscriptionManager;
pub use repository::SubscriptionRepository;
pub use resolver::{ContentResolver, DeliverySink, SinkResolver};
pub use sweeper::{start_sweep_engine, SweepEngine, SweepStats};
pub use types::{
    AccountSubscription, ContentItem, Destination, NotificationPayload, WatermarkPolicy,
    MAX_UPSERT_RETRIES,
};
