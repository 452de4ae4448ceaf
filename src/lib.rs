//! postfan - subscription poll-and-fanout engine.
//!
//! Tracks external accounts and fans new posts out to subscribed
//! channels. Operators register destinations against tracked accounts;
//! a periodic sweep polls each account for content newer than its
//! watermark and delivers a rendered notification to every destination
//! still registered, pruning the ones that no longer resolve.
//!
//! The content platform and the chat platform are supplied by the
//! embedding application through the [`subscription::ContentResolver`]
//! and [`subscription::SinkResolver`] traits.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pagination;
pub mod subscription;

pub use config::Config;
pub use db::{Database, DbPool};
pub use error::{PostfanError, Result};
pub use pagination::{paginate, DEFAULT_PAGE_BUDGET};
pub use subscription::{
    AccountSubscription, ContentItem, ContentResolver, DeliverySink, Destination,
    FanoutDispatcher, NotificationPayload, SinkResolver, SubscriptionManager,
    SubscriptionRepository, SweepEngine, SweepStats, WatermarkPolicy,
};
