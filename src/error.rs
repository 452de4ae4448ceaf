//! Error types for postfan.

use thiserror::Error;

/// Common error type for postfan.
#[derive(Error, Debug)]
pub enum PostfanError {
    /// The destination is already subscribed to the account.
    #[error("destination {destination_id} is already subscribed to account {account_id}")]
    AlreadySubscribed {
        account_id: String,
        destination_id: String,
    },

    /// The destination is not subscribed to the account.
    #[error("destination {destination_id} is not subscribed to account {account_id}")]
    NotSubscribed {
        account_id: String,
        destination_id: String,
    },

    /// The group has used up its subscription quota.
    ///
    /// Constructed by callers of the manager; the manager itself never
    /// enforces quota (see `SubscriptionManager::subscribe`).
    #[error("group {group_id} has reached its subscription limit of {max}")]
    QuotaExceeded { group_id: String, max: u32 },

    /// The tracked account could not be resolved by the content source.
    #[error("account could not be resolved: {0}")]
    AccountUnresolvable(String),

    /// The tracked account is not publicly readable.
    #[error("account {0} is private")]
    AccountPrivate(String),

    /// A delivery destination could not be resolved to a live sink.
    ///
    /// Handled internally by pruning; never surfaced to operators.
    #[error("destination {0} is unreachable")]
    DestinationUnreachable(String),

    /// A record write conflicted with a concurrent mutation.
    #[error("persistence conflict on account {0}")]
    PersistenceConflict(String),

    /// The content source failed to produce an item.
    #[error("content fetch failure: {0}")]
    ContentFetch(String),

    /// Delivery of a rendered payload failed.
    #[error("delivery failure: {0}")]
    Delivery(String),

    /// Database error.
    ///
    /// Generic database error wrapping errors from any backend.
    /// Errors from sqlx are automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

// Conversion from sqlx errors
impl From<sqlx::Error> for PostfanError {
    fn from(e: sqlx::Error) -> Self {
        PostfanError::Database(e.to_string())
    }
}

/// Result type alias for postfan operations.
pub type Result<T> = std::result::Result<T, PostfanError>;
