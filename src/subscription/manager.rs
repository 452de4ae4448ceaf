//! Subscription manager for postfan.
//!
//! Public API for subscribing and unsubscribing destinations and for the
//! group-scoped queries the command surface needs. Quota enforcement is
//! deliberately left to callers: check `count_for_group` against
//! `max_allowed_for_group` before calling `subscribe`.

use tracing::{debug, warn};

use super::repository::SubscriptionRepository;
use super::types::{AccountSubscription, Destination, MAX_UPSERT_RETRIES};
use crate::config::SubscriptionsConfig;
use crate::db::Database;
use crate::{PostfanError, Result};

/// Manager for subscription records.
pub struct SubscriptionManager<'a> {
    db: &'a Database,
    config: &'a SubscriptionsConfig,
}

impl<'a> SubscriptionManager<'a> {
    /// Create a new manager over the given database and configuration.
    pub fn new(db: &'a Database, config: &'a SubscriptionsConfig) -> Self {
        Self { db, config }
    }

    /// Subscribe a destination to a tracked account.
    ///
    /// Creates the record when the account is not yet tracked, appends the
    /// destination otherwise. Fails with `AlreadySubscribed` when the
    /// destination is already on the record. A conditional-upsert conflict
    /// with a concurrent writer is retried a bounded number of times.
    ///
    /// Does NOT enforce the group quota; that is the caller's check.
    pub async fn subscribe(
        &self,
        account_id: &str,
        group_id: &str,
        destination_id: &str,
    ) -> Result<()> {
        let repo = SubscriptionRepository::new(self.db.pool());

        for attempt in 0..MAX_UPSERT_RETRIES {
            match repo.get(account_id).await? {
                None => {
                    let record = AccountSubscription::new(
                        account_id,
                        Destination::new(group_id, destination_id),
                    );
                    match repo.create(&record).await {
                        Ok(()) => {
                            debug!(
                                "Created subscription record for account {} with destination {}",
                                account_id, destination_id
                            );
                            return Ok(());
                        }
                        // Lost a create race; reload and append instead.
                        Err(PostfanError::PersistenceConflict(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Some(mut record) => {
                    if record.has_destination(destination_id) {
                        return Err(PostfanError::AlreadySubscribed {
                            account_id: account_id.to_string(),
                            destination_id: destination_id.to_string(),
                        });
                    }
                    record
                        .destinations
                        .push(Destination::new(group_id, destination_id));
                    match repo.upsert(&record).await {
                        Ok(_) => {
                            debug!(
                                "Added destination {} to account {}",
                                destination_id, account_id
                            );
                            return Ok(());
                        }
                        Err(PostfanError::PersistenceConflict(_)) => {
                            warn!(
                                "Subscribe to {} lost a write race (attempt {}), retrying",
                                account_id, attempt
                            );
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Err(PostfanError::PersistenceConflict(account_id.to_string()))
    }

    /// Unsubscribe a destination from a tracked account.
    ///
    /// Deletes the record when its destination set becomes empty. Fails
    /// with `NotSubscribed` when the destination is not on the record.
    pub async fn unsubscribe(
        &self,
        account_id: &str,
        _group_id: &str,
        destination_id: &str,
    ) -> Result<()> {
        let repo = SubscriptionRepository::new(self.db.pool());

        for attempt in 0..MAX_UPSERT_RETRIES {
            let mut record = match repo.get(account_id).await? {
                Some(record) => record,
                None => {
                    return Err(PostfanError::NotSubscribed {
                        account_id: account_id.to_string(),
                        destination_id: destination_id.to_string(),
                    })
                }
            };

            if !record.remove_destination(destination_id) {
                return Err(PostfanError::NotSubscribed {
                    account_id: account_id.to_string(),
                    destination_id: destination_id.to_string(),
                });
            }

            if record.destinations.is_empty() {
                // Never persist an empty record
                repo.delete(account_id).await?;
                debug!("Deleted empty subscription record for account {}", account_id);
                return Ok(());
            }

            match repo.upsert(&record).await {
                Ok(_) => {
                    debug!(
                        "Removed destination {} from account {}",
                        destination_id, account_id
                    );
                    return Ok(());
                }
                Err(PostfanError::PersistenceConflict(_)) => {
                    warn!(
                        "Unsubscribe from {} lost a write race (attempt {}), retrying",
                        account_id, attempt
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(PostfanError::PersistenceConflict(account_id.to_string()))
    }

    /// Unsubscribe every destination belonging to a group, across all
    /// records. Records left empty are deleted. Returns the number of
    /// destinations removed.
    pub async fn unsubscribe_all(&self, group_id: &str) -> Result<usize> {
        let repo = SubscriptionRepository::new(self.db.pool());
        let records = repo.list_for_group(group_id).await?;

        let mut removed = 0;
        for mut record in records {
            let before = record.destinations.len();
            record.destinations.retain(|d| d.group_id != group_id);
            removed += before - record.destinations.len();

            if record.destinations.is_empty() {
                repo.delete(&record.account_id).await?;
            } else {
                repo.upsert(&record).await?;
            }
        }

        debug!(
            "Unsubscribed group {} from all accounts ({} destinations removed)",
            group_id, removed
        );
        Ok(removed)
    }

    /// List records holding at least one destination in the group.
    pub async fn list_for_group(&self, group_id: &str) -> Result<Vec<AccountSubscription>> {
        let repo = SubscriptionRepository::new(self.db.pool());
        repo.list_for_group(group_id).await
    }

    /// Count destinations belonging to the group across all records.
    ///
    /// This is the quota-consumed value: one group may subscribe the same
    /// account from multiple destinations, and each counts.
    pub async fn count_for_group(&self, group_id: &str) -> Result<i64> {
        let repo = SubscriptionRepository::new(self.db.pool());
        repo.count_for_group(group_id).await
    }

    /// Subscription quota for the group, from configuration.
    pub fn max_allowed_for_group(&self, group_id: &str) -> u32 {
        self.config.max_for_group(group_id)
    }
}
