//! Subscription record store for postfan.
//!
//! sqlx adapter presenting a record-oriented API over the subscriptions
//! and subscription_destinations tables. Writes use optimistic
//! concurrency: `upsert` replaces a record only when the stored version
//! matches the caller's copy, so a subscribe racing an in-flight sweep
//! surfaces as a conflict instead of a lost update.

use chrono::{DateTime, Utc};

use super::types::{AccountSubscription, Destination};
use crate::db::DbPool;
use crate::{PostfanError, Result};

/// Page size for full-registry scans.
const SCAN_PAGE_SIZE: i64 = 100;

/// Row type for a subscription record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SubscriptionRow {
    account_id: String,
    last_seen_at: Option<String>,
    last_checked_at: Option<String>,
    version: i64,
}

/// Row type for a registered destination.
#[derive(Debug, Clone, sqlx::FromRow)]
struct DestinationRow {
    group_id: String,
    destination_id: String,
}

impl SubscriptionRow {
    fn into_record(self, destinations: Vec<Destination>) -> AccountSubscription {
        AccountSubscription {
            account_id: self.account_id,
            destinations,
            last_seen_at: self.last_seen_at.as_deref().and_then(parse_datetime),
            last_checked_at: self.last_checked_at.as_deref().and_then(parse_datetime),
            version: self.version,
        }
    }
}

impl From<DestinationRow> for Destination {
    fn from(row: DestinationRow) -> Self {
        Destination {
            group_id: row.group_id,
            destination_id: row.destination_id,
        }
    }
}

/// Repository for subscription records.
pub struct SubscriptionRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> SubscriptionRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Get a record by account ID.
    pub async fn get(&self, account_id: &str) -> Result<Option<AccountSubscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT account_id, last_seen_at, last_checked_at, version
            FROM subscriptions
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| PostfanError::Database(e.to_string()))?;

        match row {
            Some(row) => {
                let destinations = self.load_destinations(&row.account_id).await?;
                Ok(Some(row.into_record(destinations)))
            }
            None => Ok(None),
        }
    }

    /// Create a new record.
    ///
    /// Fails with `PersistenceConflict` when a record with the same
    /// account ID already exists; a silent overwrite here would paper
    /// over a manager bug.
    pub async fn create(&self, record: &AccountSubscription) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PostfanError::Database(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (account_id, last_seen_at, last_checked_at, version)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&record.account_id)
        .bind(record.last_seen_at.map(format_datetime))
        .bind(record.last_checked_at.map(format_datetime))
        .bind(record.version)
        .execute(&mut *tx)
        .await;

        if let Err(e) = result {
            if is_unique_violation(&e) {
                return Err(PostfanError::PersistenceConflict(record.account_id.clone()));
            }
            return Err(PostfanError::Database(e.to_string()));
        }

        insert_destinations(&mut tx, &record.account_id, &record.destinations).await?;

        tx.commit()
            .await
            .map_err(|e| PostfanError::Database(e.to_string()))?;

        Ok(())
    }

    /// Create-or-replace a record, conditional on the caller's version.
    ///
    /// Replaces the stored record only when its version equals
    /// `record.version`, incrementing it; a mismatch means another writer
    /// got there first and yields `PersistenceConflict`. When no record
    /// exists yet, one is created. Returns the newly stored version.
    pub async fn upsert(&self, record: &AccountSubscription) -> Result<i64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PostfanError::Database(e.to_string()))?;

        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_seen_at = $1, last_checked_at = $2, version = version + 1
            WHERE account_id = $3 AND version = $4
            "#,
        )
        .bind(record.last_seen_at.map(format_datetime))
        .bind(record.last_checked_at.map(format_datetime))
        .bind(&record.account_id)
        .bind(record.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| PostfanError::Database(e.to_string()))?;

        let new_version = if updated.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM subscriptions WHERE account_id = $1)")
                    .bind(&record.account_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| PostfanError::Database(e.to_string()))?;

            if exists {
                // Version mismatch: a concurrent writer won the race.
                return Err(PostfanError::PersistenceConflict(record.account_id.clone()));
            }

            sqlx::query(
                r#"
                INSERT INTO subscriptions (account_id, last_seen_at, last_checked_at, version)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(&record.account_id)
            .bind(record.last_seen_at.map(format_datetime))
            .bind(record.last_checked_at.map(format_datetime))
            .bind(record.version)
            .execute(&mut *tx)
            .await
            .map_err(|e| PostfanError::Database(e.to_string()))?;

            record.version
        } else {
            record.version + 1
        };

        // Destinations are replaced wholesale with the record's set
        sqlx::query("DELETE FROM subscription_destinations WHERE account_id = $1")
            .bind(&record.account_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| PostfanError::Database(e.to_string()))?;

        insert_destinations(&mut tx, &record.account_id, &record.destinations).await?;

        tx.commit()
            .await
            .map_err(|e| PostfanError::Database(e.to_string()))?;

        Ok(new_version)
    }

    /// Delete a record by account ID. Returns true if a record existed.
    pub async fn delete(&self, account_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE account_id = $1")
            .bind(account_id)
            .execute(self.pool)
            .await
            .map_err(|e| PostfanError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    /// Scan the full registry in stable account-ID order.
    ///
    /// Paged internally; restartable between sweeps but not a snapshot,
    /// so records created mid-scan may or may not appear.
    pub async fn scan_all(&self) -> Result<Vec<AccountSubscription>> {
        let mut records = Vec::new();
        let mut cursor = String::new();

        loop {
            let rows = sqlx::query_as::<_, SubscriptionRow>(
                r#"
                SELECT account_id, last_seen_at, last_checked_at, version
                FROM subscriptions
                WHERE account_id > $1
                ORDER BY account_id ASC
                LIMIT $2
                "#,
            )
            .bind(&cursor)
            .bind(SCAN_PAGE_SIZE)
            .fetch_all(self.pool)
            .await
            .map_err(|e| PostfanError::Database(e.to_string()))?;

            let page_len = rows.len();
            for row in rows {
                cursor = row.account_id.clone();
                let destinations = self.load_destinations(&row.account_id).await?;
                records.push(row.into_record(destinations));
            }

            if (page_len as i64) < SCAN_PAGE_SIZE {
                break;
            }
        }

        Ok(records)
    }

    /// List records holding at least one destination in the given group,
    /// in stable account-ID order.
    pub async fn list_for_group(&self, group_id: &str) -> Result<Vec<AccountSubscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT s.account_id, s.last_seen_at, s.last_checked_at, s.version
            FROM subscriptions s
            WHERE EXISTS (
                SELECT 1 FROM subscription_destinations d
                WHERE d.account_id = s.account_id AND d.group_id = $1
            )
            ORDER BY s.account_id ASC
            "#,
        )
        .bind(group_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| PostfanError::Database(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let destinations = self.load_destinations(&row.account_id).await?;
            records.push(row.into_record(destinations));
        }

        Ok(records)
    }

    /// Count destinations belonging to the given group across all records.
    ///
    /// This is the quota-consumed value: one group subscribing the same
    /// account from two destinations counts twice.
    pub async fn count_for_group(&self, group_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM subscription_destinations WHERE group_id = $1")
                .bind(group_id)
                .fetch_one(self.pool)
                .await
                .map_err(|e| PostfanError::Database(e.to_string()))?;

        Ok(count)
    }

    /// Load the destinations registered on a record.
    async fn load_destinations(&self, account_id: &str) -> Result<Vec<Destination>> {
        let rows = sqlx::query_as::<_, DestinationRow>(
            r#"
            SELECT group_id, destination_id
            FROM subscription_destinations
            WHERE account_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| PostfanError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(Destination::from).collect())
    }
}

async fn insert_destinations(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    account_id: &str,
    destinations: &[Destination],
) -> Result<()> {
    for dest in destinations {
        sqlx::query(
            r#"
            INSERT INTO subscription_destinations (account_id, group_id, destination_id)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(account_id)
        .bind(&dest.group_id)
        .bind(&dest.destination_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| PostfanError::Database(e.to_string()))?;
    }
    Ok(())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use chrono::TimeZone;

    async fn setup_db() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = setup_db().await;
        let repo = SubscriptionRepository::new(db.pool());

        let record = AccountSubscription::new("acct-1", Destination::new("g1", "d1"));
        repo.create(&record).await.unwrap();

        let loaded = repo.get("acct-1").await.unwrap().unwrap();
        assert_eq!(loaded.account_id, "acct-1");
        assert_eq!(loaded.destinations.len(), 1);
        assert_eq!(loaded.destinations[0].destination_id, "d1");
        assert_eq!(loaded.version, 0);
        assert!(loaded.last_seen_at.is_none());
    }

    #[tokio::test]
    async fn test_get_absent() {
        let db = setup_db().await;
        let repo = SubscriptionRepository::new(db.pool());
        assert!(repo.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_duplicate_is_conflict() {
        let db = setup_db().await;
        let repo = SubscriptionRepository::new(db.pool());

        let record = AccountSubscription::new("acct-1", Destination::new("g1", "d1"));
        repo.create(&record).await.unwrap();

        let err = repo.create(&record).await.unwrap_err();
        assert!(matches!(err, PostfanError::PersistenceConflict(_)));
    }

    #[tokio::test]
    async fn test_upsert_creates_when_absent() {
        let db = setup_db().await;
        let repo = SubscriptionRepository::new(db.pool());

        let record = AccountSubscription::new("acct-1", Destination::new("g1", "d1"));
        let version = repo.upsert(&record).await.unwrap();
        assert_eq!(version, 0);

        let loaded = repo.get("acct-1").await.unwrap().unwrap();
        assert_eq!(loaded.destinations.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_and_bumps_version() {
        let db = setup_db().await;
        let repo = SubscriptionRepository::new(db.pool());

        let record = AccountSubscription::new("acct-1", Destination::new("g1", "d1"));
        repo.create(&record).await.unwrap();

        let mut updated = repo.get("acct-1").await.unwrap().unwrap();
        updated.destinations.push(Destination::new("g2", "d2"));
        updated.advance_watermark(ts(1000));
        let version = repo.upsert(&updated).await.unwrap();
        assert_eq!(version, 1);

        let loaded = repo.get("acct-1").await.unwrap().unwrap();
        assert_eq!(loaded.destinations.len(), 2);
        assert_eq!(loaded.last_seen_at, Some(ts(1000)));
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_upsert_stale_version_is_conflict() {
        let db = setup_db().await;
        let repo = SubscriptionRepository::new(db.pool());

        let record = AccountSubscription::new("acct-1", Destination::new("g1", "d1"));
        repo.create(&record).await.unwrap();

        // First writer wins
        let mut first = repo.get("acct-1").await.unwrap().unwrap();
        let mut second = first.clone();
        first.advance_watermark(ts(500));
        repo.upsert(&first).await.unwrap();

        // Second writer holds a stale version
        second.advance_watermark(ts(100));
        let err = repo.upsert(&second).await.unwrap_err();
        assert!(matches!(err, PostfanError::PersistenceConflict(_)));

        // Stored record untouched by the loser
        let loaded = repo.get("acct-1").await.unwrap().unwrap();
        assert_eq!(loaded.last_seen_at, Some(ts(500)));
    }

    #[tokio::test]
    async fn test_delete() {
        let db = setup_db().await;
        let repo = SubscriptionRepository::new(db.pool());

        let record = AccountSubscription::new("acct-1", Destination::new("g1", "d1"));
        repo.create(&record).await.unwrap();

        assert!(repo.delete("acct-1").await.unwrap());
        assert!(repo.get("acct-1").await.unwrap().is_none());
        assert!(!repo.delete("acct-1").await.unwrap());

        // Destination rows cascade away
        let count = repo.count_for_group("g1").await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_scan_all_ordered() {
        let db = setup_db().await;
        let repo = SubscriptionRepository::new(db.pool());

        for id in ["acct-c", "acct-a", "acct-b"] {
            let record = AccountSubscription::new(id, Destination::new("g1", format!("d-{id}")));
            repo.create(&record).await.unwrap();
        }

        let records = repo.scan_all().await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.account_id.as_str()).collect();
        assert_eq!(ids, vec!["acct-a", "acct-b", "acct-c"]);
    }

    #[tokio::test]
    async fn test_list_for_group() {
        let db = setup_db().await;
        let repo = SubscriptionRepository::new(db.pool());

        let mut r1 = AccountSubscription::new("acct-1", Destination::new("g1", "d1"));
        r1.destinations.push(Destination::new("g2", "d2"));
        repo.create(&r1).await.unwrap();

        let r2 = AccountSubscription::new("acct-2", Destination::new("g2", "d3"));
        repo.create(&r2).await.unwrap();

        let g1 = repo.list_for_group("g1").await.unwrap();
        assert_eq!(g1.len(), 1);
        assert_eq!(g1[0].account_id, "acct-1");

        let g2 = repo.list_for_group("g2").await.unwrap();
        assert_eq!(g2.len(), 2);
    }

    #[tokio::test]
    async fn test_count_for_group_counts_destinations() {
        let db = setup_db().await;
        let repo = SubscriptionRepository::new(db.pool());

        // Same group subscribing two accounts, one twice
        let mut r1 = AccountSubscription::new("acct-1", Destination::new("g1", "d1"));
        r1.destinations.push(Destination::new("g1", "d2"));
        repo.create(&r1).await.unwrap();

        let r2 = AccountSubscription::new("acct-2", Destination::new("g1", "d3"));
        repo.create(&r2).await.unwrap();

        assert_eq!(repo.count_for_group("g1").await.unwrap(), 3);
        assert_eq!(repo.count_for_group("g9").await.unwrap(), 0);
    }
}
