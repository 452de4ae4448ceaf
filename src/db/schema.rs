//! Database schema and migrations for postfan.
//!
//! Migrations are applied sequentially when the database is opened; the
//! schema_version table tracks which have been applied.

/// Database migrations.
pub const MIGRATIONS: &[&str] = &[
    // v1: Subscription registry
    r#"
-- One record per tracked external account
CREATE TABLE subscriptions (
    account_id       TEXT NOT NULL PRIMARY KEY,
    last_seen_at     TEXT,                       -- watermark: publish time of newest delivered item
    last_checked_at  TEXT,                       -- diagnostic: time of last sweep attempt
    version          INTEGER NOT NULL DEFAULT 0, -- optimistic concurrency
    created_at       TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Delivery destinations registered on a record
CREATE TABLE subscription_destinations (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id      TEXT NOT NULL REFERENCES subscriptions(account_id) ON DELETE CASCADE,
    group_id        TEXT NOT NULL,
    destination_id  TEXT NOT NULL,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(account_id, destination_id)
);

CREATE INDEX idx_destinations_account ON subscription_destinations(account_id);
CREATE INDEX idx_destinations_group ON subscription_destinations(group_id);
"#,
];
