//! Sweep scheduler for postfan.
//!
//! Drives periodic full-registry sweeps. A single timer fires at the
//! configured interval; a try-acquire guard ensures at most one sweep is
//! in flight, because concurrent sweeps over the same record would race
//! on watermark updates. A tick or forced sweep arriving while a sweep is
//! running is dropped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::dispatcher::FanoutDispatcher;
use super::repository::SubscriptionRepository;
use super::resolver::{ContentResolver, SinkResolver};
use crate::config::SubscriptionsConfig;
use crate::db::Database;

/// Aggregate result of one full sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepStats {
    /// Accounts examined.
    pub accounts: usize,
    /// Successful deliveries across all accounts.
    pub deliveries: usize,
    /// Destinations pruned across all accounts.
    pub pruned: usize,
    /// Accounts whose content fetch failed.
    pub fetch_failures: usize,
}

/// The sweep engine: one process-scoped value owning the store handle and
/// both resolver handles. Constructed once at startup and passed
/// explicitly to whoever needs it; there are no globals.
///
/// Not constructed at all when subscriptions are disabled in
/// configuration: the caller checks `SubscriptionsConfig::enabled` before
/// building one.
pub struct SweepEngine<C, S> {
    db: Arc<Database>,
    content: C,
    sinks: S,
    config: SubscriptionsConfig,
    running: AtomicBool,
}

impl<C, S> SweepEngine<C, S>
where
    C: ContentResolver,
    S: SinkResolver,
{
    /// Create a new engine.
    pub fn new(db: Arc<Database>, content: C, sinks: S, config: SubscriptionsConfig) -> Self {
        Self {
            db,
            content,
            sinks,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Build an engine only when subscriptions are enabled in
    /// configuration. `None` means the feature is off: no registry
    /// access and no timer must ever happen.
    pub fn new_if_enabled(
        db: Arc<Database>,
        content: C,
        sinks: S,
        config: SubscriptionsConfig,
    ) -> Option<Self> {
        if !config.enabled {
            info!("Subscriptions are disabled, sweep engine not started");
            return None;
        }
        Some(Self::new(db, content, sinks, config))
    }

    /// The content resolver handle.
    pub fn content(&self) -> &C {
        &self.content
    }

    /// The sink resolver handle.
    pub fn sinks(&self) -> &S {
        &self.sinks
    }

    /// The subscription configuration.
    pub fn config(&self) -> &SubscriptionsConfig {
        &self.config
    }

    /// Run the sweep loop indefinitely at the configured interval.
    pub async fn run(&self) {
        info!(
            "Sweep engine started (interval: {:.2} hours)",
            self.config.sweep_interval_hours
        );

        let mut timer = interval(self.config.sweep_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; consume it so the first sweep
        // happens one full interval after startup, as the source did.
        timer.tick().await;

        loop {
            timer.tick().await;
            self.sweep_now().await;
        }
    }

    /// Run one sweep immediately, unless a sweep is already in flight.
    ///
    /// Returns the stats of the sweep that ran, or `None` when the
    /// trigger was dropped because another sweep holds the guard. Forced
    /// operator sweeps and timer ticks share this same mutual exclusion.
    pub async fn sweep_now(&self) -> Option<SweepStats> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sweep already in flight, dropping trigger");
            return None;
        }

        let stats = self.sweep_all().await;

        self.running.store(false, Ordering::SeqCst);
        Some(stats)
    }

    /// Iterate the full registry once. Caller holds the sweep guard.
    async fn sweep_all(&self) -> SweepStats {
        info!("Starting subscription sweep");
        let mut stats = SweepStats::default();

        let repo = SubscriptionRepository::new(self.db.pool());
        let records = match repo.scan_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to scan subscription registry: {}", e);
                return stats;
            }
        };

        if records.is_empty() {
            debug!("No subscribed accounts");
            return stats;
        }

        let total = records.len();
        let dispatcher = FanoutDispatcher::new(
            &self.db,
            &self.content,
            &self.sinks,
            self.config.watermark_policy,
        );
        let delay = self.config.inter_account_delay();

        for (i, record) in records.into_iter().enumerate() {
            let account_id = record.account_id.clone();
            stats.accounts += 1;

            match dispatcher.process_account(record).await {
                Ok(outcome) => {
                    stats.deliveries += outcome.deliveries;
                    stats.pruned += outcome.pruned;
                    if outcome.aborted_on_failure {
                        stats.fetch_failures += 1;
                    }
                }
                Err(e) => {
                    // One account's failure never blocks the rest
                    warn!("Sweep of account {} failed: {}", account_id, e);
                    stats.fetch_failures += 1;
                }
            }

            // Throttle between accounts to stay polite toward the
            // content source's rate limits. Sequential by design.
            if i + 1 < total && !delay.is_zero() {
                sleep(delay).await;
            }
        }

        info!(
            "Sweep complete: {} account(s), {} delivery(ies), {} pruned, {} fetch failure(s)",
            stats.accounts, stats.deliveries, stats.pruned, stats.fetch_failures
        );
        stats
    }
}

/// Start the sweep engine as a background task.
///
/// Spawns the sweep loop on the current LocalSet; call this from within
/// a LocalSet context (e.g., in the embedding application's main).
pub fn start_sweep_engine<C, S>(engine: Arc<SweepEngine<C, S>>)
where
    C: ContentResolver + 'static,
    S: SinkResolver + 'static,
{
    tokio::task::spawn_local(async move {
        engine.run().await;
    });
}
