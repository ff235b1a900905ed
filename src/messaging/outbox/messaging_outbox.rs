use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::OutboxConfig;
use crate::event_sourcing::{StoreError, WriteBatch};
use crate::messaging::broker::{BrokerError, MessageBroker};
use crate::metrics::Metrics;
use crate::utils::{
    retry_with_backoff_if, CircuitBreaker, CircuitBreakerError, Clock, RetryResult, SystemClock,
};

use super::entry::{LockToken, MessagingOutboxEntry};
use super::repository::MessagingOutboxRepo;

// ============================================================================
// Messaging Outbox - at-least-once delivery of stored messages
// ============================================================================
//
// Publish cycle:
// 1. Claim a batch of publishable entries with a fresh lock token
// 2. Send each claimed entry to the broker (retry + circuit breaker)
// 3. Acknowledge on success, record the failure otherwise
// 4. Save each result only while still holding the lock
//
// Entries are never dropped on failure; they are retried every cycle.
// Abandoned locks are released after `lock_timeout`.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Counts from one publish cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
    /// Released without an attempt because the circuit breaker was open
    pub skipped: usize,
    /// Results discarded because the lock expired and was re-claimed
    pub lost_locks: usize,
}

pub struct MessagingOutbox {
    repo: Arc<dyn MessagingOutboxRepo>,
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn Clock>,
    config: OutboxConfig,
    circuit_breaker: CircuitBreaker,
    metrics: Option<Arc<Metrics>>,
}

impl MessagingOutbox {
    pub fn new(
        repo: Arc<dyn MessagingOutboxRepo>,
        broker: Arc<dyn MessageBroker>,
        config: OutboxConfig,
    ) -> Self {
        let circuit_breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        Self {
            repo,
            broker,
            clock: Arc::new(SystemClock),
            config,
            circuit_breaker,
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    // ========================================================================
    // Inserting
    // ========================================================================

    /// Stage entries in the batch of a state change; they commit with it.
    pub fn insert(&self, batch: &mut WriteBatch, entries: Vec<MessagingOutboxEntry>) {
        batch.stage_outbox(entries);
    }

    /// Write standalone messages that are not tied to an event append
    pub async fn insert_now(&self, entries: Vec<MessagingOutboxEntry>) -> Result<(), OutboxError> {
        if entries.is_empty() {
            return Ok(());
        }
        let count = entries.len();
        self.repo.insert(entries).await?;
        tracing::debug!(count = count, "Inserted outbox entries");
        Ok(())
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    pub async fn publish_next_unpublished_entries(&self) -> Result<PublishReport, OutboxError> {
        let token = LockToken::new();
        let now = self.clock.now();

        let claimed = self
            .repo
            .lock_next_publishable_entries(&token, self.config.batch_size, now)
            .await?;

        let mut report = PublishReport {
            claimed,
            ..PublishReport::default()
        };
        if claimed == 0 {
            return Ok(report);
        }

        let entries = self.repo.find_locked_entries(&token).await?;

        for mut entry in entries {
            match self.publish_entry(&entry).await {
                Ok(()) => {
                    entry.acknowledge(self.clock.now());
                    report.published += 1;
                }
                Err(CircuitBreakerError::CircuitOpen) => {
                    entry.unlock();
                    report.skipped += 1;
                }
                Err(CircuitBreakerError::OperationFailed(error)) => {
                    tracing::warn!(
                        entry_id = %entry.id,
                        target = %entry.target,
                        routing_key = %entry.routing_key,
                        retry_count = entry.retry_count + 1,
                        error = %error,
                        "Outbox entry delivery failed, will retry"
                    );
                    entry.fail(error.to_string(), self.clock.now());
                    report.failed += 1;
                }
            }

            if !self.repo.save(&entry, &token).await? {
                tracing::warn!(
                    entry_id = %entry.id,
                    lock_token = %token,
                    "Lost outbox lock before saving result"
                );
                report.lost_locks += 1;
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.update_circuit_breaker_state(self.circuit_breaker.get_state().await.as_gauge() as u8);
        }

        if report.skipped > 0 {
            tracing::warn!(skipped = report.skipped, "Circuit breaker open, outbox entries deferred");
        }

        tracing::info!(
            claimed = report.claimed,
            published = report.published,
            failed = report.failed,
            "📤 Outbox publish cycle finished"
        );

        Ok(report)
    }

    async fn publish_entry(
        &self,
        entry: &MessagingOutboxEntry,
    ) -> Result<(), CircuitBreakerError<BrokerError>> {
        let started = Instant::now();

        let attempts = AtomicU32::new(0);

        // An open circuit fails every attempt until it cools down
        let result = retry_with_backoff_if(
            self.config.publish_retry.clone(),
            |attempt| {
                attempts.store(attempt, Ordering::Relaxed);
                async move { self.circuit_breaker.call(self.broker.publish(entry)).await }
            },
            |error| !matches!(error, CircuitBreakerError::CircuitOpen),
        )
        .await;

        let result = match result {
            RetryResult::Success(()) => Ok(()),
            // The circuit opened on this entry's own failures: a real attempt
            RetryResult::Failed(CircuitBreakerError::CircuitOpen)
                if attempts.load(Ordering::Relaxed) > 1 =>
            {
                Err(CircuitBreakerError::OperationFailed(BrokerError::Unavailable(
                    "circuit breaker opened while retrying".to_string(),
                )))
            }
            RetryResult::Failed(error) => Err(error),
        };

        if let Some(metrics) = &self.metrics {
            if !matches!(result, Err(CircuitBreakerError::CircuitOpen)) {
                metrics.record_outbox_publish(
                    &entry.target,
                    started.elapsed().as_secs_f64(),
                    result.is_ok(),
                );
            }
        }

        result
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Release locks held longer than `lock_timeout`
    pub async fn unlock_stale_entries(&self) -> Result<u64, OutboxError> {
        let cutoff = self.cutoff(self.config.lock_timeout);
        let unlocked = self.repo.unlock_entries_older_than(cutoff).await?;

        if unlocked > 0 {
            tracing::warn!(unlocked = unlocked, cutoff = %cutoff, "Released stale outbox locks");
            if let Some(metrics) = &self.metrics {
                metrics.record_leases_reclaimed(unlocked);
            }
        }
        Ok(unlocked)
    }

    /// Delete acknowledged entries past the retention period
    pub async fn remove_acknowledged_entries(&self) -> Result<u64, OutboxError> {
        let cutoff = self.cutoff(self.config.retention);
        let removed = self.repo.remove_acknowledged_entries_older_than(cutoff).await?;

        if removed > 0 {
            tracing::info!(removed = removed, "🧹 Removed acknowledged outbox entries");
            if let Some(metrics) = &self.metrics {
                metrics.record_entries_removed(removed);
            }
        }
        Ok(removed)
    }

    /// Entries that kept failing for longer than `failed_alert_age`
    pub async fn find_failed_entries(&self) -> Result<Vec<MessagingOutboxEntry>, OutboxError> {
        let cutoff = self.cutoff(self.config.failed_alert_age);
        let failed = self.repo.find_failed_entries_older_than(cutoff).await?;

        for entry in &failed {
            tracing::warn!(
                entry_id = %entry.id,
                target = %entry.target,
                routing_key = %entry.routing_key,
                retry_count = entry.retry_count,
                last_error = entry.last_error.as_deref().unwrap_or(""),
                "⚠️ Outbox entry still failing"
            );
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_failed_entries(failed.len());
        }
        Ok(failed)
    }

    fn cutoff(&self, age: std::time::Duration) -> DateTime<Utc> {
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        self.clock
            .now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    // ========================================================================
    // Background loop
    // ========================================================================

    /// Poll for publishable entries until `shutdown` flips to `true`.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(self.config.poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut gc = tokio::time::interval(self.config.gc_interval);
            gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            tracing::info!(
                poll_interval_ms = self.config.poll_interval.as_millis() as u64,
                batch_size = self.config.batch_size,
                "🚀 Outbox publisher started"
            );

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        // A dropped sender also means shutdown
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = poll.tick() => {
                        self.run_publish_cycle().await;
                    }
                    _ = gc.tick() => {
                        self.run_maintenance().await;
                    }
                }
            }

            tracing::info!("🛑 Outbox publisher stopped");
        })
    }

    async fn run_publish_cycle(&self) {
        if let Err(e) = self.unlock_stale_entries().await {
            tracing::error!(error = %e, "Failed to release stale outbox locks");
        }

        // Drain full batches before waiting for the next tick
        loop {
            match self.publish_next_unpublished_entries().await {
                Ok(report) if report.claimed == self.config.batch_size && report.published > 0 => continue,
                Ok(_) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Outbox publish cycle failed");
                    break;
                }
            }
        }
    }

    async fn run_maintenance(&self) {
        if let Err(e) = self.remove_acknowledged_entries().await {
            tracing::error!(error = %e, "Failed to remove acknowledged outbox entries");
        }
        if let Err(e) = self.find_failed_entries().await {
            tracing::error!(error = %e, "Failed to look up failed outbox entries");
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryStore;
    use crate::messaging::broker::InMemoryBroker;
    use crate::utils::{CircuitBreakerConfig, ManualClock, RetryConfig};
    use serde_json::Map;
    use std::time::Duration;

    fn config() -> OutboxConfig {
        OutboxConfig {
            batch_size: 10,
            publish_retry: RetryConfig::none(),
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 100,
                ..CircuitBreakerConfig::default()
            },
            ..OutboxConfig::default()
        }
    }

    fn entry(routing_key: &str, clock: &ManualClock) -> MessagingOutboxEntry {
        MessagingOutboxEntry::new("offer", routing_key, Map::new(), clock.now()).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        broker: InMemoryBroker,
        clock: Arc<ManualClock>,
        outbox: MessagingOutbox,
    }

    fn fixture(config: OutboxConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::new());
        let broker = InMemoryBroker::new();
        let outbox = MessagingOutbox::new(store.clone(), Arc::new(broker.clone()), config)
            .with_clock(clock.clone());
        Fixture {
            store,
            broker,
            clock,
            outbox,
        }
    }

    #[tokio::test]
    async fn test_publish_acknowledges_entries_in_order() {
        let f = fixture(config());
        let mut received = f.broker.subscribe("offer");

        f.outbox
            .insert_now(vec![entry("events.created", &f.clock), entry("events.updated", &f.clock)])
            .await
            .unwrap();

        let report = f.outbox.publish_next_unpublished_entries().await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.published, 2);

        use futures_util::StreamExt;
        assert_eq!(received.next().await.unwrap().routing_key, "events.created");
        assert_eq!(received.next().await.unwrap().routing_key, "events.updated");

        // Nothing left to publish
        let report = f.outbox.publish_next_unpublished_entries().await.unwrap();
        assert_eq!(report, PublishReport::default());
    }

    #[tokio::test]
    async fn test_failed_entries_are_retried_next_cycle() {
        let f = fixture(config());
        f.outbox.insert_now(vec![entry("events.created", &f.clock)]).await.unwrap();

        f.broker.fail_next(1);
        let report = f.outbox.publish_next_unpublished_entries().await.unwrap();
        assert_eq!(report.failed, 1);

        let stored = f.store.outbox_entries();
        assert_eq!(stored[0].retry_count, 1);
        assert!(stored[0].is_failed());
        assert!(!stored[0].is_locked());

        let report = f.outbox.publish_next_unpublished_entries().await.unwrap();
        assert_eq!(report.published, 1);
        assert!(f.store.outbox_entries()[0].is_acknowledged());
        assert_eq!(f.broker.published_count(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_defers_without_counting_failures() {
        let f = fixture(OutboxConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                open_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
            ..config()
        });
        f.outbox
            .insert_now(vec![entry("events.created", &f.clock), entry("events.updated", &f.clock)])
            .await
            .unwrap();

        f.broker.set_available(false);
        let report = f.outbox.publish_next_unpublished_entries().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);

        let stored = f.store.outbox_entries();
        assert_eq!(stored[1].retry_count, 0);
        assert!(stored.iter().all(|e| e.is_publishable()));
    }

    #[tokio::test]
    async fn test_open_circuit_is_not_retried_within_a_cycle() {
        let f = fixture(OutboxConfig {
            publish_retry: RetryConfig {
                max_attempts: 5,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(1),
                multiplier: 1.0,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 1,
                open_timeout: Duration::from_secs(60),
                success_threshold: 1,
            },
            ..config()
        });
        f.outbox
            .insert_now(vec![entry("events.created", &f.clock), entry("events.updated", &f.clock)])
            .await
            .unwrap();

        f.broker.set_available(false);
        let report = tokio::time::timeout(
            Duration::from_secs(3),
            f.outbox.publish_next_unpublished_entries(),
        )
        .await
        .expect("open circuit must not be retried with backoff")
        .unwrap();

        // First entry tripped the breaker, second never reached the broker
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        let stored = f.store.outbox_entries();
        assert_eq!(stored[0].retry_count, 1);
        assert_eq!(stored[1].retry_count, 0);
    }

    #[tokio::test]
    async fn test_stale_locks_are_released() {
        let f = fixture(config());
        f.outbox.insert_now(vec![entry("events.created", &f.clock)]).await.unwrap();

        // A worker claims the entry and dies
        let abandoned = LockToken::new();
        let claimed = f
            .store
            .lock_next_publishable_entries(&abandoned, 10, f.clock.now())
            .await
            .unwrap();
        assert_eq!(claimed, 1);

        // Still locked: nothing to publish
        assert_eq!(f.outbox.publish_next_unpublished_entries().await.unwrap().claimed, 0);
        assert_eq!(f.outbox.unlock_stale_entries().await.unwrap(), 0);

        f.clock.advance(chrono::Duration::minutes(10));
        assert_eq!(f.outbox.unlock_stale_entries().await.unwrap(), 1);

        let report = f.outbox.publish_next_unpublished_entries().await.unwrap();
        assert_eq!(report.published, 1);
    }

    #[tokio::test]
    async fn test_retention_and_failed_entry_reporting() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let f = fixture(config());
        let outbox = MessagingOutbox::new(f.store.clone(), Arc::new(f.broker.clone()), config())
            .with_clock(f.clock.clone())
            .with_metrics(metrics.clone());

        outbox
            .insert_now(vec![entry("events.created", &f.clock), entry("events.updated", &f.clock)])
            .await
            .unwrap();

        f.broker.fail_next(1);
        outbox.publish_next_unpublished_entries().await.unwrap();

        f.clock.advance(chrono::Duration::days(8));
        let failed = outbox.find_failed_entries().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].routing_key, "events.created");

        assert_eq!(outbox.remove_acknowledged_entries().await.unwrap(), 1);
        assert_eq!(f.store.outbox_entries().len(), 1);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("outbox_failed_entries 1"));
        assert!(text.contains("outbox_entries_removed_total 1"));
    }

    #[tokio::test]
    async fn test_entry_failing_every_cycle_is_reported() {
        let f = fixture(config());
        f.outbox.insert_now(vec![entry("events.created", &f.clock)]).await.unwrap();
        f.broker.set_available(false);

        for _ in 0..30 {
            let report = f.outbox.publish_next_unpublished_entries().await.unwrap();
            assert_eq!(report.failed, 1);
            f.clock.advance(chrono::Duration::minutes(1));
        }

        let failed = f.outbox.find_failed_entries().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 30);

        // Delivery ends the failing streak
        f.broker.set_available(true);
        assert_eq!(f.outbox.publish_next_unpublished_entries().await.unwrap().published, 1);
        assert!(f.outbox.find_failed_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_background_loop_publishes_and_stops() {
        let f = fixture(OutboxConfig {
            poll_interval: Duration::from_millis(10),
            ..config()
        });
        let outbox = Arc::new(f.outbox);
        outbox.insert_now(vec![entry("events.created", &f.clock)]).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = outbox.clone().start(shutdown_rx);

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.broker.published_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
