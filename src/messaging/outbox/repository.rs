use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::event_sourcing::StoreError;

use super::entry::{LockToken, MessagingOutboxEntry};

/// Persistence port for outbox entries.
///
/// Only the holder of an entry's lock token may move a locked entry to its
/// next state; `save` enforces that.
#[async_trait]
pub trait MessagingOutboxRepo: Send + Sync {
    /// Write new entries outside of an event batch
    async fn insert(&self, entries: Vec<MessagingOutboxEntry>) -> Result<(), StoreError>;

    /// Persist `entry` if it is still locked by `lock` in storage.
    /// Returns `false` when the lock was lost (lease expired and re-claimed).
    async fn save(&self, entry: &MessagingOutboxEntry, lock: &LockToken) -> Result<bool, StoreError>;

    /// Atomically stamp up to `max_entries` publishable entries with `token`,
    /// oldest first. Returns the number of entries claimed.
    async fn lock_next_publishable_entries(
        &self,
        token: &LockToken,
        max_entries: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Entries currently locked by `token`, oldest first
    async fn find_locked_entries(&self, token: &LockToken) -> Result<Vec<MessagingOutboxEntry>, StoreError>;

    /// Release leases taken before `date`. Returns how many were released.
    async fn unlock_entries_older_than(&self, date: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Garbage-collect entries acknowledged before `date`
    async fn remove_acknowledged_entries_older_than(&self, date: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Unacknowledged entries whose last failure happened before `date`
    async fn find_failed_entries_older_than(
        &self,
        date: DateTime<Utc>,
    ) -> Result<Vec<MessagingOutboxEntry>, StoreError>;

    /// Live feed of inserted entry ids. Ends or errors when the underlying
    /// subscription drops; callers re-subscribe.
    async fn watch_inserts(&self) -> Result<BoxStream<'static, Result<Uuid, StoreError>>, StoreError>;
}
