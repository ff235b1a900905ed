use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::event_sourcing::{
    AggregateId, AggregateType, EventRecord, EventSourcingRepo, StoreError, Version, WriteBatch,
};
use crate::messaging::inbox::{IncomingMessage, IncomingMessageId, IncomingMessageRepo};
use crate::messaging::outbox::{LockToken, MessagingOutboxEntry, MessagingOutboxRepo};

// ============================================================================
// In-Memory Store - all three repositories behind one lock
// ============================================================================
//
// One lock over events, outbox and inbox gives `insert(WriteBatch)` the same
// all-or-nothing behaviour a database transaction gives the SQL adapter:
// every check runs before the first mutation.
//
// ============================================================================

type StreamKey = (AggregateType, AggregateId);

#[derive(Default)]
struct State {
    heads: HashMap<StreamKey, Version>,
    streams: HashMap<StreamKey, BTreeMap<Version, EventRecord>>,
    outbox: HashMap<Uuid, MessagingOutboxEntry>,
    inbox: HashMap<IncomingMessageId, IncomingMessage>,
}

impl State {
    fn sorted_outbox<'a>(
        &'a self,
        filter: impl Fn(&MessagingOutboxEntry) -> bool + 'a,
    ) -> Vec<&'a MessagingOutboxEntry> {
        let mut entries: Vec<_> = self.outbox.values().filter(|e| filter(e)).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        entries
    }
}

/// Thread-safe in-memory store for tests and the demo binary
pub struct InMemoryStore {
    state: RwLock<State>,
    inserts: broadcast::Sender<Uuid>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (inserts, _) = broadcast::channel(1024);
        Self {
            state: RwLock::new(State::default()),
            inserts,
        }
    }

    /// Snapshot of every outbox entry, oldest first
    pub fn outbox_entries(&self) -> Vec<MessagingOutboxEntry> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entries = state.sorted_outbox(|_| true).into_iter().cloned().collect();
        entries
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
    }

    fn notify(&self, ids: impl IntoIterator<Item = Uuid>) {
        for id in ids {
            // No watchers is fine
            let _ = self.inserts.send(id);
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key(aggregate_id: &AggregateId, aggregate_type: &AggregateType) -> StreamKey {
    (aggregate_type.clone(), aggregate_id.clone())
}

// ============================================================================
// Events
// ============================================================================

#[async_trait]
impl EventSourcingRepo for InMemoryStore {
    async fn insert(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut state = self.write()?;

        // Checks first: nothing is mutated unless the whole batch is valid
        let mut pending_heads: HashMap<StreamKey, Option<Version>> = HashMap::new();
        for append in &batch.appends {
            append.validate()?;
            let stream = key(&append.aggregate_id, &append.aggregate_type);
            let current = match pending_heads.get(&stream) {
                Some(pending) => *pending,
                None => state.heads.get(&stream).copied(),
            };
            if current != append.expected_version {
                return Err(StoreError::Conflict {
                    aggregate_id: append.aggregate_id.clone(),
                    aggregate_type: append.aggregate_type.clone(),
                    expected: append.expected_version,
                });
            }
            pending_heads.insert(stream, append.new_version());
        }

        let mut snapshots = Vec::with_capacity(batch.snapshots.len());
        for snapshot in batch.snapshots {
            let metadata = &snapshot.metadata;
            let stream = key(&metadata.aggregate_id, &metadata.aggregate_type);
            let head = match pending_heads.get(&stream) {
                Some(pending) => *pending,
                None => state.heads.get(&stream).copied(),
            };
            if head.map_or(true, |head| metadata.aggregate_version.is_after(head)) {
                return Err(StoreError::Corrupted(format!(
                    "snapshot at version {} is beyond the head of {}/{}",
                    metadata.aggregate_version, metadata.aggregate_type, metadata.aggregate_id
                )));
            }

            // A newer snapshot already covers this one
            let superseded = state.streams.get(&stream).is_some_and(|events| {
                events
                    .range(metadata.aggregate_version..)
                    .any(|(_, record)| record.is_snapshot())
            });
            if !superseded {
                snapshots.push((stream, snapshot));
            }
        }

        for entry in &batch.outbox {
            if state.outbox.contains_key(&entry.id) {
                return Err(StoreError::Duplicate(format!("outbox entry {}", entry.id)));
            }
        }

        // Apply
        for append in batch.appends {
            let stream = key(&append.aggregate_id, &append.aggregate_type);
            if let Some(new_version) = append.new_version() {
                state.heads.insert(stream.clone(), new_version);
            }
            let events = state.streams.entry(stream).or_default();
            for record in append.events {
                events.insert(record.aggregate_version(), record);
            }
        }

        for (stream, snapshot) in snapshots {
            let version = snapshot.aggregate_version();
            let events = state.streams.entry(stream).or_default();
            events.retain(|v, _| v.is_after(version));
            events.insert(version, snapshot);
        }

        let inserted: Vec<Uuid> = batch.outbox.iter().map(|entry| entry.id).collect();
        for entry in batch.outbox {
            state.outbox.insert(entry.id, entry);
        }
        drop(state);

        self.notify(inserted);
        Ok(())
    }

    async fn find_nearest_snapshot_event(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        version: Version,
    ) -> Result<Option<EventRecord>, StoreError> {
        let state = self.read()?;
        Ok(state
            .streams
            .get(&key(aggregate_id, aggregate_type))
            .and_then(|events| {
                events
                    .range(..=version)
                    .rev()
                    .map(|(_, record)| record)
                    .find(|record| record.is_snapshot())
                    .cloned()
            }))
    }

    async fn find_latest_snapshot_event(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
    ) -> Result<Option<EventRecord>, StoreError> {
        let state = self.read()?;
        Ok(state
            .streams
            .get(&key(aggregate_id, aggregate_type))
            .and_then(|events| events.values().rev().find(|record| record.is_snapshot()).cloned()))
    }

    async fn find_events(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        from: Version,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let state = self.read()?;
        Ok(state
            .streams
            .get(&key(aggregate_id, aggregate_type))
            .map(|events| events.range(from..).map(|(_, record)| record.clone()).collect())
            .unwrap_or_default())
    }

    async fn find_events_until_version(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        until: Version,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let state = self.read()?;
        Ok(state
            .streams
            .get(&key(aggregate_id, aggregate_type))
            .map(|events| events.range(..=until).map(|(_, record)| record.clone()).collect())
            .unwrap_or_default())
    }

    async fn remove_events_until_version(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        until: Version,
    ) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        let Some(events) = state.streams.get_mut(&key(aggregate_id, aggregate_type)) else {
            return Ok(0);
        };
        let before = events.len();
        events.retain(|version, _| version.is_after(until));
        Ok((before - events.len()) as u64)
    }

    async fn find_current_version(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
    ) -> Result<Option<Version>, StoreError> {
        let state = self.read()?;
        Ok(state.heads.get(&key(aggregate_id, aggregate_type)).copied())
    }
}

// ============================================================================
// Outbox
// ============================================================================

#[async_trait]
impl MessagingOutboxRepo for InMemoryStore {
    async fn insert(&self, entries: Vec<MessagingOutboxEntry>) -> Result<(), StoreError> {
        let mut state = self.write()?;
        for entry in &entries {
            if state.outbox.contains_key(&entry.id) {
                return Err(StoreError::Duplicate(format!("outbox entry {}", entry.id)));
            }
        }
        let inserted: Vec<Uuid> = entries.iter().map(|entry| entry.id).collect();
        for entry in entries {
            state.outbox.insert(entry.id, entry);
        }
        drop(state);

        self.notify(inserted);
        Ok(())
    }

    async fn save(&self, entry: &MessagingOutboxEntry, lock: &LockToken) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        match state.outbox.get_mut(&entry.id) {
            Some(stored) if stored.is_locked_by(lock) => {
                *stored = entry.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lock_next_publishable_entries(
        &self,
        token: &LockToken,
        max_entries: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.write()?;
        let ids: Vec<Uuid> = state
            .sorted_outbox(MessagingOutboxEntry::is_publishable)
            .into_iter()
            .take(max_entries)
            .map(|entry| entry.id)
            .collect();

        for id in &ids {
            if let Some(entry) = state.outbox.get_mut(id) {
                entry.lock(*token, now);
            }
        }
        Ok(ids.len())
    }

    async fn find_locked_entries(&self, token: &LockToken) -> Result<Vec<MessagingOutboxEntry>, StoreError> {
        let state = self.read()?;
        let token = *token;
        Ok(state
            .sorted_outbox(move |entry| entry.is_locked_by(&token))
            .into_iter()
            .cloned()
            .collect())
    }

    async fn unlock_entries_older_than(&self, date: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        let mut unlocked = 0;
        for entry in state.outbox.values_mut() {
            if entry.locked_at.is_some_and(|locked_at| locked_at < date) {
                entry.unlock();
                unlocked += 1;
            }
        }
        Ok(unlocked)
    }

    async fn remove_acknowledged_entries_older_than(&self, date: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        let before = state.outbox.len();
        state
            .outbox
            .retain(|_, entry| !entry.acknowledged_at.is_some_and(|acked| acked < date));
        Ok((before - state.outbox.len()) as u64)
    }

    async fn find_failed_entries_older_than(
        &self,
        date: DateTime<Utc>,
    ) -> Result<Vec<MessagingOutboxEntry>, StoreError> {
        let state = self.read()?;
        Ok(state
            .sorted_outbox(move |entry| {
                entry.is_failed() && entry.failed_at.is_some_and(|failed_at| failed_at < date)
            })
            .into_iter()
            .cloned()
            .collect())
    }

    async fn watch_inserts(&self) -> Result<BoxStream<'static, Result<Uuid, StoreError>>, StoreError> {
        let receiver = self.inserts.subscribe();

        Ok(stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(id) => Some((Ok(id), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                    Err(StoreError::Backend(format!("insert watcher lagged by {} entries", skipped))),
                    receiver,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed())
    }
}

// ============================================================================
// Inbox
// ============================================================================

#[async_trait]
impl IncomingMessageRepo for InMemoryStore {
    async fn insert(&self, message: IncomingMessage) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.inbox.contains_key(&message.id) {
            return Err(StoreError::Duplicate(format!("incoming message {}", message.id)));
        }
        state.inbox.insert(message.id.clone(), message);
        Ok(())
    }

    async fn exists(&self, id: &IncomingMessageId) -> Result<bool, StoreError> {
        Ok(self.read()?.inbox.contains_key(id))
    }

    async fn remove(&self, id: &IncomingMessageId) -> Result<bool, StoreError> {
        Ok(self.write()?.inbox.remove(id).is_some())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
