use async_trait::async_trait;

use crate::event_sourcing::core::{AggregateId, AggregateType, EventRecord, StoreError, Version};
use crate::messaging::outbox::MessagingOutboxEntry;

// ============================================================================
// Event Sourcing Repository - persistence port
// ============================================================================
//
// Responsibilities of an implementation:
// 1. Apply a WriteBatch atomically (events + snapshots + outbox entries)
// 2. Guard every append with a compare-and-swap on the aggregate head
// 3. Keep (aggregate type, aggregate id, version) unique
// 4. Answer snapshot and range queries in ascending version order
//
// ============================================================================

/// Events appended to one aggregate stream
#[derive(Debug, Clone)]
pub struct StreamAppend {
    pub aggregate_id: AggregateId,
    pub aggregate_type: AggregateType,
    /// Head version the caller folded against; `None` when creating
    pub expected_version: Option<Version>,
    /// Contiguous versions starting right after `expected_version`
    pub events: Vec<EventRecord>,
}

impl StreamAppend {
    /// Head version once this append is applied
    pub fn new_version(&self) -> Option<Version> {
        self.events
            .last()
            .map(EventRecord::aggregate_version)
            .or(self.expected_version)
    }

    /// Version the first appended event must carry
    pub fn first_version(&self) -> Version {
        self.expected_version
            .map(Version::next)
            .unwrap_or_else(Version::zero)
    }

    /// Checks that events belong to this stream and are gap-free
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut expected = self.first_version();
        for record in &self.events {
            let metadata = &record.metadata;
            if metadata.aggregate_id != self.aggregate_id
                || metadata.aggregate_type != self.aggregate_type
            {
                return Err(StoreError::Corrupted(format!(
                    "event for {}/{} staged on stream {}/{}",
                    metadata.aggregate_type, metadata.aggregate_id, self.aggregate_type, self.aggregate_id
                )));
            }
            if metadata.aggregate_version != expected {
                return Err(StoreError::Corrupted(format!(
                    "expected version {} but got {} on {}/{}",
                    expected, metadata.aggregate_version, self.aggregate_type, self.aggregate_id
                )));
            }
            expected = expected.next();
        }
        Ok(())
    }
}

/// Everything one unit of work writes, committed all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub appends: Vec<StreamAppend>,
    /// Each snapshot replaces the stored events up to its own version
    pub snapshots: Vec<EventRecord>,
    pub outbox: Vec<MessagingOutboxEntry>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, append: StreamAppend) -> &mut Self {
        self.appends.push(append);
        self
    }

    pub fn snapshot(&mut self, snapshot: EventRecord) -> &mut Self {
        self.snapshots.push(snapshot);
        self
    }

    pub fn stage_outbox<I>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = MessagingOutboxEntry>,
    {
        self.outbox.extend(entries);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.appends.iter().all(|append| append.events.is_empty())
            && self.snapshots.is_empty()
            && self.outbox.is_empty()
    }

    pub fn event_count(&self) -> usize {
        self.appends.iter().map(|append| append.events.len()).sum()
    }
}

#[async_trait]
pub trait EventSourcingRepo: Send + Sync {
    /// Commit the batch atomically. A lost head-version race fails with
    /// `StoreError::Conflict` and writes nothing.
    async fn insert(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Snapshot with the highest version `<= version`
    async fn find_nearest_snapshot_event(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        version: Version,
    ) -> Result<Option<EventRecord>, StoreError>;

    async fn find_latest_snapshot_event(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
    ) -> Result<Option<EventRecord>, StoreError>;

    /// Events with version `>= from`, ascending
    async fn find_events(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        from: Version,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Events with version `<= until`, ascending
    async fn find_events_until_version(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        until: Version,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Delete events with version `<= until`; returns how many were removed
    async fn remove_events_until_version(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
        until: Version,
    ) -> Result<u64, StoreError>;

    /// Head version, `None` for an unknown aggregate
    async fn find_current_version(
        &self,
        aggregate_id: &AggregateId,
        aggregate_type: &AggregateType,
    ) -> Result<Option<Version>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::core::{Agent, EventMetadata, EventName, SerializedEvent};
    use chrono::Utc;
    use serde_json::Map;

    fn record(id: &str, version: u64) -> EventRecord {
        EventRecord {
            metadata: EventMetadata {
                aggregate_id: AggregateId::new(id).unwrap(),
                aggregate_type: AggregateType::new("OFFER").unwrap(),
                aggregate_version: Version::new(version),
                agent: Agent::system(),
                date: Utc::now(),
                is_snapshot: false,
            },
            event: SerializedEvent::new(EventName::new("UPDATED").unwrap(), Version::zero(), Map::new()),
        }
    }

    fn append(expected: Option<u64>, events: Vec<EventRecord>) -> StreamAppend {
        StreamAppend {
            aggregate_id: AggregateId::new("offer-1").unwrap(),
            aggregate_type: AggregateType::new("OFFER").unwrap(),
            expected_version: expected.map(Version::new),
            events,
        }
    }

    #[test]
    fn test_creation_append_starts_at_zero() {
        let append = append(None, vec![record("offer-1", 0), record("offer-1", 1)]);
        assert_eq!(append.first_version(), Version::zero());
        assert_eq!(append.new_version(), Some(Version::new(1)));
        assert!(append.validate().is_ok());
    }

    #[test]
    fn test_append_with_gap_is_rejected() {
        let gap = append(Some(2), vec![record("offer-1", 4)]);
        assert!(matches!(gap.validate(), Err(StoreError::Corrupted(_))));

        let foreign = append(Some(2), vec![record("offer-2", 3)]);
        assert!(matches!(foreign.validate(), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn test_empty_batch() {
        let mut batch = WriteBatch::new();
        assert!(batch.is_empty());

        batch.append(append(Some(0), vec![]));
        assert!(batch.is_empty());

        batch.append(append(Some(0), vec![record("offer-1", 1)]));
        assert!(!batch.is_empty());
        assert_eq!(batch.event_count(), 1);
    }
}
