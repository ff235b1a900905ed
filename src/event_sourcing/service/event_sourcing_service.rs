use std::marker::PhantomData;
use std::sync::Arc;

use crate::event_sourcing::core::{
    Agent, Aggregate, AggregateId, AggregateType, EventPatcher, EventRecord, EventSerializer,
    EventSourcingError, EventWithMetadata, Version, VersionedAggregate,
};
use crate::event_sourcing::store::{EventSourcingRepo, StreamAppend, WriteBatch};
use crate::metrics::Metrics;
use crate::utils::{Clock, SystemClock};

use super::publisher::EventPublisher;

// ============================================================================
// Event Sourcing Service - load, decide, append, publish
// ============================================================================
//
// Generic over the aggregate type. Responsibilities:
// 1. Rebuild state from the nearest snapshot plus the events after it
// 2. Run commands against the state at an expected version
// 3. Append the resulting events behind the head-version check
// 4. Stage outbound messages in the same write batch
// 5. Collapse history into a snapshot event
//
// ============================================================================

pub struct EventSourcingService<A: Aggregate> {
    repo: Arc<dyn EventSourcingRepo>,
    serializer: Arc<dyn EventSerializer<A::Event>>,
    patcher: Arc<EventPatcher>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    _phantom: PhantomData<fn() -> A>,
}

impl<A: Aggregate> Clone for EventSourcingService<A> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            serializer: self.serializer.clone(),
            patcher: self.patcher.clone(),
            publisher: self.publisher.clone(),
            clock: self.clock.clone(),
            metrics: self.metrics.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<A: Aggregate> EventSourcingService<A> {
    pub fn new(
        repo: Arc<dyn EventSourcingRepo>,
        serializer: Arc<dyn EventSerializer<A::Event>>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            repo,
            serializer,
            patcher: Arc::new(EventPatcher::new()),
            publisher,
            clock: Arc::new(SystemClock),
            metrics: None,
            _phantom: PhantomData,
        }
    }

    pub fn with_patcher(mut self, patcher: Arc<EventPatcher>) -> Self {
        self.patcher = patcher;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn aggregate_type(&self) -> AggregateType {
        A::aggregate_type()
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// State of the aggregate at exactly `version`
    pub async fn aggregate(
        &self,
        aggregate_id: &AggregateId,
        version: Version,
    ) -> Result<VersionedAggregate<A>, EventSourcingError> {
        let aggregate_type = A::aggregate_type();
        let head = self
            .repo
            .find_current_version(aggregate_id, &aggregate_type)
            .await?
            .ok_or_else(|| self.not_found(aggregate_id))?;

        if version.is_after(head) {
            return Err(self.corrupted(
                aggregate_id,
                format!("requested version {} is beyond head {}", version, head),
            ));
        }

        self.load(aggregate_id, version).await
    }

    /// State of the aggregate at its highest stored version
    pub async fn aggregate_latest(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<VersionedAggregate<A>, EventSourcingError> {
        let head = self
            .repo
            .find_current_version(aggregate_id, &A::aggregate_type())
            .await?
            .ok_or_else(|| self.not_found(aggregate_id))?;

        self.load(aggregate_id, head).await
    }

    /// Head version, `None` when the aggregate was never created
    pub async fn current_version(
        &self,
        aggregate_id: &AggregateId,
    ) -> Result<Option<Version>, EventSourcingError> {
        Ok(self
            .repo
            .find_current_version(aggregate_id, &A::aggregate_type())
            .await?)
    }

    async fn load(
        &self,
        aggregate_id: &AggregateId,
        version: Version,
    ) -> Result<VersionedAggregate<A>, EventSourcingError> {
        let aggregate_type = A::aggregate_type();

        let snapshot = self
            .repo
            .find_nearest_snapshot_event(aggregate_id, &aggregate_type, version)
            .await?;

        let (mut state, mut next_version) = match snapshot {
            Some(record) => {
                let snapshot_version = record.aggregate_version();
                let event = self.decode(record)?;
                let state = A::apply_first_event(&event.event)
                    .map_err(|e| EventSourcingError::Apply(Box::new(e)))?;
                (Some(state), snapshot_version.next())
            }
            None => (None, Version::zero()),
        };

        let records = self
            .repo
            .find_events(aggregate_id, &aggregate_type, next_version)
            .await?;

        let mut replayed = 0usize;
        for record in records {
            let record_version = record.aggregate_version();
            if record_version.is_after(version) {
                break;
            }
            // A collapse that committed after the snapshot lookup replaced
            // the events below it; restart the fold from the new snapshot.
            if record.is_snapshot() && !record_version.is_before(next_version) {
                let event = self.decode(record)?;
                state = Some(
                    A::apply_first_event(&event.event)
                        .map_err(|e| EventSourcingError::Apply(Box::new(e)))?,
                );
                next_version = record_version.next();
                replayed = 0;
                continue;
            }
            if record_version != next_version {
                return Err(self.corrupted(
                    aggregate_id,
                    format!("expected version {} but found {}", next_version, record_version),
                ));
            }

            let event = self.decode(record)?;
            state = A::fold(state, std::iter::once(&event.event))
                .map_err(|e| EventSourcingError::Apply(Box::new(e)))?;
            next_version = next_version.next();
            replayed += 1;
        }

        let Some(aggregate) = state else {
            return Err(self.corrupted(aggregate_id, "no events found".to_string()));
        };

        if next_version != version.next() {
            return Err(self.corrupted(
                aggregate_id,
                format!("stream ends before version {}", version),
            ));
        }

        tracing::debug!(
            aggregate_id = %aggregate_id,
            aggregate_type = %aggregate_type,
            version = version.value(),
            replayed = replayed,
            "Loaded aggregate"
        );

        Ok(VersionedAggregate::new(aggregate, version))
    }

    fn decode(&self, record: EventRecord) -> Result<EventWithMetadata<A::Event>, EventSourcingError> {
        let record = self.patcher.patch(record);
        Ok(self.serializer.deserialize_with_metadata(record)?)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Run `command` against the aggregate at `expected_version`.
    /// Returns the version after the emitted events.
    pub async fn dispatch_command(
        &self,
        aggregate_id: &AggregateId,
        expected_version: Version,
        agent: &Agent,
        command: &A::Command,
    ) -> Result<Version, EventSourcingError> {
        let result = self
            .dispatch_at(aggregate_id, expected_version, agent, command)
            .await;
        self.record_outcome(&result);
        result
    }

    /// Run `command` against the latest version, or create the aggregate
    /// when it does not exist yet.
    pub async fn dispatch_command_to_latest(
        &self,
        aggregate_id: &AggregateId,
        agent: &Agent,
        command: &A::Command,
    ) -> Result<Version, EventSourcingError> {
        let result = match self.current_version(aggregate_id).await {
            Ok(Some(head)) => self.dispatch_at(aggregate_id, head, agent, command).await,
            Ok(None) => self.execute(aggregate_id, None, agent, command).await,
            Err(e) => Err(e),
        };
        self.record_outcome(&result);
        result
    }

    async fn dispatch_at(
        &self,
        aggregate_id: &AggregateId,
        expected_version: Version,
        agent: &Agent,
        command: &A::Command,
    ) -> Result<Version, EventSourcingError> {
        let head = self
            .current_version(aggregate_id)
            .await?
            .ok_or_else(|| self.not_found(aggregate_id))?;

        // Fail fast on a stale caller; the conditional write still guards races
        if head != expected_version {
            return Err(EventSourcingError::AggregateVersionOutdated {
                aggregate_id: aggregate_id.clone(),
                aggregate_type: A::aggregate_type(),
                expected: Some(expected_version),
            });
        }

        let current = self.load(aggregate_id, expected_version).await?;
        self.execute(aggregate_id, Some(current), agent, command).await
    }

    async fn execute(
        &self,
        aggregate_id: &AggregateId,
        current: Option<VersionedAggregate<A>>,
        agent: &Agent,
        command: &A::Command,
    ) -> Result<Version, EventSourcingError> {
        let aggregate_type = A::aggregate_type();
        let expected_version = current.as_ref().map(|c| c.version);

        let events = A::handle_command(current.as_ref().map(|c| &c.aggregate), command)
            .map_err(|e| EventSourcingError::Command(Box::new(e)))?;

        if events.is_empty() {
            tracing::debug!(
                aggregate_id = %aggregate_id,
                aggregate_type = %aggregate_type,
                "Command emitted no events"
            );
            // A creation command that emits nothing leaves no aggregate behind
            return expected_version.ok_or_else(|| self.not_found(aggregate_id));
        }

        let now = self.clock.now();
        let mut new_version = expected_version.map(Version::next).unwrap_or_else(Version::zero);
        let mut records = Vec::with_capacity(events.len());

        for (offset, event) in events.into_iter().enumerate() {
            if offset > 0 {
                new_version = new_version.next();
            }
            let with_metadata = EventWithMetadata::new(
                event,
                aggregate_id.clone(),
                aggregate_type.clone(),
                new_version,
                agent.clone(),
                now,
            );
            records.push(self.serializer.serialize_with_metadata(&with_metadata)?);
        }

        let mut batch = WriteBatch::new();
        batch.append(StreamAppend {
            aggregate_id: aggregate_id.clone(),
            aggregate_type: aggregate_type.clone(),
            expected_version,
            events: records.clone(),
        });

        for record in &records {
            self.publisher.publish(&mut batch, record)?;
        }

        let outbox_count = batch.outbox.len();
        self.repo.insert(batch).await?;

        tracing::info!(
            aggregate_id = %aggregate_id,
            aggregate_type = %aggregate_type,
            new_version = new_version.value(),
            event_count = records.len(),
            outbox_entries = outbox_count,
            agent = %agent,
            "✅ Appended events"
        );

        Ok(new_version)
    }

    fn record_outcome(&self, result: &Result<Version, EventSourcingError>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let outcome = match result {
            Ok(_) => "ok",
            Err(EventSourcingError::Command(_)) => "rejected",
            Err(EventSourcingError::AggregateVersionOutdated { .. }) => "conflict",
            Err(_) => "error",
        };
        metrics.record_command(A::aggregate_type().as_str(), outcome);
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Replace the events up to `version` with one snapshot event.
    /// Returns `false` when a snapshot already covers that version.
    pub async fn collapse_events(
        &self,
        aggregate_id: &AggregateId,
        version: Version,
        agent: &Agent,
    ) -> Result<bool, EventSourcingError> {
        let aggregate_type = A::aggregate_type();

        let existing = self
            .repo
            .find_nearest_snapshot_event(aggregate_id, &aggregate_type, version)
            .await?;
        if existing.is_some_and(|snapshot| snapshot.aggregate_version() == version) {
            tracing::debug!(
                aggregate_id = %aggregate_id,
                aggregate_type = %aggregate_type,
                version = version.value(),
                "Snapshot already exists, nothing to collapse"
            );
            return Ok(false);
        }

        let current = self.aggregate(aggregate_id, version).await?;

        let mut snapshot = EventWithMetadata::new(
            current.aggregate.to_snapshot(),
            aggregate_id.clone(),
            aggregate_type.clone(),
            version,
            agent.clone(),
            self.clock.now(),
        );
        snapshot.metadata.is_snapshot = true;

        let mut batch = WriteBatch::new();
        batch.snapshot(self.serializer.serialize_with_metadata(&snapshot)?);
        self.repo.insert(batch).await?;

        tracing::info!(
            aggregate_id = %aggregate_id,
            aggregate_type = %aggregate_type,
            version = version.value(),
            "📦 Collapsed events into snapshot"
        );

        Ok(true)
    }

    // ========================================================================
    // Errors
    // ========================================================================

    fn not_found(&self, aggregate_id: &AggregateId) -> EventSourcingError {
        EventSourcingError::AggregateNotFound {
            aggregate_id: aggregate_id.clone(),
            aggregate_type: A::aggregate_type(),
        }
    }

    fn corrupted(&self, aggregate_id: &AggregateId, reason: String) -> EventSourcingError {
        EventSourcingError::CorruptedEventStream {
            aggregate_id: aggregate_id.clone(),
            aggregate_type: A::aggregate_type(),
            reason,
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
    use crate::event_sourcing::core::{Event, EventName, JsonEventSerializer, SerializedEvent};
    use crate::event_sourcing::service::publisher::NoopEventPublisher;
    use crate::event_sourcing::store::EventSourcingRepo;
    use crate::event_sourcing::core::{PublishError, StoreError};
    use crate::messaging::outbox::MessagingOutboxEntry;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};
    use std::sync::Mutex;

    // A counter is enough to exercise folding, snapshots and conflicts.
    #[derive(Debug, Clone, PartialEq)]
    struct Counter {
        value: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum CounterEvent {
        #[serde(rename = "CREATED")]
        Created { start: i64 },
        #[serde(rename = "ADDED")]
        Added { amount: i64 },
        #[serde(rename = "SNAPSHOT")]
        Snapshot { value: i64 },
    }

    impl Event for CounterEvent {
        fn name(&self) -> EventName {
            let name = match self {
                CounterEvent::Created { .. } => "CREATED",
                CounterEvent::Added { .. } => "ADDED",
                CounterEvent::Snapshot { .. } => "SNAPSHOT",
            };
            EventName::new(name).unwrap()
        }

        fn is_snapshot(&self) -> bool {
            matches!(self, CounterEvent::Snapshot { .. })
        }
    }

    enum CounterCommand {
        Create(i64),
        Add(Vec<i64>),
    }

    #[derive(Debug, thiserror::Error)]
    enum CounterError {
        #[error("counter already exists")]
        AlreadyExists,
        #[error("counter does not exist")]
        Missing,
        #[error("unexpected event")]
        UnexpectedEvent,
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;
        type Command = CounterCommand;
        type Error = CounterError;

        fn aggregate_type() -> AggregateType {
            AggregateType::new("COUNTER").unwrap()
        }

        fn apply_first_event(event: &CounterEvent) -> Result<Self, CounterError> {
            match event {
                CounterEvent::Created { start } => Ok(Counter { value: *start }),
                CounterEvent::Snapshot { value } => Ok(Counter { value: *value }),
                CounterEvent::Added { .. } => Err(CounterError::UnexpectedEvent),
            }
        }

        fn apply_event(self, event: &CounterEvent) -> Result<Self, CounterError> {
            match event {
                CounterEvent::Added { amount } => Ok(Counter {
                    value: self.value + amount,
                }),
                _ => Err(CounterError::UnexpectedEvent),
            }
        }

        fn handle_command(
            aggregate: Option<&Self>,
            command: &CounterCommand,
        ) -> Result<Vec<CounterEvent>, CounterError> {
            match (aggregate, command) {
                (None, CounterCommand::Create(start)) => Ok(vec![CounterEvent::Created { start: *start }]),
                (Some(_), CounterCommand::Create(_)) => Err(CounterError::AlreadyExists),
                (None, CounterCommand::Add(_)) => Err(CounterError::Missing),
                (Some(_), CounterCommand::Add(amounts)) => Ok(amounts
                    .iter()
                    .map(|amount| CounterEvent::Added { amount: *amount })
                    .collect()),
            }
        }

        fn to_snapshot(&self) -> CounterEvent {
            CounterEvent::Snapshot { value: self.value }
        }
    }

    fn service(store: Arc<InMemoryStore>) -> EventSourcingService<Counter> {
        EventSourcingService::new(
            store,
            Arc::new(JsonEventSerializer::<CounterEvent>::new()),
            Arc::new(NoopEventPublisher),
        )
    }

    fn id(value: &str) -> AggregateId {
        AggregateId::new(value).unwrap()
    }

    /// Commits a prepared batch from "another writer" just before the
    /// wrapped call reaches the store.
    #[derive(Default)]
    struct InterleavedRepo {
        inner: Arc<InMemoryStore>,
        before_find_events: Mutex<Option<WriteBatch>>,
        before_insert: Mutex<Option<WriteBatch>>,
    }

    impl InterleavedRepo {
        async fn commit_pending(&self, slot: &Mutex<Option<WriteBatch>>) -> Result<(), StoreError> {
            let pending = slot.lock().unwrap().take();
            if let Some(batch) = pending {
                self.inner.insert(batch).await?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EventSourcingRepo for InterleavedRepo {
        async fn insert(&self, batch: WriteBatch) -> Result<(), StoreError> {
            self.commit_pending(&self.before_insert).await?;
            self.inner.insert(batch).await
        }

        async fn find_nearest_snapshot_event(
            &self,
            aggregate_id: &AggregateId,
            aggregate_type: &AggregateType,
            version: Version,
        ) -> Result<Option<EventRecord>, StoreError> {
            self.inner
                .find_nearest_snapshot_event(aggregate_id, aggregate_type, version)
                .await
        }

        async fn find_latest_snapshot_event(
            &self,
            aggregate_id: &AggregateId,
            aggregate_type: &AggregateType,
        ) -> Result<Option<EventRecord>, StoreError> {
            self.inner.find_latest_snapshot_event(aggregate_id, aggregate_type).await
        }

        async fn find_events(
            &self,
            aggregate_id: &AggregateId,
            aggregate_type: &AggregateType,
            from: Version,
        ) -> Result<Vec<EventRecord>, StoreError> {
            self.commit_pending(&self.before_find_events).await?;
            self.inner.find_events(aggregate_id, aggregate_type, from).await
        }

        async fn find_events_until_version(
            &self,
            aggregate_id: &AggregateId,
            aggregate_type: &AggregateType,
            until: Version,
        ) -> Result<Vec<EventRecord>, StoreError> {
            self.inner
                .find_events_until_version(aggregate_id, aggregate_type, until)
                .await
        }

        async fn remove_events_until_version(
            &self,
            aggregate_id: &AggregateId,
            aggregate_type: &AggregateType,
            until: Version,
        ) -> Result<u64, StoreError> {
            self.inner
                .remove_events_until_version(aggregate_id, aggregate_type, until)
                .await
        }

        async fn find_current_version(
            &self,
            aggregate_id: &AggregateId,
            aggregate_type: &AggregateType,
        ) -> Result<Option<Version>, StoreError> {
            self.inner.find_current_version(aggregate_id, aggregate_type).await
        }
    }

    /// Stages one outbox entry per event, routed by event name
    struct StagingPublisher;

    impl EventPublisher for StagingPublisher {
        fn publish(&self, batch: &mut WriteBatch, event: &EventRecord) -> Result<(), PublishError> {
            let entry = MessagingOutboxEntry::new(
                "counter",
                event.event.name.as_str(),
                Map::new(),
                event.metadata.date,
            )
            .unwrap();
            batch.stage_outbox([entry]);
            Ok(())
        }
    }

    fn counter_record(event: CounterEvent, version: u64) -> EventRecord {
        JsonEventSerializer::<CounterEvent>::new()
            .serialize_with_metadata(&EventWithMetadata::new(
                event,
                id("c-1"),
                Counter::aggregate_type(),
                Version::new(version),
                Agent::system(),
                chrono::Utc::now(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_dispatch_assigns_contiguous_versions() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(store.clone());
        let agent = Agent::system();

        let created = service
            .dispatch_command_to_latest(&id("c-1"), &agent, &CounterCommand::Create(10))
            .await
            .unwrap();
        assert_eq!(created, Version::zero());

        let version = service
            .dispatch_command(&id("c-1"), created, &agent, &CounterCommand::Add(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(version, Version::new(3));

        let stored = store
            .find_events(&id("c-1"), &Counter::aggregate_type(), Version::zero())
            .await
            .unwrap();
        let versions: Vec<u64> = stored.iter().map(|r| r.aggregate_version().value()).collect();
        assert_eq!(versions, vec![0, 1, 2, 3]);

        let latest = service.aggregate_latest(&id("c-1")).await.unwrap();
        assert_eq!(latest.aggregate.value, 16);
        assert_eq!(latest.version, Version::new(3));

        let pinned = service.aggregate(&id("c-1"), Version::new(1)).await.unwrap();
        assert_eq!(pinned.aggregate.value, 11);
    }

    #[tokio::test]
    async fn test_unknown_aggregate_is_not_found() {
        let service = service(Arc::new(InMemoryStore::new()));

        let err = service.aggregate_latest(&id("missing")).await.unwrap_err();
        assert!(err.is_not_found());

        let err = service
            .dispatch_command(&id("missing"), Version::zero(), &Agent::system(), &CounterCommand::Add(vec![1]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_version_beyond_head_is_corrupted() {
        let service = service(Arc::new(InMemoryStore::new()));
        service
            .dispatch_command_to_latest(&id("c-1"), &Agent::system(), &CounterCommand::Create(0))
            .await
            .unwrap();

        let err = service.aggregate(&id("c-1"), Version::new(5)).await.unwrap_err();
        assert!(matches!(err, EventSourcingError::CorruptedEventStream { .. }));
    }

    #[tokio::test]
    async fn test_stale_dispatch_conflicts_and_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(store.clone());
        let agent = Agent::system();

        service
            .dispatch_command_to_latest(&id("c-1"), &agent, &CounterCommand::Create(0))
            .await
            .unwrap();
        service
            .dispatch_command(&id("c-1"), Version::zero(), &agent, &CounterCommand::Add(vec![1]))
            .await
            .unwrap();

        let err = service
            .dispatch_command(&id("c-1"), Version::zero(), &agent, &CounterCommand::Add(vec![5]))
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());

        let latest = service.aggregate_latest(&id("c-1")).await.unwrap();
        assert_eq!(latest.version, Version::new(1));
        assert_eq!(latest.aggregate.value, 1);
    }

    #[tokio::test]
    async fn test_lost_append_race_conflicts_and_writes_nothing() {
        let repo = Arc::new(InterleavedRepo::default());
        let service = EventSourcingService::<Counter>::new(
            repo.clone(),
            Arc::new(JsonEventSerializer::<CounterEvent>::new()),
            Arc::new(StagingPublisher),
        );
        let agent = Agent::system();

        service
            .dispatch_command_to_latest(&id("c-1"), &agent, &CounterCommand::Create(0))
            .await
            .unwrap();

        // A concurrent writer appends v1 after our head check passed
        let mut rival = WriteBatch::new();
        rival
            .append(StreamAppend {
                aggregate_id: id("c-1"),
                aggregate_type: Counter::aggregate_type(),
                expected_version: Some(Version::zero()),
                events: vec![counter_record(CounterEvent::Added { amount: 1 }, 1)],
            })
            .stage_outbox([MessagingOutboxEntry::new("counter", "RIVAL", Map::new(), chrono::Utc::now()).unwrap()]);
        *repo.before_insert.lock().unwrap() = Some(rival);

        let err = service
            .dispatch_command(&id("c-1"), Version::zero(), &agent, &CounterCommand::Add(vec![5, 6]))
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());

        let stored = repo
            .inner
            .find_events(&id("c-1"), &Counter::aggregate_type(), Version::zero())
            .await
            .unwrap();
        let versions: Vec<u64> = stored.iter().map(|r| r.aggregate_version().value()).collect();
        assert_eq!(versions, vec![0, 1]);

        let routing_keys: Vec<String> = repo
            .inner
            .outbox_entries()
            .into_iter()
            .map(|entry| entry.routing_key)
            .collect();
        assert_eq!(routing_keys, vec!["CREATED".to_string(), "RIVAL".to_string()]);

        assert_eq!(service.aggregate_latest(&id("c-1")).await.unwrap().aggregate.value, 1);
    }

    #[tokio::test]
    async fn test_load_survives_collapse_between_reads() {
        let repo = Arc::new(InterleavedRepo::default());
        let service = EventSourcingService::<Counter>::new(
            repo.clone(),
            Arc::new(JsonEventSerializer::<CounterEvent>::new()),
            Arc::new(NoopEventPublisher),
        );
        let agent = Agent::system();

        service
            .dispatch_command_to_latest(&id("c-1"), &agent, &CounterCommand::Create(10))
            .await
            .unwrap();
        service
            .dispatch_command(&id("c-1"), Version::zero(), &agent, &CounterCommand::Add(vec![1, 2]))
            .await
            .unwrap();

        // Collapse at v1 commits after the snapshot lookup found nothing
        let mut collapse = WriteBatch::new();
        collapse.snapshot(counter_record(CounterEvent::Snapshot { value: 11 }, 1));
        *repo.before_find_events.lock().unwrap() = Some(collapse);

        let latest = service.aggregate_latest(&id("c-1")).await.unwrap();
        assert_eq!(latest.version, Version::new(2));
        assert_eq!(latest.aggregate.value, 13);
        assert!(repo.before_find_events.lock().unwrap().is_none());

        let stored = repo
            .inner
            .find_events(&id("c-1"), &Counter::aggregate_type(), Version::zero())
            .await
            .unwrap();
        assert!(stored[0].is_snapshot());
    }

    #[tokio::test]
    async fn test_command_without_events_keeps_version() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(store.clone());
        let agent = Agent::system();

        service
            .dispatch_command_to_latest(&id("c-1"), &agent, &CounterCommand::Create(0))
            .await
            .unwrap();
        let version = service
            .dispatch_command(&id("c-1"), Version::zero(), &agent, &CounterCommand::Add(vec![]))
            .await
            .unwrap();

        assert_eq!(version, Version::zero());
        assert_eq!(
            store.find_current_version(&id("c-1"), &Counter::aggregate_type()).await.unwrap(),
            Some(Version::zero())
        );
    }

    #[tokio::test]
    async fn test_rejected_command_exposes_domain_error() {
        let service = service(Arc::new(InMemoryStore::new()));
        let agent = Agent::system();

        service
            .dispatch_command_to_latest(&id("c-1"), &agent, &CounterCommand::Create(0))
            .await
            .unwrap();
        let err = service
            .dispatch_command_to_latest(&id("c-1"), &agent, &CounterCommand::Create(0))
            .await
            .unwrap_err();

        assert!(matches!(err.command_error::<CounterError>(), Some(CounterError::AlreadyExists)));
    }

    #[tokio::test]
    async fn test_collapse_preserves_state_with_fewer_events() {
        let store = Arc::new(InMemoryStore::new());
        let service = service(store.clone());
        let agent = Agent::system();

        service
            .dispatch_command_to_latest(&id("c-1"), &agent, &CounterCommand::Create(1))
            .await
            .unwrap();
        service
            .dispatch_command(&id("c-1"), Version::zero(), &agent, &CounterCommand::Add(vec![2, 3, 4, 5]))
            .await
            .unwrap();

        let before = service.aggregate_latest(&id("c-1")).await.unwrap();
        let stored_before = store
            .find_events(&id("c-1"), &Counter::aggregate_type(), Version::zero())
            .await
            .unwrap()
            .len();

        assert!(service.collapse_events(&id("c-1"), Version::new(3), &agent).await.unwrap());
        // Second collapse at the same version is a no-op
        assert!(!service.collapse_events(&id("c-1"), Version::new(3), &agent).await.unwrap());

        let after = service.aggregate_latest(&id("c-1")).await.unwrap();
        let stored_after = store
            .find_events(&id("c-1"), &Counter::aggregate_type(), Version::zero())
            .await
            .unwrap();

        assert_eq!(before, after);
        assert!(stored_after.len() < stored_before);
        assert!(stored_after[0].is_snapshot());
        assert_eq!(stored_after[0].aggregate_version(), Version::new(3));

        // Appends continue after the collapse
        let version = service
            .dispatch_command(&id("c-1"), Version::new(4), &agent, &CounterCommand::Add(vec![10]))
            .await
            .unwrap();
        assert_eq!(version, Version::new(5));
        assert_eq!(service.aggregate_latest(&id("c-1")).await.unwrap().aggregate.value, 25);
    }

    #[tokio::test]
    async fn test_patched_events_are_replayed() {
        let store = Arc::new(InMemoryStore::new());
        let patcher = EventPatcher::new().with_patch(
            Counter::aggregate_type(),
            EventName::new("CREATED").unwrap(),
            Version::zero(),
            |event: SerializedEvent| {
                let start = event.payload.get("initial").cloned().unwrap_or(Value::from(0));
                event
                    .with_field("start", start)
                    .with_version(Version::new(1))
            },
        );
        let service = service(store.clone()).with_patcher(Arc::new(patcher));

        // Legacy event stored with the old field name
        let legacy = EventRecord {
            metadata: crate::event_sourcing::core::EventMetadata {
                aggregate_id: id("c-1"),
                aggregate_type: Counter::aggregate_type(),
                aggregate_version: Version::zero(),
                agent: Agent::system(),
                date: chrono::Utc::now(),
                is_snapshot: false,
            },
            event: SerializedEvent::new(
                EventName::new("CREATED").unwrap(),
                Version::zero(),
                serde_json::json!({ "initial": 7 }).as_object().cloned().unwrap(),
            ),
        };
        let mut batch = WriteBatch::new();
        batch.append(StreamAppend {
            aggregate_id: id("c-1"),
            aggregate_type: Counter::aggregate_type(),
            expected_version: None,
            events: vec![legacy],
        });
        store.insert(batch).await.unwrap();

        let loaded = service.aggregate_latest(&id("c-1")).await.unwrap();
        assert_eq!(loaded.aggregate.value, 7);
    }

    #[tokio::test]
    async fn test_metrics_record_outcomes() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let service = service(Arc::new(InMemoryStore::new())).with_metrics(metrics.clone());
        let agent = Agent::system();

        service
            .dispatch_command_to_latest(&id("c-1"), &agent, &CounterCommand::Create(0))
            .await
            .unwrap();
        let _ = service
            .dispatch_command(&id("c-1"), Version::new(7), &agent, &CounterCommand::Add(vec![1]))
            .await;

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("commands_dispatched_total{aggregate_type=\"COUNTER\",outcome=\"ok\"} 1"));
        assert!(text.contains("aggregate_version_conflicts_total{aggregate_type=\"COUNTER\"} 1"));
    }
}
