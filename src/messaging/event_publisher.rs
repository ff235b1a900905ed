use std::collections::BTreeMap;
use std::sync::Arc;

use crate::event_sourcing::{EventPublisher, EventRecord, PublishError, WriteBatch};

use super::outbox::{MessagingOutbox, MessagingOutboxEntry};

/// Envelope header names carried by every event message
pub mod headers {
    pub const AGGREGATE_ID: &str = "aggregateId";
    pub const AGGREGATE_TYPE: &str = "aggregateType";
    pub const AGGREGATE_VERSION: &str = "aggregateVersion";
    pub const EVENT_NAME: &str = "eventName";
    pub const EVENT_VERSION: &str = "eventVersion";
    pub const AGENT_TYPE: &str = "agentType";
    pub const AGENT_ID: &str = "agentId";
    pub const DATE: &str = "date";
    pub const IS_SNAPSHOT: &str = "isSnapshot";
}

/// Exchange an aggregate type's events are published to
pub fn exchange_for(record: &EventRecord) -> String {
    record.metadata.aggregate_type.as_str().to_lowercase()
}

/// Routing key of one event kind
pub fn routing_key_for(record: &EventRecord) -> String {
    format!("events.{}", record.event.name.as_str().to_lowercase())
}

/// `EventPublisher` that turns each committed event into an outbox entry.
///
/// This is the only place where events are translated to wire messages.
pub struct MessagingEventPublisher {
    outbox: Arc<MessagingOutbox>,
}

impl MessagingEventPublisher {
    pub fn new(outbox: Arc<MessagingOutbox>) -> Self {
        Self { outbox }
    }

    pub fn to_entry(record: &EventRecord) -> Result<MessagingOutboxEntry, PublishError> {
        let metadata = &record.metadata;

        let mut envelope = BTreeMap::new();
        envelope.insert(headers::AGGREGATE_ID.to_string(), metadata.aggregate_id.to_string());
        envelope.insert(headers::AGGREGATE_TYPE.to_string(), metadata.aggregate_type.to_string());
        envelope.insert(
            headers::AGGREGATE_VERSION.to_string(),
            metadata.aggregate_version.to_string(),
        );
        envelope.insert(headers::EVENT_NAME.to_string(), record.event.name.to_string());
        envelope.insert(headers::EVENT_VERSION.to_string(), record.event.version.to_string());
        envelope.insert(headers::AGENT_TYPE.to_string(), metadata.agent.agent_type().to_string());
        if let Some(agent_id) = metadata.agent.id() {
            envelope.insert(headers::AGENT_ID.to_string(), agent_id.to_string());
        }
        envelope.insert(headers::DATE.to_string(), metadata.date.to_rfc3339());
        envelope.insert(headers::IS_SNAPSHOT.to_string(), metadata.is_snapshot.to_string());

        let entry = MessagingOutboxEntry::new(
            exchange_for(record),
            routing_key_for(record),
            record.event.payload.clone(),
            metadata.date,
        )
        .map_err(|e| PublishError::Message(e.to_string()))?;

        Ok(entry.with_headers(envelope))
    }
}

impl EventPublisher for MessagingEventPublisher {
    fn publish(&self, batch: &mut WriteBatch, event: &EventRecord) -> Result<(), PublishError> {
        let entry = Self::to_entry(event)?;

        tracing::debug!(
            entry_id = %entry.id,
            target = %entry.target,
            routing_key = %entry.routing_key,
            aggregate_version = event.metadata.aggregate_version.value(),
            "Staged event message in outbox"
        );

        self.outbox.insert(batch, vec![entry]);
        Ok(())
    }
}
