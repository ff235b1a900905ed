use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::marker::PhantomData;

use super::errors::SerializationError;
use super::identity::{Agent, AggregateId, AggregateType, EventName, Version};

// ============================================================================
// Events & Metadata
// ============================================================================
//
// Three shapes of the same event:
// - `E: Event`               typed domain event the aggregate folds
// - `EventWithMetadata<E>`   typed event + who/when/which version
// - `EventRecord`            serialized form that storage, patches and the
//                            outbox publisher work with
//
// ============================================================================

/// Domain events implement this trait to be stored by the event store.
pub trait Event: Clone + Send + Sync + 'static {
    /// Event kind, e.g. `CREATED`
    fn name(&self) -> EventName;

    /// Schema version the current code writes for this event kind
    fn version(&self) -> Version {
        Version::zero()
    }

    /// Whether this event carries a full aggregate state
    fn is_snapshot(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub aggregate_id: AggregateId,
    pub aggregate_type: AggregateType,
    /// Aggregate version after this event
    pub aggregate_version: Version,
    pub agent: Agent,
    pub date: DateTime<Utc>,
    pub is_snapshot: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventWithMetadata<E> {
    pub event: E,
    pub metadata: EventMetadata,
}

impl<E: Event> EventWithMetadata<E> {
    pub fn new(
        event: E,
        aggregate_id: AggregateId,
        aggregate_type: AggregateType,
        aggregate_version: Version,
        agent: Agent,
        date: DateTime<Utc>,
    ) -> Self {
        let is_snapshot = event.is_snapshot();
        Self {
            event,
            metadata: EventMetadata {
                aggregate_id,
                aggregate_type,
                aggregate_version,
                agent,
                date,
                is_snapshot,
            },
        }
    }

    pub fn version(&self) -> Version {
        self.metadata.aggregate_version
    }
}

/// Name, schema version and field map of one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedEvent {
    pub name: EventName,
    pub version: Version,
    pub payload: Map<String, Value>,
}

impl SerializedEvent {
    pub fn new(name: EventName, version: Version, payload: Map<String, Value>) -> Self {
        Self {
            name,
            version,
            payload,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Insert or replace a payload field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Move a payload field to a new key; no-op when the field is absent
    pub fn rename_field(mut self, from: &str, to: impl Into<String>) -> Self {
        if let Some(value) = self.payload.remove(from) {
            self.payload.insert(to.into(), value);
        }
        self
    }
}

/// Stored form of an `EventWithMetadata`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub metadata: EventMetadata,
    pub event: SerializedEvent,
}

impl EventRecord {
    pub fn aggregate_version(&self) -> Version {
        self.metadata.aggregate_version
    }

    pub fn is_snapshot(&self) -> bool {
        self.metadata.is_snapshot
    }
}

// ============================================================================
// Serializer port
// ============================================================================

/// Maps typed events to primitive field maps and back. Implemented per
/// feature.
pub trait EventSerializer<E>: Send + Sync {
    fn serialize(&self, event: &E) -> Result<SerializedEvent, SerializationError>;

    fn deserialize(&self, event: SerializedEvent) -> Result<E, SerializationError>;

    fn serialize_with_metadata(
        &self,
        event: &EventWithMetadata<E>,
    ) -> Result<EventRecord, SerializationError> {
        Ok(EventRecord {
            metadata: event.metadata.clone(),
            event: self.serialize(&event.event)?,
        })
    }

    fn deserialize_with_metadata(
        &self,
        record: EventRecord,
    ) -> Result<EventWithMetadata<E>, SerializationError> {
        Ok(EventWithMetadata {
            event: self.deserialize(record.event)?,
            metadata: record.metadata,
        })
    }
}

/// Serializer for adjacently tagged serde enums
/// (`#[serde(tag = "type", content = "data")]`) whose tags equal
/// `Event::name()`.
pub struct JsonEventSerializer<E> {
    _phantom: PhantomData<fn() -> E>,
}

impl<E> JsonEventSerializer<E> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<E> Default for JsonEventSerializer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventSerializer<E> for JsonEventSerializer<E>
where
    E: Event + Serialize + DeserializeOwned,
{
    fn serialize(&self, event: &E) -> Result<SerializedEvent, SerializationError> {
        let payload = match serde_json::to_value(event)? {
            Value::Object(mut tagged) => match tagged.remove("data") {
                Some(Value::Object(fields)) => fields,
                Some(Value::Null) | None => Map::new(),
                Some(other) => return Err(SerializationError::NotAnObject(other.to_string())),
            },
            other => return Err(SerializationError::NotAnObject(other.to_string())),
        };

        Ok(SerializedEvent::new(event.name(), event.version(), payload))
    }

    fn deserialize(&self, event: SerializedEvent) -> Result<E, SerializationError> {
        let SerializedEvent {
            name,
            version,
            payload,
        } = event;

        // Unit variants serialize without a "data" key; struct variants need one.
        if payload.is_empty() {
            if let Ok(event) = serde_json::from_value(serde_json::json!({ "type": name.as_str() })) {
                return Ok(event);
            }
        }

        let tagged = serde_json::json!({
            "type": name.as_str(),
            "data": Value::Object(payload),
        });

        serde_json::from_value(tagged).map_err(|source| SerializationError::Decode {
            name,
            version,
            source,
        })
    }
}
