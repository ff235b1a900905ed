use super::identity::{AggregateId, AggregateType, EventName, Version};

// ============================================================================
// Event Sourcing Errors
// ============================================================================

/// Malformed identifiers or values, rejected at construction time
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} must not be blank")]
    Blank(&'static str),

    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("event {name} v{version} could not be decoded: {source}")]
    Decode {
        name: EventName,
        version: Version,
        #[source]
        source: serde_json::Error,
    },

    #[error("event could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("event payload must be a JSON object, got {0}")]
    NotAnObject(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Failures raised by storage adapters
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The conditional write on the aggregate head lost the race
    #[error("version conflict on {aggregate_type}/{aggregate_id}: expected {expected:?}")]
    Conflict {
        aggregate_id: AggregateId,
        aggregate_type: AggregateType,
        expected: Option<Version>,
    },

    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("stored data is invalid: {0}")]
    Corrupted(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("could not build outbound message: {0}")]
    Message(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EventSourcingError {
    #[error("aggregate not found: {aggregate_type}/{aggregate_id}")]
    AggregateNotFound {
        aggregate_id: AggregateId,
        aggregate_type: AggregateType,
    },

    #[error(
        "aggregate {aggregate_type}/{aggregate_id} is outdated: expected version {expected:?}"
    )]
    AggregateVersionOutdated {
        aggregate_id: AggregateId,
        aggregate_type: AggregateType,
        expected: Option<Version>,
    },

    #[error("event stream of {aggregate_type}/{aggregate_id} is corrupted: {reason}")]
    CorruptedEventStream {
        aggregate_id: AggregateId,
        aggregate_type: AggregateType,
        reason: String,
    },

    /// The aggregate rejected the command (business rule violation)
    #[error("command rejected: {0}")]
    Command(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Folding a stored event into the aggregate failed
    #[error("failed to apply event: {0}")]
    Apply(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EventSourcingError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict {
                aggregate_id,
                aggregate_type,
                expected,
            } => EventSourcingError::AggregateVersionOutdated {
                aggregate_id,
                aggregate_type,
                expected,
            },
            other => EventSourcingError::Store(other),
        }
    }
}

impl EventSourcingError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EventSourcingError::AggregateNotFound { .. })
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, EventSourcingError::AggregateVersionOutdated { .. })
    }

    /// Borrow the domain error behind a rejected command
    pub fn command_error<E: std::error::Error + 'static>(&self) -> Option<&E> {
        match self {
            EventSourcingError::Command(source) => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}
