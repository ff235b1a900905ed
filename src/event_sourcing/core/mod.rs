// ============================================================================
// Event Sourcing Core - Generic Infrastructure Abstractions
// ============================================================================
//
// This module contains GENERIC, reusable event sourcing infrastructure
// that works with ANY domain aggregate.
//
// Key Principles:
// - No domain-specific code (no Offer, User, Notification, etc.)
// - Generic over aggregate types
// - Identifiers are validated on construction
//
// ============================================================================

pub mod aggregate;
pub mod errors;
pub mod event;
pub mod identity;
pub mod patcher;

// Re-export core types for convenience
pub use aggregate::{Aggregate, VersionedAggregate};
pub use errors::{EventSourcingError, PublishError, SerializationError, StoreError, ValidationError};
pub use event::{
    Event, EventMetadata, EventRecord, EventSerializer, EventWithMetadata, JsonEventSerializer,
    SerializedEvent,
};
pub use identity::{Agent, AgentId, AggregateId, AggregateType, EventName, Version};
pub use patcher::{EventPatcher, PatchFn};
