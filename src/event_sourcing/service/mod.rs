// ============================================================================
// Event Sourcing Services
// ============================================================================
//
// - EventSourcingService: generic load / dispatch / collapse engine
// - AggregateService: per-aggregate typed façade
// - EventPublisher: hook that stages outbound messages for new events
//
// ============================================================================

pub mod aggregate_service;
pub mod event_sourcing_service;
pub mod publisher;

pub use aggregate_service::AggregateService;
pub use event_sourcing_service::EventSourcingService;
pub use publisher::{EventPublisher, NoopEventPublisher};
