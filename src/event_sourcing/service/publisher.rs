use crate::event_sourcing::core::{EventRecord, PublishError};
use crate::event_sourcing::store::WriteBatch;

/// Turns committed events into outbound messages.
///
/// Publishing stages messages in the same `WriteBatch` as the event append,
/// so an event is published if and only if it is stored.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, batch: &mut WriteBatch, event: &EventRecord) -> Result<(), PublishError>;
}

/// Publisher for aggregates whose events stay internal
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventPublisher;

impl EventPublisher for NoopEventPublisher {
    fn publish(&self, _batch: &mut WriteBatch, _event: &EventRecord) -> Result<(), PublishError> {
        Ok(())
    }
}
