use super::event::Event;
use super::identity::{AggregateType, Version};

// ============================================================================
// Aggregate Root Pattern - Event Sourcing Core
// ============================================================================
//
// 1. State is derived from events (never stored directly)
// 2. Commands are validated before emitting events
// 3. Events represent facts that have already happened
// 4. A snapshot event restores the full state in one step
//
// ============================================================================

/// Generic Aggregate trait - all event-sourced aggregates implement this
///
/// Type Parameters:
/// - `Event`: the domain event type for this aggregate
/// - `Command`: the command type for this aggregate
/// - `Error`: business rule violations
pub trait Aggregate: Sized + Clone + Send + Sync + 'static {
    type Event: Event;
    type Command: Send + Sync;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Aggregate kind; also names the exchange its events are published to
    fn aggregate_type() -> AggregateType;

    /// Create the aggregate from its first event (or from a snapshot event)
    fn apply_first_event(event: &Self::Event) -> Result<Self, Self::Error>;

    /// Apply subsequent events to update state
    fn apply_event(self, event: &Self::Event) -> Result<Self, Self::Error>;

    /// Decide which events a command produces. `aggregate` is `None` when the
    /// aggregate does not exist yet.
    fn handle_command(
        aggregate: Option<&Self>,
        command: &Self::Command,
    ) -> Result<Vec<Self::Event>, Self::Error>;

    /// Snapshot event carrying the complete current state
    fn to_snapshot(&self) -> Self::Event;

    /// Fold a sequence of events, starting from an optional state
    fn fold<'a, I>(start: Option<Self>, events: I) -> Result<Option<Self>, Self::Error>
    where
        I: IntoIterator<Item = &'a Self::Event>,
    {
        let mut state = start;
        for event in events {
            state = Some(match state {
                None => Self::apply_first_event(event)?,
                Some(_) if event.is_snapshot() => Self::apply_first_event(event)?,
                Some(current) => current.apply_event(event)?,
            });
        }
        Ok(state)
    }
}

/// Aggregate state pinned to the version it was folded at
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedAggregate<A> {
    pub aggregate: A,
    pub version: Version,
}

impl<A> VersionedAggregate<A> {
    pub fn new(aggregate: A, version: Version) -> Self {
        Self { aggregate, version }
    }

    pub fn into_inner(self) -> A {
        self.aggregate
    }
}
