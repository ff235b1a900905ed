use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::event::{EventRecord, SerializedEvent};
use super::identity::{AggregateType, EventName, Version};

// ============================================================================
// Event Patcher - schema migration on read
// ============================================================================
//
// Stored events keep the schema version they were written with. When the
// code moves on, a patch registered for (aggregate type, event name,
// from_version) rewrites the old payload before it is deserialized.
// Patches chain: v0 -> v1 -> v2 ...
//
// ============================================================================

pub type PatchFn = Arc<dyn Fn(SerializedEvent) -> SerializedEvent + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventPatcher {
    patches: HashMap<(AggregateType, EventName), BTreeMap<Version, PatchFn>>,
}

impl EventPatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a patch for events stored at exactly `from_version`.
    /// A later registration for the same key replaces the earlier one.
    pub fn register<F>(
        &mut self,
        aggregate_type: AggregateType,
        event_name: EventName,
        from_version: Version,
        patch: F,
    ) -> &mut Self
    where
        F: Fn(SerializedEvent) -> SerializedEvent + Send + Sync + 'static,
    {
        self.patches
            .entry((aggregate_type, event_name))
            .or_default()
            .insert(from_version, Arc::new(patch));
        self
    }

    /// Builder-style registration
    pub fn with_patch<F>(
        mut self,
        aggregate_type: AggregateType,
        event_name: EventName,
        from_version: Version,
        patch: F,
    ) -> Self
    where
        F: Fn(SerializedEvent) -> SerializedEvent + Send + Sync + 'static,
    {
        self.register(aggregate_type, event_name, from_version, patch);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn patch(&self, record: EventRecord) -> EventRecord {
        let EventRecord { metadata, event } = record;
        let event = self.patch_event(&metadata.aggregate_type, event);
        EventRecord { metadata, event }
    }

    pub fn patch_event(&self, aggregate_type: &AggregateType, event: SerializedEvent) -> SerializedEvent {
        let Some(patches) = self
            .patches
            .get(&(aggregate_type.clone(), event.name.clone()))
        else {
            return event;
        };

        let mut event = event;
        for (from_version, patch) in patches.range(event.version..) {
            if *from_version != event.version {
                // No patch for the current version: nothing further can apply.
                break;
            }

            let before = event.version;
            event = patch(event);

            // A patch must move the event forward, otherwise chaining stalls.
            if !event.version.is_after(before) {
                event.version = before.next();
            }

            tracing::debug!(
                aggregate_type = %aggregate_type,
                event_name = %event.name,
                from_version = %before,
                to_version = %event.version,
                "Patched stored event"
            );
        }

        event
    }
}

impl std::fmt::Debug for EventPatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<_> = self
            .patches
            .iter()
            .map(|((aggregate_type, name), versions)| {
                format!("{}/{}: {:?}", aggregate_type, name, versions.keys().collect::<Vec<_>>())
            })
            .collect();
        f.debug_struct("EventPatcher").field("patches", &keys).finish()
    }
}
