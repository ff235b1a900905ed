// ============================================================================
// Event Sourcing Store - Generic Persistence Layer
// ============================================================================
//
// Persistence port for event streams. Adapters live in src/db/.
//
// ============================================================================

pub mod repository;

pub use repository::{EventSourcingRepo, StreamAppend, WriteBatch};
