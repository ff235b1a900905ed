// ============================================================================
// Transactional Outbox
// ============================================================================
//
// Outbound messages are written in the same batch as the state change that
// produced them, then delivered by a background publish loop. A change
// stream on inserts shortens the delay between commit and delivery.
//
// ============================================================================

pub mod change_stream;
pub mod entry;
pub mod messaging_outbox;
pub mod repository;

pub use change_stream::MessagingOutboxChangeStream;
pub use entry::{LockToken, MessagingOutboxEntry};
pub use messaging_outbox::{MessagingOutbox, OutboxError, PublishReport};
pub use repository::MessagingOutboxRepo;
