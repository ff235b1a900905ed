// ============================================================================
// Messaging - transactional outbox, inbox and broker adapters
// ============================================================================

pub mod broker;
pub mod event_publisher;
pub mod inbox;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod outbox;

pub use broker::{BrokerError, InMemoryBroker, MessageBroker};
pub use event_publisher::{headers, MessagingEventPublisher};
pub use inbox::{IncomingMessage, IncomingMessageId, IncomingMessageRepo, InboxError, MessagingInbox};
#[cfg(feature = "kafka")]
pub use kafka::KafkaBroker;
pub use outbox::{
    LockToken, MessagingOutbox, MessagingOutboxChangeStream, MessagingOutboxEntry,
    MessagingOutboxRepo, OutboxError, PublishReport,
};
