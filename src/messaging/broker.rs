use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::outbox::MessagingOutboxEntry;

// ============================================================================
// Message Broker - delivery port used by the outbox
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Delivers one outbox entry to its exchange. Returning `Ok` means the
/// broker accepted the message.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, entry: &MessagingOutboxEntry) -> Result<(), BrokerError>;
}

/// Broker implementation using an in-memory broadcast channel.
///
/// Suitable for unit tests and the demo binary. Failures can be injected to
/// exercise the outbox retry path.
#[derive(Clone)]
pub struct InMemoryBroker {
    sender: Arc<broadcast::Sender<MessagingOutboxEntry>>,
    available: Arc<AtomicBool>,
    failures_remaining: Arc<AtomicU32>,
    published: Arc<AtomicU32>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
            available: Arc::new(AtomicBool::new(true)),
            failures_remaining: Arc::new(AtomicU32::new(0)),
            published: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fail the next `count` publish calls
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Reject every publish until set back to `true`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn published_count(&self) -> u32 {
        self.published.load(Ordering::SeqCst)
    }

    /// Messages published to `target` after this call. An empty target
    /// receives every exchange.
    pub fn subscribe(&self, target: &str) -> BoxStream<'static, MessagingOutboxEntry> {
        let receiver = self.sender.subscribe();
        let target = target.to_string();

        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(entry) => return Some((entry, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "InMemoryBroker subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter(move |entry| {
            let matches = target.is_empty() || entry.target == target;
            async move { matches }
        })
        .boxed()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, entry: &MessagingOutboxEntry) -> Result<(), BrokerError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("broker is down".to_string()));
        }

        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(BrokerError::Publish("injected failure".to_string()));
        }

        self.published.fetch_add(1, Ordering::SeqCst);
        // No subscribers is fine
        let _ = self.sender.send(entry.clone());

        tracing::debug!(
            entry_id = %entry.id,
            target = %entry.target,
            routing_key = %entry.routing_key,
            "Published to in-memory broker"
        );
        Ok(())
    }
}
