use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::event_sourcing::{StoreError, ValidationError};
use crate::metrics::Metrics;
use crate::utils::{Clock, SystemClock};

// ============================================================================
// Messaging Inbox - consumer-side deduplication
// ============================================================================
//
// Delivery is at-least-once, so consumers see redeliveries. The inbox keeps
// one record per transport message id; the unique key on that id is what
// rejects a second delivery.
//
// ============================================================================

/// Transport-level message id (non-blank)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IncomingMessageId(String);

impl IncomingMessageId {
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ValidationError::Blank("incoming message id"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IncomingMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IncomingMessageId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IncomingMessageId> for String {
    fn from(value: IncomingMessageId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: IncomingMessageId,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait IncomingMessageRepo: Send + Sync {
    /// Fails with `StoreError::Duplicate` when the id is already recorded
    async fn insert(&self, message: IncomingMessage) -> Result<(), StoreError>;

    async fn exists(&self, id: &IncomingMessageId) -> Result<bool, StoreError>;

    /// Returns whether a record was removed
    async fn remove(&self, id: &IncomingMessageId) -> Result<bool, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    /// Expected on redelivery; callers skip the message
    #[error("incoming message already seen: {0}")]
    AlreadySeen(IncomingMessageId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("message handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl InboxError {
    pub fn is_already_seen(&self) -> bool {
        matches!(self, InboxError::AlreadySeen(_))
    }
}

pub struct MessagingInbox {
    repo: Arc<dyn IncomingMessageRepo>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
}

impl MessagingInbox {
    pub fn new(repo: Arc<dyn IncomingMessageRepo>) -> Self {
        Self {
            repo,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Record `id` as seen. A second call for the same id fails with
    /// `InboxError::AlreadySeen`.
    pub async fn add_message(&self, id: &IncomingMessageId) -> Result<(), InboxError> {
        let message = IncomingMessage {
            id: id.clone(),
            received_at: self.clock.now(),
        };

        let result = match self.repo.insert(message).await {
            Ok(()) => Ok(()),
            Err(StoreError::Duplicate(_)) => {
                tracing::debug!(message_id = %id, "Skipping already seen message");
                Err(InboxError::AlreadySeen(id.clone()))
            }
            Err(e) => Err(InboxError::Store(e)),
        };

        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(()) => metrics.record_inbox_message(true),
                Err(InboxError::AlreadySeen(_)) => metrics.record_inbox_message(false),
                Err(_) => {}
            }
        }

        result
    }

    pub async fn has_seen(&self, id: &IncomingMessageId) -> Result<bool, InboxError> {
        Ok(self.repo.exists(id).await?)
    }

    /// Run `handler` unless `id` was seen before. Duplicates return
    /// `Ok(None)`. A failed handler un-records the id so the redelivered
    /// message is processed again.
    pub async fn handle_once<F, Fut, T, E>(
        &self,
        id: &IncomingMessageId,
        handler: F,
    ) -> Result<Option<T>, InboxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.add_message(id).await {
            Ok(()) => {}
            Err(InboxError::AlreadySeen(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        match handler().await {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                let error = e.into();
                tracing::warn!(message_id = %id, error = %error, "Message handler failed, releasing inbox record");
                if let Err(remove_error) = self.repo.remove(id).await {
                    tracing::error!(
                        message_id = %id,
                        error = %remove_error,
                        "Failed to release inbox record; redelivery will be skipped"
                    );
                }
                Err(InboxError::Handler(error))
            }
        }
    }
}
