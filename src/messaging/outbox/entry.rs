use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::event_sourcing::ValidationError;

// ============================================================================
// Outbox Entry - durable outbound message plus delivery state
// ============================================================================
//
// Lifecycle:
//   created (unlocked) -> locked by a worker -> acknowledged (terminal)
//                                            -> failed, unlocked for retry
//   acknowledged entries are garbage-collected after the retention period.
//
// ============================================================================

/// Identifies one publish cycle's claim on a batch of entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagingOutboxEntry {
    /// Time-ordered (UUID v7) so ties on `created_at` keep insertion order
    pub id: Uuid,
    /// Exchange the message goes to
    pub target: String,
    pub routing_key: String,
    pub payload: Map<String, Value>,
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_token: Option<LockToken>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// First failure of the current failing streak; kept across retries
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl MessagingOutboxEntry {
    pub fn new(
        target: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Map<String, Value>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let target = target.into();
        let routing_key = routing_key.into();

        if target.trim().is_empty() {
            return Err(ValidationError::Blank("outbox target"));
        }
        if routing_key.trim().is_empty() {
            return Err(ValidationError::Blank("outbox routing key"));
        }

        Ok(Self {
            id: Uuid::now_v7(),
            target,
            routing_key,
            payload,
            headers: BTreeMap::new(),
            created_at,
            locked_at: None,
            lock_token: None,
            acknowledged_at: None,
            failed_at: None,
            retry_count: 0,
            last_error: None,
        })
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn is_locked(&self) -> bool {
        self.lock_token.is_some()
    }

    pub fn is_locked_by(&self, token: &LockToken) -> bool {
        self.lock_token.as_ref() == Some(token)
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    /// Last attempt failed and the entry has not been delivered since
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some() && !self.is_acknowledged()
    }

    /// Eligible for the next lock: unlocked and not yet acknowledged
    pub fn is_publishable(&self) -> bool {
        !self.is_locked() && !self.is_acknowledged()
    }

    pub fn lock(&mut self, token: LockToken, now: DateTime<Utc>) {
        self.lock_token = Some(token);
        self.locked_at = Some(now);
    }

    pub fn unlock(&mut self) {
        self.lock_token = None;
        self.locked_at = None;
    }

    pub fn acknowledge(&mut self, now: DateTime<Utc>) {
        self.acknowledged_at = Some(now);
        self.failed_at = None;
        self.unlock();
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.failed_at.get_or_insert(now);
        self.last_error = Some(error.into());
        self.unlock();
    }
}
