use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::ValidationError;

// ============================================================================
// Identity & Ordering Primitives
// ============================================================================

macro_rules! non_blank_string {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(ValidationError::Blank($field));
                }
                Ok(Self(value))
            }

            /// For names fixed in code. Blank literals are a programming error.
            pub fn from_static(value: &'static str) -> Self {
                debug_assert!(!value.trim().is_empty(), concat!("blank ", $field));
                Self(value.to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValidationError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ValidationError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

non_blank_string!(
    /// Identifies one aggregate instance
    AggregateId,
    "aggregate id"
);

non_blank_string!(
    /// Names an aggregate kind; the lower-cased form is its exchange name
    AggregateType,
    "aggregate type"
);

non_blank_string!(
    /// Names an event kind, e.g. `CREATED`
    EventName,
    "event name"
);

non_blank_string!(AgentId, "agent id");

impl AggregateId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid.to_string())
    }
}

/// Aggregate version, also used as event schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Version of the first event of an aggregate
    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn previous(self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }

    pub fn is_after(self, other: Version) -> bool {
        self.0 > other.0
    }

    pub fn is_before(self, other: Version) -> bool {
        self.0 < other.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Who caused a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Agent {
    User(AgentId),
    System,
}

impl Agent {
    pub fn user(id: impl Into<String>) -> Result<Self, ValidationError> {
        Ok(Agent::User(AgentId::new(id)?))
    }

    pub fn system() -> Self {
        Agent::System
    }

    pub fn agent_type(&self) -> &'static str {
        match self {
            Agent::User(_) => "USER",
            Agent::System => "SYSTEM",
        }
    }

    pub fn id(&self) -> Option<&AgentId> {
        match self {
            Agent::User(id) => Some(id),
            Agent::System => None,
        }
    }

    /// Inverse of `agent_type` / `id`, used when reading stored metadata
    pub fn from_parts(agent_type: &str, agent_id: Option<&str>) -> Result<Self, ValidationError> {
        match (agent_type, agent_id) {
            ("SYSTEM", _) => Ok(Agent::System),
            ("USER", Some(id)) => Agent::user(id),
            ("USER", None) => Err(ValidationError::Blank("agent id")),
            (other, _) => Err(ValidationError::UnknownAgentType(other.to_string())),
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Agent::User(id) => write!(f, "USER:{}", id),
            Agent::System => f.write_str("SYSTEM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_identifiers_are_rejected() {
        assert!(AggregateId::new("").is_err());
        assert!(AggregateId::new("   ").is_err());
        assert!(AggregateType::new("\t").is_err());
        assert!(EventName::new("").is_err());
        assert_eq!(AggregateId::new("offer-1").unwrap().as_str(), "offer-1");
    }

    #[test]
    fn test_identifier_deserialization_validates() {
        let ok: AggregateType = serde_json::from_str("\"OFFER\"").unwrap();
        assert_eq!(ok.as_str(), "OFFER");

        let blank = serde_json::from_str::<AggregateType>("\"\"");
        assert!(blank.is_err());
    }

    #[test]
    fn test_version_ordering() {
        let zero = Version::zero();
        assert_eq!(zero.value(), 0);
        assert_eq!(zero.next(), Version::new(1));
        assert!(zero.next().is_after(zero));
        assert!(zero.is_before(zero.next()));
        assert_eq!(zero.previous(), None);
        assert_eq!(Version::new(3).previous(), Some(Version::new(2)));
    }

    #[test]
    fn test_agent_parts_round_trip() {
        let user = Agent::user("user-7").unwrap();
        assert_eq!(user.agent_type(), "USER");
        assert_eq!(user.id().map(|id| id.as_str()), Some("user-7"));
        assert_eq!(Agent::from_parts("USER", Some("user-7")).unwrap(), user);

        assert_eq!(Agent::system().agent_type(), "SYSTEM");
        assert_eq!(Agent::from_parts("SYSTEM", None).unwrap(), Agent::System);
        assert!(Agent::from_parts("ROBOT", None).is_err());
    }
}
