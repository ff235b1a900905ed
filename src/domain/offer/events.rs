use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_sourcing::{Event, EventName, Version};

use super::value_objects::{OfferStatus, Price};

// ============================================================================
// Offer Events
// ============================================================================
//
// Wire names are the serde tags. CREATED is at schema version 1: version 0
// stored the title under `name`, see `OfferService::patcher`.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OfferEvent {
    #[serde(rename = "CREATED")]
    Created {
        title: String,
        description: String,
        price: Price,
    },

    #[serde(rename = "UPDATED")]
    Updated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        price: Option<Price>,
    },

    #[serde(rename = "PUBLISHED")]
    Published,

    #[serde(rename = "DELETED")]
    Deleted { deleted_at: DateTime<Utc> },

    /// Complete state, written by `collapse_events`
    #[serde(rename = "SNAPSHOT")]
    Snapshot {
        title: String,
        description: String,
        price: Price,
        status: OfferStatus,
        #[serde(default)]
        deleted_at: Option<DateTime<Utc>>,
    },
}

impl OfferEvent {
    pub const CREATED: &'static str = "CREATED";
    pub const UPDATED: &'static str = "UPDATED";
    pub const PUBLISHED: &'static str = "PUBLISHED";
    pub const DELETED: &'static str = "DELETED";
    pub const SNAPSHOT: &'static str = "SNAPSHOT";

    /// Schema version CREATED events are written at
    pub const CREATED_VERSION: u64 = 1;
}

impl Event for OfferEvent {
    fn name(&self) -> EventName {
        EventName::from_static(match self {
            OfferEvent::Created { .. } => Self::CREATED,
            OfferEvent::Updated { .. } => Self::UPDATED,
            OfferEvent::Published => Self::PUBLISHED,
            OfferEvent::Deleted { .. } => Self::DELETED,
            OfferEvent::Snapshot { .. } => Self::SNAPSHOT,
        })
    }

    fn version(&self) -> Version {
        match self {
            OfferEvent::Created { .. } => Version::new(Self::CREATED_VERSION),
            _ => Version::zero(),
        }
    }

    fn is_snapshot(&self) -> bool {
        matches!(self, OfferEvent::Snapshot { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::{EventSerializer, JsonEventSerializer};

    #[test]
    fn test_created_payload_shape() {
        let serializer = JsonEventSerializer::<OfferEvent>::new();
        let event = OfferEvent::Created {
            title: "Portrait session".to_string(),
            description: "One hour".to_string(),
            price: Price::new(15000, "EUR").unwrap(),
        };

        let serialized = serializer.serialize(&event).unwrap();
        assert_eq!(serialized.name.as_str(), "CREATED");
        assert_eq!(serialized.version, Version::new(1));
        assert_eq!(serialized.payload["title"], "Portrait session");
        assert_eq!(serialized.payload["price"]["amount"], 15000);

        assert_eq!(serializer.deserialize(serialized).unwrap(), event);
    }

    #[test]
    fn test_published_has_empty_payload() {
        let serializer = JsonEventSerializer::<OfferEvent>::new();
        let serialized = serializer.serialize(&OfferEvent::Published).unwrap();
        assert!(serialized.payload.is_empty());
        assert_eq!(serializer.deserialize(serialized).unwrap(), OfferEvent::Published);
    }

    #[test]
    fn test_partial_update_omits_unchanged_fields() {
        let serializer = JsonEventSerializer::<OfferEvent>::new();
        let serialized = serializer
            .serialize(&OfferEvent::Updated {
                title: None,
                description: None,
                price: Some(Price::new(900, "EUR").unwrap()),
            })
            .unwrap();
        assert_eq!(serialized.payload.len(), 1);
        assert!(serialized.payload.contains_key("price"));
    }
}
