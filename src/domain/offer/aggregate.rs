use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event_sourcing::{Aggregate, AggregateType, Event};

use super::commands::OfferCommand;
use super::errors::OfferError;
use super::events::OfferEvent;
use super::value_objects::{OfferStatus, Price};

// ============================================================================
// Offer Aggregate - Domain Logic
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub title: String,
    pub description: String,
    pub price: Price,
    pub status: OfferStatus,
    /// Soft deletion marker; deleted offers keep their history
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Offer {
    pub const AGGREGATE_TYPE: &'static str = "OFFER";

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_published(&self) -> bool {
        self.status == OfferStatus::Published
    }

    fn ensure_active(&self) -> Result<(), OfferError> {
        if self.is_deleted() {
            return Err(OfferError::Deleted);
        }
        Ok(())
    }
}

fn validate_title(title: &str) -> Result<(), OfferError> {
    if title.trim().is_empty() {
        return Err(OfferError::BlankTitle);
    }
    Ok(())
}

// ============================================================================
// Aggregate Trait Implementation
// ============================================================================

impl Aggregate for Offer {
    type Event = OfferEvent;
    type Command = OfferCommand;
    type Error = OfferError;

    fn aggregate_type() -> AggregateType {
        AggregateType::from_static(Self::AGGREGATE_TYPE)
    }

    fn apply_first_event(event: &OfferEvent) -> Result<Self, OfferError> {
        match event {
            OfferEvent::Created {
                title,
                description,
                price,
            } => Ok(Self {
                title: title.clone(),
                description: description.clone(),
                price: price.clone(),
                status: OfferStatus::Draft,
                deleted_at: None,
            }),
            OfferEvent::Snapshot {
                title,
                description,
                price,
                status,
                deleted_at,
            } => Ok(Self {
                title: title.clone(),
                description: description.clone(),
                price: price.clone(),
                status: *status,
                deleted_at: *deleted_at,
            }),
            other => Err(OfferError::UnexpectedFirstEvent(other.name().to_string())),
        }
    }

    fn apply_event(mut self, event: &OfferEvent) -> Result<Self, OfferError> {
        match event {
            OfferEvent::Created { .. } => return Err(OfferError::AlreadyExists),
            OfferEvent::Updated {
                title,
                description,
                price,
            } => {
                if let Some(title) = title {
                    self.title = title.clone();
                }
                if let Some(description) = description {
                    self.description = description.clone();
                }
                if let Some(price) = price {
                    self.price = price.clone();
                }
            }
            OfferEvent::Published => self.status = OfferStatus::Published,
            OfferEvent::Deleted { deleted_at } => self.deleted_at = Some(*deleted_at),
            OfferEvent::Snapshot { .. } => return Self::apply_first_event(event),
        }
        Ok(self)
    }

    fn handle_command(
        aggregate: Option<&Self>,
        command: &OfferCommand,
    ) -> Result<Vec<OfferEvent>, OfferError> {
        let offer = match (aggregate, command) {
            (
                None,
                OfferCommand::Create {
                    title,
                    description,
                    price,
                },
            ) => {
                validate_title(title)?;
                return Ok(vec![OfferEvent::Created {
                    title: title.clone(),
                    description: description.clone(),
                    price: price.clone(),
                }]);
            }
            (Some(_), OfferCommand::Create { .. }) => return Err(OfferError::AlreadyExists),
            (None, _) => return Err(OfferError::NotInitialized),
            (Some(offer), _) => offer,
        };

        offer.ensure_active()?;

        match command {
            OfferCommand::Create { .. } => Err(OfferError::AlreadyExists),

            OfferCommand::Update {
                title,
                description,
                price,
            } => {
                if let Some(title) = title {
                    validate_title(title)?;
                }

                // Only fields that actually change are recorded
                let title = title.clone().filter(|t| *t != offer.title);
                let description = description.clone().filter(|d| *d != offer.description);
                let price = price.clone().filter(|p| *p != offer.price);
                if title.is_none() && description.is_none() && price.is_none() {
                    return Ok(vec![]);
                }

                Ok(vec![OfferEvent::Updated {
                    title,
                    description,
                    price,
                }])
            }

            OfferCommand::Publish => {
                if offer.is_published() {
                    return Err(OfferError::AlreadyPublished);
                }
                Ok(vec![OfferEvent::Published])
            }

            OfferCommand::Delete { deleted_at } => Ok(vec![OfferEvent::Deleted {
                deleted_at: *deleted_at,
            }]),
        }
    }

    fn to_snapshot(&self) -> OfferEvent {
        OfferEvent::Snapshot {
            title: self.title.clone(),
            description: self.description.clone(),
            price: self.price.clone(),
            status: self.status,
            deleted_at: self.deleted_at,
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create() -> OfferCommand {
        OfferCommand::Create {
            title: "Portrait session".to_string(),
            description: "One hour in the studio".to_string(),
            price: Price::new(15000, "EUR").unwrap(),
        }
    }

    fn created() -> Offer {
        let events = Offer::handle_command(None, &create()).unwrap();
        Offer::fold(None, &events).unwrap().unwrap()
    }

    #[test]
    fn test_create_starts_as_draft() {
        let offer = created();
        assert_eq!(offer.title, "Portrait session");
        assert_eq!(offer.status, OfferStatus::Draft);
        assert!(!offer.is_deleted());
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let offer = created();
        assert_eq!(
            Offer::handle_command(Some(&offer), &create()).unwrap_err(),
            OfferError::AlreadyExists
        );
    }

    #[test]
    fn test_blank_title_is_rejected() {
        let command = OfferCommand::Create {
            title: "  ".to_string(),
            description: String::new(),
            price: Price::new(100, "EUR").unwrap(),
        };
        assert_eq!(Offer::handle_command(None, &command).unwrap_err(), OfferError::BlankTitle);
    }

    #[test]
    fn test_commands_need_an_existing_offer() {
        assert_eq!(
            Offer::handle_command(None, &OfferCommand::Publish).unwrap_err(),
            OfferError::NotInitialized
        );
    }

    #[test]
    fn test_update_records_only_changed_fields() {
        let offer = created();
        let events = Offer::handle_command(
            Some(&offer),
            &OfferCommand::Update {
                title: Some("Portrait session".to_string()),
                description: None,
                price: Some(Price::new(12000, "EUR").unwrap()),
            },
        )
        .unwrap();

        assert_eq!(
            events,
            vec![OfferEvent::Updated {
                title: None,
                description: None,
                price: Some(Price::new(12000, "EUR").unwrap()),
            }]
        );

        let updated = offer.apply_event(&events[0]).unwrap();
        assert_eq!(updated.price.amount, 12000);
        assert_eq!(updated.title, "Portrait session");
    }

    #[test]
    fn test_noop_update_emits_nothing() {
        let offer = created();
        let events = Offer::handle_command(
            Some(&offer),
            &OfferCommand::Update {
                title: Some(offer.title.clone()),
                description: None,
                price: None,
            },
        )
        .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_publish_once() {
        let offer = created().apply_event(&OfferEvent::Published).unwrap();
        assert!(offer.is_published());
        assert_eq!(
            Offer::handle_command(Some(&offer), &OfferCommand::Publish).unwrap_err(),
            OfferError::AlreadyPublished
        );
    }

    #[test]
    fn test_deleted_offer_rejects_commands() {
        let offer = created()
            .apply_event(&OfferEvent::Deleted { deleted_at: Utc::now() })
            .unwrap();
        assert!(offer.is_deleted());
        assert_eq!(
            Offer::handle_command(Some(&offer), &OfferCommand::Publish).unwrap_err(),
            OfferError::Deleted
        );
    }

    #[test]
    fn test_snapshot_restores_full_state() {
        let offer = created()
            .apply_event(&OfferEvent::Published)
            .unwrap()
            .apply_event(&OfferEvent::Deleted { deleted_at: Utc::now() })
            .unwrap();

        let restored = Offer::apply_first_event(&offer.to_snapshot()).unwrap();
        assert_eq!(restored, offer);
    }

    #[test]
    fn test_history_must_start_with_creation() {
        assert!(matches!(
            Offer::apply_first_event(&OfferEvent::Published),
            Err(OfferError::UnexpectedFirstEvent(name)) if name == "PUBLISHED"
        ));
    }
}
