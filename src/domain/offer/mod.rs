// ============================================================================
// Offer Domain - priced services listed on the storefront
// ============================================================================
//
// An offer is created as a draft, can be edited and published, and is soft
// deleted. Every change is an event; `OfferService` is the entry point.
//
// ============================================================================

pub mod aggregate;
pub mod commands;
pub mod errors;
pub mod events;
pub mod service;
pub mod value_objects;

pub use aggregate::Offer;
pub use commands::OfferCommand;
pub use errors::OfferError;
pub use events::OfferEvent;
pub use service::{OfferChanges, OfferService};
pub use value_objects::{OfferId, OfferStatus, Price};
