use chrono::{DateTime, Utc};

use super::value_objects::Price;

// ============================================================================
// Offer Commands - Represent user intent
// ============================================================================

#[derive(Debug, Clone)]
pub enum OfferCommand {
    Create {
        title: String,
        description: String,
        price: Price,
    },
    Update {
        title: Option<String>,
        description: Option<String>,
        price: Option<Price>,
    },
    Publish,
    Delete {
        deleted_at: DateTime<Utc>,
    },
}
