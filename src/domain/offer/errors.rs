// ============================================================================
// Offer Business Rule Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OfferError {
    #[error("Offer already exists")]
    AlreadyExists,

    #[error("Offer does not exist")]
    NotInitialized,

    #[error("Offer is deleted")]
    Deleted,

    #[error("Offer is already published")]
    AlreadyPublished,

    #[error("Offer title cannot be blank")]
    BlankTitle,

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("Update changes nothing")]
    EmptyUpdate,

    #[error("Agent is not allowed to {0}")]
    Forbidden(&'static str),

    #[error("{0} cannot start an offer's history")]
    UnexpectedFirstEvent(String),
}
