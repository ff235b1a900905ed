// ============================================================================
// storefront_core - event-sourced aggregates with a transactional outbox
// ============================================================================
//
// Layers:
// - event_sourcing: aggregates, events, patches, snapshots, the service
// - messaging: outbox (publish loop + change stream), inbox, brokers
// - db: storage adapters implementing every repository port
// - domain: feature aggregates built on the above
//
// ============================================================================

pub mod config;
pub mod db;
pub mod domain;
pub mod event_sourcing;
pub mod messaging;
pub mod metrics;
pub mod permissions;
pub mod utils;
