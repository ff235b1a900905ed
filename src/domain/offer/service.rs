use async_trait::async_trait;
use std::sync::Arc;

use crate::event_sourcing::{
    Agent, Aggregate, AggregateId, AggregateService, EventName, EventPatcher, EventPublisher,
    EventSourcingError, EventSourcingRepo, EventSourcingService, JsonEventSerializer, Version,
};
use crate::metrics::Metrics;
use crate::permissions::PermissionsService;
use crate::utils::{Clock, SystemClock};

use super::aggregate::Offer;
use super::commands::OfferCommand;
use super::errors::OfferError;
use super::events::OfferEvent;
use super::value_objects::{OfferId, Price};

// ============================================================================
// Offer Service - permission-checked entry point for offer commands
// ============================================================================

pub mod permissions {
    pub const CREATE: &str = "offer:create";
    pub const UPDATE: &str = "offer:update";
    pub const PUBLISH: &str = "offer:publish";
    pub const DELETE: &str = "offer:delete";
}

#[derive(Debug, Clone, Default)]
pub struct OfferChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<Price>,
}

pub struct OfferService {
    event_sourcing: EventSourcingService<Offer>,
    permissions: Arc<dyn PermissionsService>,
    clock: Arc<dyn Clock>,
}

impl OfferService {
    pub fn new(
        repo: Arc<dyn EventSourcingRepo>,
        publisher: Arc<dyn EventPublisher>,
        permissions: Arc<dyn PermissionsService>,
    ) -> Self {
        let event_sourcing = EventSourcingService::new(
            repo,
            Arc::new(JsonEventSerializer::<OfferEvent>::new()),
            publisher,
        )
        .with_patcher(Arc::new(Self::patcher()));

        Self {
            event_sourcing,
            permissions,
            clock: Arc::new(SystemClock),
        }
    }

    /// Upgrades stored offer events to the shapes `OfferEvent` reads
    pub fn patcher() -> EventPatcher {
        EventPatcher::new().with_patch(
            Offer::aggregate_type(),
            EventName::from_static(OfferEvent::CREATED),
            Version::zero(),
            |event| {
                event
                    .rename_field("name", "title")
                    .with_version(Version::new(OfferEvent::CREATED_VERSION))
            },
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.event_sourcing = self.event_sourcing.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.event_sourcing = self.event_sourcing.with_metrics(metrics);
        self
    }

    pub async fn create(
        &self,
        agent: &Agent,
        title: impl Into<String>,
        description: impl Into<String>,
        price: Price,
    ) -> Result<(OfferId, Version), EventSourcingError> {
        self.authorize(agent, permissions::CREATE).await?;

        let id = OfferId::generate();
        let command = OfferCommand::Create {
            title: title.into(),
            description: description.into(),
            price,
        };
        let version = self.dispatch_command_to_latest(&id, agent, &command).await?;

        tracing::info!(offer_id = %id, version = %version, "🆕 Offer created");
        Ok((id, version))
    }

    pub async fn update(
        &self,
        id: &OfferId,
        expected_version: Version,
        agent: &Agent,
        changes: OfferChanges,
    ) -> Result<Version, EventSourcingError> {
        self.authorize(agent, permissions::UPDATE).await?;

        let command = OfferCommand::Update {
            title: changes.title,
            description: changes.description,
            price: changes.price,
        };
        self.dispatch_command(id, expected_version, agent, &command).await
    }

    pub async fn publish(
        &self,
        id: &OfferId,
        expected_version: Version,
        agent: &Agent,
    ) -> Result<Version, EventSourcingError> {
        self.authorize(agent, permissions::PUBLISH).await?;
        self.dispatch_command(id, expected_version, agent, &OfferCommand::Publish)
            .await
    }

    /// Soft delete: the offer disappears from `get` but keeps its history
    pub async fn delete(
        &self,
        id: &OfferId,
        expected_version: Version,
        agent: &Agent,
    ) -> Result<Version, EventSourcingError> {
        self.authorize(agent, permissions::DELETE).await?;

        let command = OfferCommand::Delete {
            deleted_at: self.clock.now(),
        };
        let version = self.dispatch_command(id, expected_version, agent, &command).await?;

        tracing::info!(offer_id = %id, version = %version, "🗑️ Offer deleted");
        Ok(version)
    }

    async fn authorize(&self, agent: &Agent, permission: &'static str) -> Result<(), EventSourcingError> {
        if self.permissions.has_permission(agent, permission).await {
            return Ok(());
        }
        tracing::warn!(agent = %agent, permission, "Offer command forbidden");
        Err(EventSourcingError::Command(Box::new(OfferError::Forbidden(permission))))
    }
}

#[async_trait]
impl AggregateService for OfferService {
    type Aggregate = Offer;
    type Id = OfferId;

    fn event_sourcing(&self) -> &EventSourcingService<Offer> {
        &self.event_sourcing
    }

    fn to_aggregate_id(&self, id: &OfferId) -> AggregateId {
        AggregateId::from_uuid(id.as_uuid())
    }

    fn is_removed(&self, offer: &Offer) -> bool {
        offer.is_deleted()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboxConfig;
    use crate::db::InMemoryStore;
    use crate::event_sourcing::{
        AggregateType, EventMetadata, EventRecord, NoopEventPublisher, SerializedEvent, StreamAppend,
        WriteBatch,
    };
    use crate::messaging::{
        headers, IncomingMessageId, InMemoryBroker, MessagingEventPublisher, MessagingInbox, MessagingOutbox,
    };
    use crate::permissions::{AllowAll, DenyAll};
    use chrono::Utc;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn user() -> Agent {
        Agent::user("user-1").unwrap()
    }

    fn price(amount: u64) -> Price {
        Price::new(amount, "EUR").unwrap()
    }

    fn service(store: Arc<InMemoryStore>) -> OfferService {
        OfferService::new(store, Arc::new(NoopEventPublisher), Arc::new(AllowAll))
    }

    #[tokio::test]
    async fn test_create_update_and_read() {
        let offers = service(Arc::new(InMemoryStore::new()));

        let (id, created) = offers
            .create(&user(), "Portrait session", "One hour", price(15000))
            .await
            .unwrap();
        assert_eq!(created, Version::zero());

        let updated = offers
            .update(
                &id,
                created,
                &user(),
                OfferChanges {
                    price: Some(price(12000)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated, Version::new(1));

        let loaded = offers.get_or_throw(&id).await.unwrap();
        assert_eq!(loaded.version, Version::new(1));
        assert_eq!(loaded.aggregate.price, price(12000));

        let original = offers.get_or_throw_at(&id, Version::zero()).await.unwrap();
        assert_eq!(original.aggregate.price, price(15000));
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected() {
        let offers = service(Arc::new(InMemoryStore::new()));
        let (id, v0) = offers.create(&user(), "Prints", "A4", price(2500)).await.unwrap();
        let v1 = offers.publish(&id, v0, &user()).await.unwrap();

        let err = offers
            .update(
                &id,
                v0,
                &user(),
                OfferChanges {
                    title: Some("Large prints".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_version_conflict());
        assert_eq!(offers.get_or_throw(&id).await.unwrap().version, v1);
    }

    #[tokio::test]
    async fn test_deleted_offer_is_hidden() {
        let offers = service(Arc::new(InMemoryStore::new()));
        let (id, v0) = offers.create(&user(), "Prints", "A4", price(2500)).await.unwrap();

        offers.delete(&id, v0, &user()).await.unwrap();

        assert!(offers.get(&id).await.unwrap().is_none());
        assert!(offers.get_or_throw(&id).await.unwrap_err().is_not_found());
        // History is still there
        assert!(offers.get_at(&id, v0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_forbidden_agent_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let offers = OfferService::new(store.clone(), Arc::new(NoopEventPublisher), Arc::new(DenyAll));

        let err = offers
            .create(&user(), "Prints", "A4", price(2500))
            .await
            .unwrap_err();
        assert_eq!(
            err.command_error::<OfferError>(),
            Some(&OfferError::Forbidden(permissions::CREATE))
        );
    }

    #[tokio::test]
    async fn test_version_zero_created_event_is_patched() {
        let store = Arc::new(InMemoryStore::new());
        let offers = service(store.clone());
        let id = OfferId::generate();
        let aggregate_id = offers.to_aggregate_id(&id);

        // CREATED as written by the first schema: `name` instead of `title`
        let legacy = EventRecord {
            metadata: EventMetadata {
                aggregate_id: aggregate_id.clone(),
                aggregate_type: AggregateType::from_static(Offer::AGGREGATE_TYPE),
                aggregate_version: Version::zero(),
                agent: Agent::system(),
                date: Utc::now(),
                is_snapshot: false,
            },
            event: SerializedEvent::new(
                EventName::from_static(OfferEvent::CREATED),
                Version::zero(),
                json!({
                    "name": "Wedding package",
                    "description": "Full day",
                    "price": { "amount": 250000, "currency": "EUR" }
                })
                .as_object()
                .cloned()
                .unwrap(),
            ),
        };
        let mut batch = WriteBatch::new();
        batch.append(StreamAppend {
            aggregate_id,
            aggregate_type: Offer::aggregate_type(),
            expected_version: None,
            events: vec![legacy],
        });
        store.insert(batch).await.unwrap();

        let loaded = offers.get_or_throw(&id).await.unwrap();
        assert_eq!(loaded.aggregate.title, "Wedding package");
    }

    #[tokio::test]
    async fn test_collapse_keeps_state() {
        let store = Arc::new(InMemoryStore::new());
        let offers = service(store.clone());
        let (id, v0) = offers.create(&user(), "Prints", "A4", price(2500)).await.unwrap();
        let v1 = offers.publish(&id, v0, &user()).await.unwrap();
        let before = offers.get_or_throw(&id).await.unwrap();

        assert!(offers.collapse_events(&id, v1, &Agent::system()).await.unwrap());

        let after = offers.get_or_throw(&id).await.unwrap();
        assert_eq!(after, before);
        let stored = store
            .find_events(&offers.to_aggregate_id(&id), &Offer::aggregate_type(), Version::zero())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_end_to_end_redelivery_is_applied_once() {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let outbox = Arc::new(MessagingOutbox::new(
            store.clone(),
            broker.clone(),
            OutboxConfig::fast(),
        ));
        let offers = OfferService::new(
            store.clone(),
            Arc::new(MessagingEventPublisher::new(outbox.clone())),
            Arc::new(AllowAll),
        );
        let inbox = MessagingInbox::new(store.clone());
        let mut deliveries = broker.subscribe("offer");

        let (id, v0) = offers
            .create(&user(), "Portrait session", "One hour", price(15000))
            .await
            .unwrap();
        let v1 = offers
            .update(
                &id,
                v0,
                &user(),
                OfferChanges {
                    price: Some(price(12000)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!((v0, v1), (Version::zero(), Version::new(1)));

        let report = outbox.publish_next_unpublished_entries().await.unwrap();
        assert_eq!(report.published, 2);

        let created = deliveries.next().await.unwrap();
        let updated = deliveries.next().await.unwrap();
        assert_eq!(created.routing_key, "events.created");
        assert_eq!(updated.routing_key, "events.updated");
        assert_eq!(updated.header(headers::AGGREGATE_VERSION), Some("1"));

        // The projection sees `updated` twice, as after a consumer crash
        let projected_price = Arc::new(AtomicU64::new(0));
        for delivery in [created, updated.clone(), updated] {
            let message_id = IncomingMessageId::new(delivery.id.to_string()).unwrap();
            let projected_price = projected_price.clone();
            inbox
                .handle_once(&message_id, || async move {
                    if let Some(amount) = delivery.payload["price"]["amount"].as_u64() {
                        projected_price.fetch_add(amount, Ordering::SeqCst);
                    }
                    Ok::<_, std::io::Error>(())
                })
                .await
                .unwrap();
        }

        assert_eq!(projected_price.load(Ordering::SeqCst), 15000 + 12000);
        assert!(store.outbox_entries().iter().all(|entry| entry.is_acknowledged()));
    }
}
