use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storefront_core::config::Settings;
use storefront_core::db::InMemoryStore;
use storefront_core::domain::offer::{OfferChanges, OfferService, Price};
use storefront_core::event_sourcing::{Agent, AggregateService, EventSourcingRepo};
use storefront_core::messaging::{
    headers, IncomingMessageId, IncomingMessageRepo, InMemoryBroker, MessageBroker, MessagingEventPublisher,
    MessagingInbox, MessagingOutbox, MessagingOutboxChangeStream, MessagingOutboxRepo,
};
use storefront_core::metrics::Metrics;
use storefront_core::permissions::AllowAll;

/// Repository ports, all served by one store
struct Stores {
    events: Arc<dyn EventSourcingRepo>,
    outbox: Arc<dyn MessagingOutboxRepo>,
    inbox: Arc<dyn IncomingMessageRepo>,
}

impl Stores {
    fn from_store<S>(store: Arc<S>) -> Self
    where
        S: EventSourcingRepo + MessagingOutboxRepo + IncomingMessageRepo + 'static,
    {
        Self {
            events: store.clone(),
            outbox: store.clone(),
            inbox: store,
        }
    }
}

#[cfg(feature = "postgres")]
async fn connect_stores(settings: &Settings) -> anyhow::Result<Stores> {
    if let Some(url) = &settings.database_url {
        let store = storefront_core::db::PostgresStore::connect(url).await?;
        store.ensure_schema().await?;
        return Ok(Stores::from_store(Arc::new(store)));
    }
    tracing::info!("DATABASE_URL not set, using the in-memory store");
    Ok(Stores::from_store(Arc::new(InMemoryStore::new())))
}

#[cfg(not(feature = "postgres"))]
async fn connect_stores(_settings: &Settings) -> anyhow::Result<Stores> {
    Ok(Stores::from_store(Arc::new(InMemoryStore::new())))
}

#[cfg(feature = "kafka")]
fn connect_broker(settings: &Settings, local: &InMemoryBroker) -> anyhow::Result<Arc<dyn MessageBroker>> {
    if let Some(brokers) = &settings.kafka_brokers {
        tracing::info!(brokers = %brokers, "📡 Publishing to Kafka");
        return Ok(Arc::new(storefront_core::messaging::KafkaBroker::new(brokers)?));
    }
    Ok(Arc::new(local.clone()))
}

#[cfg(not(feature = "kafka"))]
fn connect_broker(_settings: &Settings, local: &InMemoryBroker) -> anyhow::Result<Arc<dyn MessageBroker>> {
    Ok(Arc::new(local.clone()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO, overridable with RUST_LOG
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,storefront_core=debug")),
        )
        .init();

    tracing::info!("🚀 Starting storefront outbox demo");

    let settings = Settings::from_env()?;
    let metrics = Arc::new(Metrics::new()?);

    // === 1. Adapters ===
    let stores = connect_stores(&settings).await?;
    let local_broker = InMemoryBroker::new();
    let broker = connect_broker(&settings, &local_broker)?;

    // === 2. Outbox publisher + change stream ===
    let outbox = Arc::new(
        MessagingOutbox::new(stores.outbox.clone(), broker, settings.outbox.clone())
            .with_metrics(metrics.clone()),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher_task = outbox.clone().start(shutdown_rx.clone());
    let change_stream_task = MessagingOutboxChangeStream::new(
        outbox.clone(),
        stores.outbox.clone(),
        settings.change_stream.clone(),
    )
    .with_metrics(metrics.clone())
    .start(shutdown_rx.clone());

    // === 3. Inbox-deduplicating consumer ===
    let inbox = Arc::new(MessagingInbox::new(stores.inbox.clone()).with_metrics(metrics.clone()));
    let mut deliveries = local_broker.subscribe("offer");
    let mut consumer_shutdown = shutdown_rx.clone();
    let consumer_task = tokio::spawn(async move {
        loop {
            let delivery = tokio::select! {
                _ = consumer_shutdown.changed() => break,
                delivery = deliveries.next() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            let message_id = match IncomingMessageId::new(delivery.id.to_string()) {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping message without id");
                    continue;
                }
            };

            // Deliver twice to show redeliveries being skipped
            for _ in 0..2 {
                let delivery = delivery.clone();
                let result = inbox
                    .handle_once(&message_id, || async move {
                        tracing::info!(
                            routing_key = %delivery.routing_key,
                            aggregate_id = delivery.header(headers::AGGREGATE_ID).unwrap_or("-"),
                            version = delivery.header(headers::AGGREGATE_VERSION).unwrap_or("-"),
                            "📨 Consumed event"
                        );
                        Ok::<_, std::io::Error>(())
                    })
                    .await;

                match result {
                    Ok(Some(())) => {}
                    Ok(None) => tracing::info!(message_id = %message_id, "♻️ Redelivery skipped"),
                    Err(e) => tracing::error!(message_id = %message_id, error = %e, "Consumer failed"),
                }
            }
        }
    });

    // === 4. Offer lifecycle ===
    let offers = OfferService::new(
        stores.events.clone(),
        Arc::new(MessagingEventPublisher::new(outbox.clone())),
        Arc::new(AllowAll),
    )
    .with_metrics(metrics.clone());
    let agent = Agent::user("demo-user")?;

    let (offer_id, v0) = offers
        .create(&agent, "Portrait session", "One hour in the studio", Price::new(15000, "EUR")?)
        .await?;
    let v1 = offers
        .update(
            &offer_id,
            v0,
            &agent,
            OfferChanges {
                price: Some(Price::new(12000, "EUR")?),
                ..Default::default()
            },
        )
        .await?;
    let v2 = offers.publish(&offer_id, v1, &agent).await?;

    // A stale writer loses
    if let Err(e) = offers.publish(&offer_id, v1, &agent).await {
        tracing::info!(error = %e, "⚠️ Stale command rejected");
    }

    offers.collapse_events(&offer_id, v2, &Agent::system()).await?;
    let offer = offers.get_or_throw(&offer_id).await?;
    tracing::info!(
        offer_id = %offer_id,
        version = %offer.version,
        price = %offer.aggregate.price,
        status = ?offer.aggregate.status,
        "📦 Offer state"
    );

    // === 5. Let the outbox drain, then stop ===
    tokio::time::sleep(Duration::from_secs(3)).await;

    let _ = shutdown_tx.send(true);
    for task in [publisher_task, change_stream_task, consumer_task] {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    tracing::debug!(metrics = %metrics.encode_text()?, "📊 Final metrics");
    tracing::info!("🎉 Demo complete!");
    Ok(())
}
