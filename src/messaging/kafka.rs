use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use std::time::Duration;

use super::broker::{BrokerError, MessageBroker};
use super::event_publisher::headers;
use super::outbox::MessagingOutboxEntry;

/// Header carrying the routing key; Kafka has no native equivalent
pub const ROUTING_KEY_HEADER: &str = "routingKey";

/// Kafka/Redpanda broker. Exchange maps to topic, the aggregate id (when
/// present) to the record key so one aggregate's events share a partition.
pub struct KafkaBroker {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaBroker {
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BrokerError::Unavailable(format!("failed to create producer: {}", e)))?;

        Ok(Self {
            producer,
            send_timeout: Duration::from_secs(5),
        })
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    fn record_key(entry: &MessagingOutboxEntry) -> String {
        entry
            .header(headers::AGGREGATE_ID)
            .map(str::to_string)
            .unwrap_or_else(|| entry.id.to_string())
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn publish(&self, entry: &MessagingOutboxEntry) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(&entry.payload).map_err(|e| BrokerError::Encode(e.to_string()))?;
        let key = Self::record_key(entry);
        let message_id = entry.id.to_string();

        let mut kafka_headers = OwnedHeaders::new()
            .insert(Header {
                key: "messageId",
                value: Some(message_id.as_str()),
            })
            .insert(Header {
                key: ROUTING_KEY_HEADER,
                value: Some(entry.routing_key.as_str()),
            });
        for (name, value) in &entry.headers {
            kafka_headers = kafka_headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&entry.target)
            .key(&key)
            .payload(&payload)
            .headers(kafka_headers);

        self.producer
            .send(record, rdkafka::util::Timeout::After(self.send_timeout))
            .await
            .map_err(|(e, _)| BrokerError::Publish(format!("Kafka send error: {}", e)))?;

        tracing::debug!(
            topic = %entry.target,
            key = %key,
            routing_key = %entry.routing_key,
            "Published to Kafka"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;

    #[test]
    fn test_record_key_prefers_aggregate_id() {
        let entry = MessagingOutboxEntry::new("offer", "events.created", Map::new(), Utc::now())
            .unwrap()
            .with_header(headers::AGGREGATE_ID, "offer-1");
        assert_eq!(KafkaBroker::record_key(&entry), "offer-1");

        let standalone = MessagingOutboxEntry::new("mail", "commands.send", Map::new(), Utc::now()).unwrap();
        assert_eq!(KafkaBroker::record_key(&standalone), standalone.id.to_string());
    }
}
