use anyhow::Result;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::OutboxEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

use crate::store::OrderStore;

const BATCH_SIZE: i64 = 100;

/// Where recorded notification events end up.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> Result<()>;
}

pub fn topic_for(event_type: &str) -> &'static str {
    match event_type {
        "OrderPlaced" | "OrderCancelled" | "OrderStatusChanged" => "order-events",
        "PaymentConfirmed" => "payment-events",
        "ReservationExpired" | "DrumsReturned" => "inventory-events",
        _ => "notification-events",
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        let json = serde_json::to_string(&event.event_data)?;
        let key = event.aggregate_id.to_string();
        let record = FutureRecord::to(topic_for(&event.event_type))
            .payload(&json)
            .key(&key);

        self.producer.send(record, Duration::from_secs(5)).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}

/// Stand-in sink when no broker is configured.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        info!(
            "[{}] {} for order {}: {}",
            topic_for(&event.event_type),
            event.event_type,
            event.aggregate_id,
            event.event_data
        );
        Ok(())
    }
}

pub struct OutboxProcessor {
    store: Arc<dyn OrderStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl OutboxProcessor {
    pub fn new(store: Arc<dyn OrderStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    /// Publishes one batch, oldest first. Returns how many went out.
    pub async fn process_outbox_events(&self) -> Result<usize> {
        let unprocessed_events = self.store.unpublished_events(BATCH_SIZE).await?;

        let mut published = 0;
        for event in unprocessed_events {
            if let Err(e) = self.publisher.publish(&event).await {
                error!("Failed to publish event {}: {}", event.id, e);
                continue;
            }

            self.store.mark_published(event.id).await?;
            published += 1;
            info!("Published outbox event: {}", event.id);
        }

        Ok(published)
    }
}
