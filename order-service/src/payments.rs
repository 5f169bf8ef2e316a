use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::Message;
use shared::PaymentNotice;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::OrderError;
use crate::handlers::{OrderService, PaymentConfirmation};

const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Consumes settlement notices from the GCash payment intent integration.
///
/// Offsets are committed only once a notice has been applied or rejected for
/// good; infrastructure failures hold the partition and retry with backoff.
pub struct PaymentNoticeHandler {
    orders: Arc<OrderService>,
    initial_backoff: Duration,
}

impl PaymentNoticeHandler {
    pub fn new(orders: Arc<OrderService>) -> Self {
        Self {
            orders,
            initial_backoff: INITIAL_RETRY_BACKOFF,
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    if let Some(payload) = m.payload_view::<str>() {
                        match payload {
                            Ok(json_str) => match serde_json::from_str::<PaymentNotice>(json_str) {
                                Ok(notice) => {
                                    let received_at = m
                                        .timestamp()
                                        .to_millis()
                                        .and_then(DateTime::from_timestamp_millis)
                                        .unwrap_or_else(Utc::now);
                                    self.handle_until_done(notice, received_at).await;
                                }
                                Err(e) => warn!("Skipping malformed payment notice: {}", e),
                            },
                            Err(e) => error!("Error parsing payload: {}", e),
                        }
                    }
                    if let Err(e) = consumer.commit_message(&m, rdkafka::consumer::CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    /// Retries `handle_notice` until the notice is applied or rejected. The
    /// expiry check keeps using `received_at`, so waiting out an outage never
    /// turns a timely payment into a late one.
    pub async fn handle_until_done(&self, notice: PaymentNotice, received_at: DateTime<Utc>) {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.handle_notice(notice.clone(), received_at).await {
                Ok(()) => return,
                Err(e) => {
                    error!(
                        "Payment {} for order {} failed on attempt {}, retrying in {:?}: {}",
                        notice.reference, notice.order_id, attempt, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                    attempt += 1;
                }
            }
        }
    }

    /// Applies one notice. A rejected payment (expired reservation, cancelled
    /// order) is logged and swallowed; only infrastructure failures bubble up.
    pub async fn handle_notice(&self, notice: PaymentNotice, now: DateTime<Utc>) -> Result<()> {
        let confirmation = PaymentConfirmation {
            payment_status: notice.payment_status,
            reference: Some(notice.reference.clone()),
        };

        match self.orders.confirm_payment(notice.order_id, confirmation, now).await {
            Ok(order) => {
                info!(
                    "Payment {} applied to order {}, now {}",
                    notice.reference, order.id, order.payment_status
                );
                Ok(())
            }
            Err(e @ (OrderError::Storage(_) | OrderError::Conflict(_))) => Err(e.into()),
            Err(OrderError::Ledger(e)) if !e.is_rejection() => Err(e.into()),
            Err(e) => {
                warn!(
                    "Payment {} for order {} was not applied: {}",
                    notice.reference, notice.order_id, e
                );
                Ok(())
            }
        }
    }
}
