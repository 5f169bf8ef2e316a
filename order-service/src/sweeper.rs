use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use crate::handlers::OrderService;

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub expiry_every: Duration,
    pub reminder_every: Duration,
    pub reconcile_every: Duration,
    pub ledger_retry_every: Duration,
}

/// Drives the periodic jobs: reservation expiry, payment reminders, retries
/// of outstanding ledger work and ledger reconciliation.
pub struct Scheduler {
    orders: Arc<OrderService>,
    config: ScheduleConfig,
}

impl Scheduler {
    pub fn new(orders: Arc<OrderService>, config: ScheduleConfig) -> Self {
        Self { orders, config }
    }

    pub async fn run(&self) {
        let mut expiry = time::interval(self.config.expiry_every);
        let mut reminders = time::interval(self.config.reminder_every);
        let mut reconcile = time::interval(self.config.reconcile_every);
        let mut ledger_retry = time::interval(self.config.ledger_retry_every);
        for interval in [&mut expiry, &mut reminders, &mut reconcile, &mut ledger_retry] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            "Scheduler started: expiry every {:?}, reminders every {:?}, ledger retries every {:?}, reconciliation every {:?}",
            self.config.expiry_every,
            self.config.reminder_every,
            self.config.ledger_retry_every,
            self.config.reconcile_every
        );

        loop {
            tokio::select! {
                _ = expiry.tick() => self.expire_reservations().await,
                _ = reminders.tick() => self.send_reminders().await,
                _ = ledger_retry.tick() => self.retry_ledger_work().await,
                _ = reconcile.tick() => self.reconcile().await,
            }
        }
    }

    async fn expire_reservations(&self) {
        if let Err(e) = self.orders.release_expired_reservations(Utc::now()).await {
            error!("Expiry sweep failed: {}", e);
        }
    }

    async fn send_reminders(&self) {
        match self.orders.send_payment_reminders(Utc::now()).await {
            Ok(0) => {}
            Ok(sent) => info!("Queued {} payment reminders", sent),
            Err(e) => error!("Reminder sweep failed: {}", e),
        }
    }

    async fn retry_ledger_work(&self) {
        if let Err(e) = self.orders.retry_ledger_work().await {
            error!("Ledger work retry failed: {}", e);
        }
    }

    async fn reconcile(&self) {
        if let Err(e) = self.orders.reconcile().await {
            error!("Ledger reconciliation failed: {}", e);
        }
    }
}
