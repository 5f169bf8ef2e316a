use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::*;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{LedgerTask, Order, PendingPayment};

/// Orders, their pending-payment records, the notification outbox and the
/// queue of ledger work.
///
/// Every write that carries `events` or `ledger_work` stores them in the same
/// atomic step as the order change itself.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Stores a new order together with its pending-payment record.
    async fn insert_order(&self, order: &Order, events: &[NotificationEvent]) -> Result<()>;

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>>;

    /// Optimistic write. Succeeds only while the stored version still equals
    /// `order.version`, and stores `order.version + 1`. Returns `false` when
    /// somebody else wrote the order first.
    ///
    /// Settled or cancelled orders lose their pending-payment record, an order
    /// still awaiting payment has it moved to its current expiry, and a
    /// `payment_reference` is remembered as processed for this order.
    async fn update_order(
        &self,
        order: &Order,
        events: &[NotificationEvent],
        ledger_work: &[LedgerTask],
    ) -> Result<bool>;

    /// Unpaid pending/confirmed orders whose reservation ran out before `now`.
    async fn expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Order>>;

    /// Unreminded pending payments expiring in `(now, horizon]`.
    async fn reminders_due(&self, now: DateTime<Utc>, horizon: DateTime<Utc>) -> Result<Vec<PendingPayment>>;

    /// Flags the reminder as sent and records `event`, once.
    async fn mark_reminded(&self, order_id: Uuid, event: &NotificationEvent) -> Result<bool>;

    /// The order a payment reference was applied to, if any.
    async fn payment_reference_owner(&self, reference: &str) -> Result<Option<Uuid>>;

    /// Queues ledger work that has no order write to ride along with.
    async fn enqueue_ledger_work(&self, tasks: &[LedgerTask]) -> Result<()>;

    /// Outstanding work of one order, oldest first.
    async fn ledger_work_for(&self, order_id: Uuid) -> Result<Vec<LedgerTask>>;

    /// Outstanding work of every order, oldest first.
    async fn outstanding_ledger_work(&self, limit: i64) -> Result<Vec<LedgerTask>>;

    async fn complete_ledger_work(&self, task_id: Uuid) -> Result<()>;

    async fn ledger_work_failed(&self, task_id: Uuid, error: &str) -> Result<()>;

    async fn unpublished_events(&self, limit: i64) -> Result<Vec<OutboxEvent>>;

    async fn mark_published(&self, event_id: Uuid) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    orders: HashMap<Uuid, Order>,
    pending: HashMap<Uuid, PendingPayment>,
    processed_payments: HashMap<String, Uuid>,
    outbox: Vec<OutboxEvent>,
    ledger_work: Vec<LedgerTask>,
    #[cfg(test)]
    failing_writes: usize,
}

impl MemoryState {
    #[cfg(test)]
    fn check_writable(&mut self) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            anyhow::bail!("connection reset by peer");
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_writable(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Process-local order storage for running without PostgreSQL.
#[derive(Default)]
pub struct MemoryOrderStore {
    state: Mutex<MemoryState>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn recorded_events(&self) -> Vec<NotificationEvent> {
        self.state
            .lock()
            .outbox
            .iter()
            .map(|event| serde_json::from_value(event.event_data.clone()).unwrap())
            .collect()
    }

    #[cfg(test)]
    pub fn push_events(&self, events: &[NotificationEvent]) -> Result<()> {
        let rows = outbox_rows(events)?;
        self.state.lock().outbox.extend(rows);
        Ok(())
    }

    /// Makes the next `count` order inserts or updates fail.
    #[cfg(test)]
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    #[cfg(test)]
    pub fn pending_payment(&self, order_id: Uuid) -> Option<PendingPayment> {
        self.state.lock().pending.get(&order_id).cloned()
    }
}

fn outbox_rows(events: &[NotificationEvent]) -> Result<Vec<OutboxEvent>> {
    events
        .iter()
        .map(|event| OutboxEvent::new(event).map_err(anyhow::Error::from))
        .collect()
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn insert_order(&self, order: &Order, events: &[NotificationEvent]) -> Result<()> {
        let rows = outbox_rows(events)?;
        let mut state = self.state.lock();
        state.check_writable()?;
        if state.orders.contains_key(&order.id) {
            anyhow::bail!("order {} already exists", order.id);
        }
        state.orders.insert(order.id, order.clone());
        state.pending.insert(
            order.id,
            PendingPayment {
                order_id: order.id,
                customer_id: order.customer_id,
                expires_at: order.reservation_expires_at,
                reminder_sent: false,
            },
        );
        state.outbox.extend(rows);
        Ok(())
    }

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>> {
        Ok(self.state.lock().orders.get(&id).cloned())
    }

    async fn update_order(
        &self,
        order: &Order,
        events: &[NotificationEvent],
        ledger_work: &[LedgerTask],
    ) -> Result<bool> {
        let rows = outbox_rows(events)?;
        let mut state = self.state.lock();
        state.check_writable()?;
        let stored_version = match state.orders.get(&order.id) {
            Some(stored) => stored.version,
            None => anyhow::bail!("order {} does not exist", order.id),
        };
        if stored_version != order.version {
            return Ok(false);
        }

        let mut updated = order.clone();
        updated.version += 1;
        state.orders.insert(order.id, updated);

        if order.payment_status.is_settled() || order.status == OrderStatus::Cancelled {
            state.pending.remove(&order.id);
        } else if let Some(pending) = state.pending.get_mut(&order.id) {
            if pending.expires_at != order.reservation_expires_at {
                pending.expires_at = order.reservation_expires_at;
                pending.reminder_sent = false;
            }
        }
        if let Some(reference) = &order.payment_reference {
            state
                .processed_payments
                .entry(reference.clone())
                .or_insert(order.id);
        }
        state.outbox.extend(rows);
        state.ledger_work.extend_from_slice(ledger_work);
        Ok(true)
    }

    async fn expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Order>> {
        let state = self.state.lock();
        let mut expired: Vec<Order> = state
            .orders
            .values()
            .filter(|order| order.is_lapsed_reservation(now))
            .cloned()
            .collect();
        expired.sort_by_key(|order| order.reservation_expires_at);
        Ok(expired)
    }

    async fn reminders_due(&self, now: DateTime<Utc>, horizon: DateTime<Utc>) -> Result<Vec<PendingPayment>> {
        let state = self.state.lock();
        let mut due: Vec<PendingPayment> = state
            .pending
            .values()
            .filter(|pending| !pending.reminder_sent && pending.expires_at > now && pending.expires_at <= horizon)
            .cloned()
            .collect();
        due.sort_by_key(|pending| pending.expires_at);
        Ok(due)
    }

    async fn mark_reminded(&self, order_id: Uuid, event: &NotificationEvent) -> Result<bool> {
        let row = OutboxEvent::new(event)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.pending.get_mut(&order_id) {
            Some(pending) if !pending.reminder_sent => {
                pending.reminder_sent = true;
                state.outbox.push(row);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn payment_reference_owner(&self, reference: &str) -> Result<Option<Uuid>> {
        Ok(self.state.lock().processed_payments.get(reference).copied())
    }

    async fn enqueue_ledger_work(&self, tasks: &[LedgerTask]) -> Result<()> {
        self.state.lock().ledger_work.extend_from_slice(tasks);
        Ok(())
    }

    async fn ledger_work_for(&self, order_id: Uuid) -> Result<Vec<LedgerTask>> {
        Ok(self
            .state
            .lock()
            .ledger_work
            .iter()
            .filter(|task| task.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn outstanding_ledger_work(&self, limit: i64) -> Result<Vec<LedgerTask>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self.state.lock().ledger_work.iter().take(limit).cloned().collect())
    }

    async fn complete_ledger_work(&self, task_id: Uuid) -> Result<()> {
        self.state.lock().ledger_work.retain(|task| task.id != task_id);
        Ok(())
    }

    async fn ledger_work_failed(&self, task_id: Uuid, error: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(task) = state.ledger_work.iter_mut().find(|task| task.id == task_id) {
            task.attempts += 1;
            task.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn unpublished_events(&self, limit: i64) -> Result<Vec<OutboxEvent>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .state
            .lock()
            .outbox
            .iter()
            .filter(|event| !event.processed)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(event) = state.outbox.iter_mut().find(|event| event.id == event_id) {
            event.processed = true;
        }
        Ok(())
    }
}
