use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use drum_ledger::{AvailabilityKey, Mutation};
use serde::{Deserialize, Serialize};
use shared::*;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub vendor_id: Uuid,
    /// Delivery date in the vendor's business time zone; the ledger key.
    pub delivery_date: NaiveDate,
    pub delivery_at: DateTime<Utc>,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_reference: Option<String>,
    pub total_amount: BigDecimal,
    pub reservation_expires_at: DateTime<Utc>,
    pub decline_reason: Option<String>,
    pub version: i32,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub flavor_id: Uuid,
    pub drum_size: DrumSize,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub ledger: ItemLedgerState,
}

impl Order {
    pub fn availability_key(&self, size: DrumSize) -> AvailabilityKey {
        AvailabilityKey::new(self.vendor_id, self.delivery_date, size)
    }

    pub fn reservation_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reservation_expires_at
    }

    /// What the expiry sweep looks for.
    pub fn is_lapsed_reservation(&self, now: DateTime<Utc>) -> bool {
        self.status.awaits_payment()
            && self.payment_status == PaymentStatus::Unpaid
            && self.reservation_expires_at < now
    }

    pub fn was_declined_for(&self, reason: CancelReason) -> bool {
        self.status == OrderStatus::Cancelled && self.decline_reason.as_deref() == Some(reason.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingPayment {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub reminder_sent: bool,
}

/// A ledger mutation an order change owes, queued in the same write as the
/// change and retried until the ledger accepts it. `id` doubles as the
/// ledger operation id, so a retry never applies it twice.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTask {
    pub id: Uuid,
    pub order_id: Uuid,
    pub key: AvailabilityKey,
    pub mutation: Mutation,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerTask {
    pub fn new(order_id: Uuid, key: AvailabilityKey, mutation: Mutation, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            key,
            mutation,
            attempts: 0,
            last_error: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct DbOrder {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub vendor_id: Uuid,
    pub delivery_date: NaiveDate,
    pub delivery_at: DateTime<Utc>,
    pub status: String,
    pub payment_status: String,
    pub payment_reference: Option<String>,
    pub total_amount: BigDecimal,
    pub reservation_expires_at: DateTime<Utc>,
    pub decline_reason: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::order_items)]
pub struct DbOrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub line_no: i32,
    pub flavor_id: Uuid,
    pub drum_size: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub ledger_state: String,
    pub ledger_quantity: i32,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::pending_payments)]
pub struct DbPendingPayment {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub reminder_sent: bool,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_payments)]
pub struct ProcessedPayment {
    pub reference: String,
    pub order_id: Uuid,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::ledger_tasks)]
pub struct DbLedgerTask {
    pub id: Uuid,
    pub seq: i64,
    pub order_id: Uuid,
    pub vendor_id: Uuid,
    pub delivery_date: NaiveDate,
    pub drum_size: String,
    pub mutation: serde_json::Value,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::ledger_tasks)]
pub struct NewLedgerTask {
    pub id: Uuid,
    pub order_id: Uuid,
    pub vendor_id: Uuid,
    pub delivery_date: NaiveDate,
    pub drum_size: String,
    pub mutation: serde_json::Value,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn to_rows(&self) -> (DbOrder, Vec<DbOrderItem>) {
        let order = DbOrder {
            id: self.id,
            customer_id: self.customer_id,
            vendor_id: self.vendor_id,
            delivery_date: self.delivery_date,
            delivery_at: self.delivery_at,
            status: self.status.as_str().to_string(),
            payment_status: self.payment_status.as_str().to_string(),
            payment_reference: self.payment_reference.clone(),
            total_amount: self.total_amount.clone(),
            reservation_expires_at: self.reservation_expires_at,
            decline_reason: self.decline_reason.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        };

        let items = self
            .items
            .iter()
            .enumerate()
            .map(|(line_no, item)| {
                let (ledger_state, ledger_quantity) = item.ledger.to_parts();
                DbOrderItem {
                    id: item.id,
                    order_id: self.id,
                    line_no: line_no as i32,
                    flavor_id: item.flavor_id,
                    drum_size: item.drum_size.as_str().to_string(),
                    quantity: item.quantity,
                    unit_price: item.unit_price.clone(),
                    ledger_state: ledger_state.to_string(),
                    ledger_quantity,
                }
            })
            .collect();

        (order, items)
    }

    pub fn from_rows(order: DbOrder, mut items: Vec<DbOrderItem>) -> anyhow::Result<Self> {
        items.sort_by_key(|item| item.line_no);
        let items = items
            .into_iter()
            .map(|item| -> anyhow::Result<OrderItem> {
                Ok(OrderItem {
                    id: item.id,
                    flavor_id: item.flavor_id,
                    drum_size: item.drum_size.parse()?,
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    ledger: ItemLedgerState::from_parts(&item.ledger_state, item.ledger_quantity)?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self {
            id: order.id,
            customer_id: order.customer_id,
            vendor_id: order.vendor_id,
            delivery_date: order.delivery_date,
            delivery_at: order.delivery_at,
            status: order.status.parse()?,
            payment_status: order.payment_status.parse()?,
            payment_reference: order.payment_reference,
            total_amount: order.total_amount,
            reservation_expires_at: order.reservation_expires_at,
            decline_reason: order.decline_reason,
            version: order.version,
            items,
            created_at: order.created_at,
            updated_at: order.updated_at,
        })
    }
}

impl TryFrom<&LedgerTask> for NewLedgerTask {
    type Error = anyhow::Error;

    fn try_from(task: &LedgerTask) -> Result<Self, Self::Error> {
        Ok(Self {
            id: task.id,
            order_id: task.order_id,
            vendor_id: task.key.vendor_id,
            delivery_date: task.key.delivery_date,
            drum_size: task.key.drum_size.as_str().to_string(),
            mutation: serde_json::to_value(task.mutation)?,
            attempts: task.attempts,
            created_at: task.created_at,
        })
    }
}

impl TryFrom<DbLedgerTask> for LedgerTask {
    type Error = anyhow::Error;

    fn try_from(row: DbLedgerTask) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            key: AvailabilityKey::new(row.vendor_id, row.delivery_date, row.drum_size.parse()?),
            mutation: serde_json::from_value(row.mutation)?,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

impl From<DbPendingPayment> for PendingPayment {
    fn from(row: DbPendingPayment) -> Self {
        Self {
            order_id: row.order_id,
            customer_id: row.customer_id,
            expires_at: row.expires_at,
            reminder_sent: row.reminder_sent,
        }
    }
}

impl From<OutboxEvent> for DbOutboxEvent {
    fn from(event: OutboxEvent) -> Self {
        Self {
            id: event.id,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            event_data: event.event_data,
            processed: Some(event.processed),
            created_at: Some(event.created_at),
        }
    }
}

impl From<DbOutboxEvent> for OutboxEvent {
    fn from(row: DbOutboxEvent) -> Self {
        Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            event_data: row.event_data,
            processed: row.processed.unwrap_or(false),
            created_at: row.created_at.unwrap_or_else(Utc::now),
        }
    }
}
