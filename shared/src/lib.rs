use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrumSize {
    Small,
    Medium,
    Large,
}

impl DrumSize {
    pub const ALL: [DrumSize; 3] = [DrumSize::Small, DrumSize::Medium, DrumSize::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            DrumSize::Small => "small",
            DrumSize::Medium => "medium",
            DrumSize::Large => "large",
        }
    }
}

impl fmt::Display for DrumSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DrumSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(DrumSize::Small),
            "medium" => Ok(DrumSize::Medium),
            "large" => Ok(DrumSize::Large),
            other => Err(anyhow::anyhow!("unknown drum size: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Partial => "partial",
            PaymentStatus::Paid => "paid",
        }
    }

    /// Partial and full payments both commit the order's drums.
    pub fn is_settled(&self) -> bool {
        matches!(self, PaymentStatus::Partial | PaymentStatus::Paid)
    }

    /// unpaid -> partial, unpaid -> paid and partial -> paid.
    pub fn can_advance_to(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Unpaid, PaymentStatus::Partial)
                | (PaymentStatus::Unpaid, PaymentStatus::Paid)
                | (PaymentStatus::Partial, PaymentStatus::Paid)
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpaid" => Ok(PaymentStatus::Unpaid),
            "partial" => Ok(PaymentStatus::Partial),
            "paid" => Ok(PaymentStatus::Paid),
            other => Err(anyhow::anyhow!("unknown payment status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    OutForDelivery,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::OutForDelivery => "out_for_delivery",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Orders the expiry sweep may still cancel.
    pub fn awaits_payment(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Confirmed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Fulfilment only moves forward; cancellation is allowed until delivery.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            OrderStatus::Cancelled => true,
            _ => next > *self,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "preparing" => Ok(OrderStatus::Preparing),
            "out_for_delivery" => Ok(OrderStatus::OutForDelivery),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" => Ok(OrderStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown order status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    ReservationExpired,
    CustomerCancelled,
    VendorDeclined,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::ReservationExpired => "reservation_expired",
            CancelReason::CustomerCancelled => "customer_cancelled",
            CancelReason::VendorDeclined => "vendor_declined",
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a single order item stands against the drum ledger.
///
/// Every transition consumes the current state, and only the transitions that
/// really move capacity hand back a quantity. A `Booked` item can never be
/// converted again and a `Released` item can never be released again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemLedgerState {
    Unreserved,
    Reserved { quantity: i32 },
    Booked { quantity: i32 },
    Released,
}

/// Capacity that must be handed back to the ledger when an item is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerRelease {
    pub quantity: i32,
    pub from_booked: bool,
}

impl ItemLedgerState {
    pub fn reserved(self, quantity: i32) -> Self {
        match self {
            ItemLedgerState::Unreserved => ItemLedgerState::Reserved { quantity },
            other => other,
        }
    }

    /// Reserved -> Booked; yields the quantity to convert.
    pub fn book(self) -> (Self, Option<i32>) {
        match self {
            ItemLedgerState::Reserved { quantity } => (ItemLedgerState::Booked { quantity }, Some(quantity)),
            other => (other, None),
        }
    }

    /// Reserved/Booked -> Released; yields what the ledger must give back.
    pub fn release(self) -> (Self, Option<LedgerRelease>) {
        match self {
            ItemLedgerState::Reserved { quantity } => (
                ItemLedgerState::Released,
                Some(LedgerRelease { quantity, from_booked: false }),
            ),
            ItemLedgerState::Booked { quantity } => (
                ItemLedgerState::Released,
                Some(LedgerRelease { quantity, from_booked: true }),
            ),
            other => (other, None),
        }
    }

    /// Booked -> Released after the drums came back; yields the returned quantity.
    pub fn returned(self) -> (Self, Option<i32>) {
        match self {
            ItemLedgerState::Booked { quantity } => (ItemLedgerState::Released, Some(quantity)),
            other => (other, None),
        }
    }

    pub fn to_parts(&self) -> (&'static str, i32) {
        match self {
            ItemLedgerState::Unreserved => ("unreserved", 0),
            ItemLedgerState::Reserved { quantity } => ("reserved", *quantity),
            ItemLedgerState::Booked { quantity } => ("booked", *quantity),
            ItemLedgerState::Released => ("released", 0),
        }
    }

    pub fn from_parts(state: &str, quantity: i32) -> anyhow::Result<Self> {
        match state {
            "unreserved" => Ok(ItemLedgerState::Unreserved),
            "reserved" => Ok(ItemLedgerState::Reserved { quantity }),
            "booked" => Ok(ItemLedgerState::Booked { quantity }),
            "released" => Ok(ItemLedgerState::Released),
            other => Err(anyhow::anyhow!("unknown ledger state: {}", other)),
        }
    }
}

/// Fire-and-forget events for the notification sink. Recorded only after the
/// mutation they describe has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotificationEvent {
    OrderPlaced {
        order_id: Uuid,
        customer_id: Uuid,
        vendor_id: Uuid,
        delivery_date: NaiveDate,
        reservation_expires_at: DateTime<Utc>,
    },
    PaymentConfirmed {
        order_id: Uuid,
        payment_status: PaymentStatus,
        reference: Option<String>,
    },
    PaymentReminder {
        order_id: Uuid,
        customer_id: Uuid,
        reservation_expires_at: DateTime<Utc>,
    },
    ReservationExpired {
        order_id: Uuid,
    },
    OrderCancelled {
        order_id: Uuid,
        reason: CancelReason,
    },
    OrderStatusChanged {
        order_id: Uuid,
        status: OrderStatus,
    },
    DrumsReturned {
        order_id: Uuid,
        quantity: i32,
        credited_date: NaiveDate,
    },
}

impl NotificationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            NotificationEvent::OrderPlaced { .. } => "OrderPlaced",
            NotificationEvent::PaymentConfirmed { .. } => "PaymentConfirmed",
            NotificationEvent::PaymentReminder { .. } => "PaymentReminder",
            NotificationEvent::ReservationExpired { .. } => "ReservationExpired",
            NotificationEvent::OrderCancelled { .. } => "OrderCancelled",
            NotificationEvent::OrderStatusChanged { .. } => "OrderStatusChanged",
            NotificationEvent::DrumsReturned { .. } => "DrumsReturned",
        }
    }

    pub fn order_id(&self) -> Uuid {
        match self {
            NotificationEvent::OrderPlaced { order_id, .. }
            | NotificationEvent::PaymentConfirmed { order_id, .. }
            | NotificationEvent::PaymentReminder { order_id, .. }
            | NotificationEvent::ReservationExpired { order_id }
            | NotificationEvent::OrderCancelled { order_id, .. }
            | NotificationEvent::OrderStatusChanged { order_id, .. }
            | NotificationEvent::DrumsReturned { order_id, .. } => *order_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(event: &NotificationEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            aggregate_id: event.order_id(),
            event_type: event.event_type().to_string(),
            event_data: serde_json::to_value(event)?,
            processed: false,
            created_at: Utc::now(),
        })
    }
}

/// Relayed by the GCash payment intent integration once a payment settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentNotice {
    pub order_id: Uuid,
    pub payment_status: PaymentStatus,
    pub reference: String,
}
