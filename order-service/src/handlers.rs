use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use drum_ledger::{AvailabilityKey, AvailabilityView, Ledger, Mutation};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use shared::*;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::OrderError;
use crate::models::{LedgerTask, Order, OrderItem};
use crate::store::OrderStore;

const MAX_WRITE_ATTEMPTS: usize = 5;
const LEDGER_WORK_BATCH: i64 = 100;

#[derive(Debug, Clone)]
pub struct OrderPolicy {
    pub payment_window: Duration,
    pub min_lead_time: Duration,
    pub reminder_lead: Duration,
    /// Offset of the vendors' business time zone; delivery dates and
    /// "today" are read in it.
    pub business_offset: FixedOffset,
}

impl Default for OrderPolicy {
    fn default() -> Self {
        Self {
            payment_window: Duration::minutes(30),
            min_lead_time: Duration::hours(24),
            reminder_lead: Duration::minutes(10),
            business_offset: FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix()),
        }
    }
}

impl OrderPolicy {
    pub fn business_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.business_offset).date_naive()
    }

    pub fn delivery_instant(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let offset = Duration::seconds(i64::from(self.business_offset.local_minus_utc()));
        Utc.from_utc_datetime(&(date.and_time(time) - offset))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrder {
    pub customer_id: Uuid,
    pub vendor_id: Uuid,
    pub delivery_date: NaiveDate,
    pub delivery_time: NaiveTime,
    pub items: Vec<PlaceOrderItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrderItem {
    pub flavor_id: Uuid,
    pub drum_size: DrumSize,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfirmation {
    pub payment_status: PaymentStatus,
    pub reference: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerWorkReport {
    pub settled: usize,
    /// Failed, or waiting behind an earlier failure of the same order.
    pub deferred: usize,
}

#[derive(Debug, Clone, Copy)]
enum CancelGuard {
    Any,
    /// Only cancel while the order is still an unpaid, lapsed reservation at
    /// the given instant.
    LapsedAt(DateTime<Utc>),
}

/// Order lifecycle on top of the drum ledger.
///
/// Order writes are optimistic: each one is checked against the version that
/// was read, and a lost race reloads the order and re-runs every check. The
/// ledger mutations a transition owes are queued as [`LedgerTask`]s in the
/// same write and applied right after it. Work that fails stays queued until
/// a retry of the same call or [`OrderService::retry_ledger_work`] lands it,
/// and each task reaches the ledger exactly once.
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    ledger: Ledger,
    policy: OrderPolicy,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, ledger: Ledger, policy: OrderPolicy) -> Self {
        Self { store, ledger, policy }
    }

    pub async fn place_order(&self, request: PlaceOrder, now: DateTime<Utc>) -> Result<Order, OrderError> {
        if request.items.is_empty() {
            return Err(OrderError::EmptyOrder);
        }
        if let Some(item) = request.items.iter().find(|item| item.quantity <= 0) {
            return Err(OrderError::InvalidQuantity(item.quantity));
        }

        let delivery_at = self.policy.delivery_instant(request.delivery_date, request.delivery_time);
        if delivery_at - now < self.policy.min_lead_time {
            return Err(OrderError::LeadTimeTooShort {
                hours: self.policy.min_lead_time.num_hours(),
            });
        }

        let order_id = Uuid::new_v4();
        let mut reserved: Vec<(AvailabilityKey, i32)> = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let key = AvailabilityKey::new(request.vendor_id, request.delivery_date, item.drum_size);
            if let Err(e) = self.ledger.reserve(&key, item.quantity).await {
                warn!("Order {} rejected while reserving {} drums on {}: {}", order_id, item.quantity, key, e);
                self.compensate(order_id, &reserved, now).await;
                return Err(e.into());
            }
            reserved.push((key, item.quantity));
        }

        let total_amount = request
            .items
            .iter()
            .fold(BigDecimal::zero(), |total, item| {
                total + &item.unit_price * BigDecimal::from(item.quantity)
            });

        let items = request
            .items
            .iter()
            .map(|item| OrderItem {
                id: Uuid::new_v4(),
                flavor_id: item.flavor_id,
                drum_size: item.drum_size,
                quantity: item.quantity,
                unit_price: item.unit_price.clone(),
                ledger: ItemLedgerState::Unreserved.reserved(item.quantity),
            })
            .collect();

        let order = Order {
            id: order_id,
            customer_id: request.customer_id,
            vendor_id: request.vendor_id,
            delivery_date: request.delivery_date,
            delivery_at,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
            payment_reference: None,
            total_amount,
            reservation_expires_at: now + self.policy.payment_window,
            decline_reason: None,
            version: 0,
            items,
            created_at: now,
            updated_at: now,
        };

        let placed = NotificationEvent::OrderPlaced {
            order_id,
            customer_id: order.customer_id,
            vendor_id: order.vendor_id,
            delivery_date: order.delivery_date,
            reservation_expires_at: order.reservation_expires_at,
        };

        if let Err(e) = self.store.insert_order(&order, &[placed]).await {
            error!("Failed to store order {}: {}", order_id, e);
            self.compensate(order_id, &reserved, now).await;
            return Err(OrderError::Storage(e));
        }

        info!(
            "Order {} placed for {} with {} items, reserved until {}",
            order_id,
            order.delivery_date,
            order.items.len(),
            order.reservation_expires_at
        );
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.store
            .find_order(order_id)
            .await?
            .ok_or(OrderError::NotFound(order_id))
    }

    /// Applies a manual or integrated GCash payment.
    pub async fn confirm_payment(
        &self,
        order_id: Uuid,
        confirmation: PaymentConfirmation,
        now: DateTime<Utc>,
    ) -> Result<Order, OrderError> {
        if let Some(reference) = &confirmation.reference {
            if let Some(owner) = self.store.payment_reference_owner(reference).await? {
                if owner != order_id {
                    warn!(
                        "Payment reference {} for order {} was already applied to order {}",
                        reference, order_id, owner
                    );
                    return Err(OrderError::PaymentReferenceReused {
                        reference: reference.clone(),
                        order_id: owner,
                    });
                }
                info!("Payment reference {} was already applied", reference);
                self.settle(order_id).await?;
                return self.get_order(order_id).await;
            }
        }

        let target = confirmation.payment_status;
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut order = self.get_order(order_id).await?;

            if order.status == OrderStatus::Cancelled {
                if order.was_declined_for(CancelReason::ReservationExpired) {
                    return Err(OrderError::ReservationExpired);
                }
                return Err(OrderError::InvalidTransition {
                    from: order.status.to_string(),
                    to: target.to_string(),
                });
            }
            if order.payment_status == target {
                self.settle(order_id).await?;
                return Ok(order);
            }
            if !order.payment_status.can_advance_to(target) {
                return Err(OrderError::InvalidTransition {
                    from: order.payment_status.to_string(),
                    to: target.to_string(),
                });
            }
            if order.payment_status == PaymentStatus::Unpaid && order.reservation_expired(now) {
                warn!(
                    "Payment for order {} arrived at {}, after its reservation expired at {}",
                    order_id, now, order.reservation_expires_at
                );
                return Err(OrderError::ReservationExpired);
            }

            let mut conversions = Vec::new();
            for item in order.items.iter_mut() {
                let (next, converted) = item.ledger.book();
                item.ledger = next;
                if let Some(quantity) = converted {
                    conversions.push((item.drum_size, quantity));
                }
            }

            order.payment_status = target;
            if order.status == OrderStatus::Pending {
                order.status = OrderStatus::Confirmed;
            }
            if confirmation.reference.is_some() {
                order.payment_reference = confirmation.reference.clone();
            }
            order.updated_at = now;

            let work: Vec<LedgerTask> = conversions
                .into_iter()
                .map(|(size, quantity)| {
                    LedgerTask::new(order_id, order.availability_key(size), Mutation::Convert(quantity), now)
                })
                .collect();
            let confirmed = NotificationEvent::PaymentConfirmed {
                order_id,
                payment_status: target,
                reference: confirmation.reference.clone(),
            };
            if !self.store.update_order(&order, &[confirmed], &work).await? {
                warn!("Order {} changed while confirming payment, reloading", order_id);
                continue;
            }
            order.version += 1;
            info!("Order {} is now {} ({})", order_id, order.payment_status, order.status);

            self.settle(order_id).await?;
            return Ok(order);
        }

        Err(OrderError::Conflict(order_id))
    }

    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: CancelReason,
        now: DateTime<Utc>,
    ) -> Result<Order, OrderError> {
        let (order, _) = self.cancel(order_id, reason, CancelGuard::Any, now).await?;
        Ok(order)
    }

    async fn cancel(
        &self,
        order_id: Uuid,
        reason: CancelReason,
        guard: CancelGuard,
        now: DateTime<Utc>,
    ) -> Result<(Order, bool), OrderError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut order = self.get_order(order_id).await?;

            if order.status == OrderStatus::Cancelled {
                self.settle(order_id).await?;
                return Ok((order, false));
            }
            if let CancelGuard::LapsedAt(at) = guard {
                if !order.is_lapsed_reservation(at) {
                    return Ok((order, false));
                }
            }
            if !order.status.can_transition_to(OrderStatus::Cancelled) {
                return Err(OrderError::InvalidTransition {
                    from: order.status.to_string(),
                    to: OrderStatus::Cancelled.to_string(),
                });
            }

            let mut releases = Vec::new();
            for item in order.items.iter_mut() {
                let (next, release) = item.ledger.release();
                item.ledger = next;
                if let Some(release) = release {
                    releases.push((item.drum_size, release));
                }
            }
            let work: Vec<LedgerTask> = releases
                .into_iter()
                .map(|(size, release)| {
                    let mutation = Mutation::Release {
                        quantity: release.quantity,
                        from_booked: release.from_booked,
                    };
                    LedgerTask::new(order_id, order.availability_key(size), mutation, now)
                })
                .collect();

            order.status = OrderStatus::Cancelled;
            order.decline_reason = Some(reason.as_str().to_string());
            order.updated_at = now;

            let mut events = Vec::with_capacity(2);
            if reason == CancelReason::ReservationExpired {
                events.push(NotificationEvent::ReservationExpired { order_id });
            }
            events.push(NotificationEvent::OrderCancelled { order_id, reason });

            if !self.store.update_order(&order, &events, &work).await? {
                warn!("Order {} changed while cancelling, reloading", order_id);
                continue;
            }
            order.version += 1;
            info!("Order {} cancelled: {}", order_id, reason);

            self.settle(order_id).await?;
            return Ok((order, true));
        }

        Err(OrderError::Conflict(order_id))
    }

    /// Vendor-driven fulfilment progress. Moving to `cancelled` declines the order.
    pub async fn update_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Order, OrderError> {
        if next == OrderStatus::Cancelled {
            return self.cancel_order(order_id, CancelReason::VendorDeclined, now).await;
        }

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut order = self.get_order(order_id).await?;

            if order.status == next {
                return Ok(order);
            }
            if !order.status.can_transition_to(next) {
                return Err(OrderError::InvalidTransition {
                    from: order.status.to_string(),
                    to: next.to_string(),
                });
            }
            if next > OrderStatus::Confirmed && !order.payment_status.is_settled() {
                return Err(OrderError::PaymentRequired(order_id));
            }
            if next == OrderStatus::Confirmed && order.payment_status == PaymentStatus::Unpaid {
                if order.reservation_expired(now) {
                    return Err(OrderError::ReservationExpired);
                }
                // A vendor confirmation restarts the payment window.
                order.reservation_expires_at = now + self.policy.payment_window;
            }

            order.status = next;
            order.updated_at = now;

            let changed = NotificationEvent::OrderStatusChanged { order_id, status: next };
            if !self.store.update_order(&order, &[changed], &[]).await? {
                warn!("Order {} changed while updating status, reloading", order_id);
                continue;
            }
            order.version += 1;
            info!("Order {} moved to {}", order_id, next);
            return Ok(order);
        }

        Err(OrderError::Conflict(order_id))
    }

    /// Records the physical return of a delivered order's drums and puts them
    /// back into circulation.
    pub async fn return_drums(&self, order_id: Uuid, now: DateTime<Utc>) -> Result<Order, OrderError> {
        let today = self.policy.business_date(now);

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut order = self.get_order(order_id).await?;

            if order.status != OrderStatus::Delivered {
                return Err(OrderError::InvalidTransition {
                    from: order.status.to_string(),
                    to: "returned".to_string(),
                });
            }

            let mut returns = Vec::new();
            for item in order.items.iter_mut() {
                let (next, returned) = item.ledger.returned();
                item.ledger = next;
                if let Some(quantity) = returned {
                    returns.push((item.drum_size, quantity));
                }
            }
            if returns.is_empty() {
                self.settle(order_id).await?;
                return Ok(order);
            }

            let quantity: i32 = returns.iter().map(|(_, quantity)| quantity).sum();
            let credited_date = order.delivery_date.max(today);
            order.updated_at = now;

            let work: Vec<LedgerTask> = returns
                .into_iter()
                .map(|(size, quantity)| {
                    let (key, mutation) =
                        Ledger::return_target(order.vendor_id, order.delivery_date, size, quantity, today);
                    LedgerTask::new(order_id, key, mutation, now)
                })
                .collect();
            let returned = NotificationEvent::DrumsReturned {
                order_id,
                quantity,
                credited_date,
            };
            if !self.store.update_order(&order, &[returned], &work).await? {
                warn!("Order {} changed while returning drums, reloading", order_id);
                continue;
            }
            order.version += 1;
            info!("Order {} returned {} drums, credited to {}", order_id, quantity, credited_date);

            self.settle(order_id).await?;
            return Ok(order);
        }

        Err(OrderError::Conflict(order_id))
    }

    /// Cancels every unpaid order whose reservation lapsed before `now` and
    /// hands its drums back. Safe to run repeatedly.
    pub async fn release_expired_reservations(&self, now: DateTime<Utc>) -> Result<SweepReport, OrderError> {
        let lapsed = self.store.expired_reservations(now).await?;
        let mut report = SweepReport::default();

        for order in lapsed {
            match self
                .cancel(order.id, CancelReason::ReservationExpired, CancelGuard::LapsedAt(now), now)
                .await
            {
                Ok((_, true)) => report.expired += 1,
                Ok((_, false)) => {}
                Err(e) => {
                    error!("Failed to expire reservation of order {}: {}", order.id, e);
                    report.failed += 1;
                }
            }
        }

        if report.expired > 0 || report.failed > 0 {
            info!(
                "Expiry sweep cancelled {} orders, {} failed",
                report.expired, report.failed
            );
        }
        Ok(report)
    }

    /// Records one reminder for each unpaid order about to lapse.
    pub async fn send_payment_reminders(&self, now: DateTime<Utc>) -> Result<usize, OrderError> {
        let horizon = now + self.policy.reminder_lead;
        let due = self.store.reminders_due(now, horizon).await?;

        let mut sent = 0;
        for pending in due {
            let reminder = NotificationEvent::PaymentReminder {
                order_id: pending.order_id,
                customer_id: pending.customer_id,
                reservation_expires_at: pending.expires_at,
            };
            if self.store.mark_reminded(pending.order_id, &reminder).await? {
                info!("Payment reminder queued for order {}", pending.order_id);
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Re-applies queued ledger work that an earlier call could not finish.
    /// Work of one order is applied in queue order; after a failure the rest
    /// of that order's work waits for the next run.
    pub async fn retry_ledger_work(&self) -> Result<LedgerWorkReport, OrderError> {
        let outstanding = self.store.outstanding_ledger_work(LEDGER_WORK_BATCH).await?;
        let mut report = LedgerWorkReport::default();
        let mut blocked = HashSet::new();

        for task in outstanding {
            if blocked.contains(&task.order_id) {
                report.deferred += 1;
                continue;
            }
            match self.apply_ledger_task(&task).await {
                Ok(()) => report.settled += 1,
                Err(_) => {
                    blocked.insert(task.order_id);
                    report.deferred += 1;
                }
            }
        }

        if report.settled > 0 || report.deferred > 0 {
            info!(
                "Ledger retry settled {} tasks, {} still outstanding",
                report.settled, report.deferred
            );
        }
        Ok(report)
    }

    pub async fn reconcile(&self) -> Result<usize, OrderError> {
        Ok(self.ledger.reconcile().await?)
    }

    pub async fn availability(
        &self,
        vendor_id: Uuid,
        date: NaiveDate,
        size: Option<DrumSize>,
    ) -> Result<Vec<AvailabilityView>, OrderError> {
        Ok(self.ledger.availability(vendor_id, date, size).await?)
    }

    pub async fn set_stock(&self, vendor_id: Uuid, size: DrumSize, stock: i32) -> Result<(), OrderError> {
        Ok(self.ledger.set_stock(vendor_id, size, stock).await?)
    }

    /// Applies the order's outstanding ledger work oldest first, stopping at
    /// the first failure so later work never overtakes it.
    async fn settle(&self, order_id: Uuid) -> Result<(), OrderError> {
        for task in self.store.ledger_work_for(order_id).await? {
            self.apply_ledger_task(&task).await?;
        }
        Ok(())
    }

    async fn apply_ledger_task(&self, task: &LedgerTask) -> Result<(), OrderError> {
        match self.ledger.apply_once(task.id, &task.key, task.mutation).await {
            Ok(_) => {
                self.store.complete_ledger_work(task.id).await?;
                Ok(())
            }
            Err(e) => {
                error!(
                    "Ledger work {} of order {} ({:?} on {}) failed on attempt {}: {}",
                    task.id,
                    task.order_id,
                    task.mutation,
                    task.key,
                    task.attempts + 1,
                    e
                );
                if let Err(store_err) = self.store.ledger_work_failed(task.id, &e.to_string()).await {
                    error!("Could not record failure of ledger work {}: {}", task.id, store_err);
                }
                Err(e.into())
            }
        }
    }

    /// Hands back reservations of an order that never got stored. Releases
    /// the ledger refuses are queued for [`OrderService::retry_ledger_work`].
    async fn compensate(&self, order_id: Uuid, reserved: &[(AvailabilityKey, i32)], now: DateTime<Utc>) {
        let mut unsettled = Vec::new();
        for (key, quantity) in reserved.iter().rev() {
            let mutation = Mutation::Release {
                quantity: *quantity,
                from_booked: false,
            };
            let task = LedgerTask::new(order_id, key.clone(), mutation, now);
            if let Err(e) = self.ledger.apply_once(task.id, key, mutation).await {
                error!(
                    "Compensating release of {} drums on {} for order {} failed, queueing it: {}",
                    quantity, key, order_id, e
                );
                unsettled.push(task);
            }
        }

        if unsettled.is_empty() {
            return;
        }
        if let Err(e) = self.store.enqueue_ledger_work(&unsettled).await {
            error!(
                "Could not queue {} compensating releases for order {}: {}",
                unsettled.len(),
                order_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryOrderStore;
    use async_trait::async_trait;
    use drum_ledger::{Applied, AvailabilityRecord, AvailabilityStore, LedgerError, MemoryStore, MemoryVendorStock};
    use parking_lot::Mutex;

    /// In-memory ledger rows whose next `remaining` matching mutations fail
    /// as if the database connection dropped.
    struct FlakyStore {
        inner: MemoryStore,
        fails: fn(&Mutation) -> bool,
        remaining: Mutex<usize>,
    }

    impl FlakyStore {
        fn new(fails: fn(&Mutation) -> bool, times: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                fails,
                remaining: Mutex::new(times),
            }
        }

        fn take_failure(&self, mutation: &Mutation) -> bool {
            let mut remaining = self.remaining.lock();
            if (self.fails)(mutation) && *remaining > 0 {
                *remaining -= 1;
                return true;
            }
            false
        }
    }

    #[async_trait]
    impl AvailabilityStore for FlakyStore {
        async fn apply(
            &self,
            key: &AvailabilityKey,
            seed_capacity: i32,
            mutation: Mutation,
            operation: Option<Uuid>,
        ) -> Result<Applied, LedgerError> {
            if self.take_failure(&mutation) {
                return Err(LedgerError::Storage(anyhow::anyhow!("connection reset")));
            }
            self.inner.apply(key, seed_capacity, mutation, operation).await
        }

        async fn load(&self, key: &AvailabilityKey) -> anyhow::Result<Option<AvailabilityRecord>> {
            self.inner.load(key).await
        }

        async fn load_for_date(&self, vendor_id: Uuid, date: NaiveDate) -> anyhow::Result<Vec<AvailabilityRecord>> {
            self.inner.load_for_date(vendor_id, date).await
        }

        async fn mismatched_keys(&self) -> anyhow::Result<Vec<AvailabilityKey>> {
            self.inner.mismatched_keys().await
        }
    }

    fn june(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn placed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 29, 2, 0, 0).unwrap()
    }

    struct Fixture {
        service: Arc<OrderService>,
        store: Arc<MemoryOrderStore>,
        vendor: Uuid,
    }

    async fn fixture(stock: &[(DrumSize, i32)]) -> Fixture {
        fixture_on(Arc::new(MemoryStore::new()), stock).await
    }

    async fn fixture_on(rows: Arc<dyn AvailabilityStore>, stock: &[(DrumSize, i32)]) -> Fixture {
        let store = Arc::new(MemoryOrderStore::new());
        let ledger = Ledger::new(rows, Arc::new(MemoryVendorStock::new()));
        let service = Arc::new(OrderService::new(store.clone(), ledger, OrderPolicy::default()));
        let vendor = Uuid::new_v4();
        for (size, count) in stock {
            service.set_stock(vendor, *size, *count).await.unwrap();
        }
        Fixture { service, store, vendor }
    }

    fn order_for(vendor: Uuid, items: &[(DrumSize, i32)]) -> PlaceOrder {
        PlaceOrder {
            customer_id: Uuid::new_v4(),
            vendor_id: vendor,
            delivery_date: june(1),
            delivery_time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
            items: items
                .iter()
                .map(|(size, quantity)| PlaceOrderItem {
                    flavor_id: Uuid::new_v4(),
                    drum_size: *size,
                    quantity: *quantity,
                    unit_price: BigDecimal::from(1500),
                })
                .collect(),
        }
    }

    fn paid(reference: &str) -> PaymentConfirmation {
        PaymentConfirmation {
            payment_status: PaymentStatus::Paid,
            reference: Some(reference.to_string()),
        }
    }

    async fn view(fx: &Fixture, date: NaiveDate, size: DrumSize) -> AvailabilityView {
        fx.service.availability(fx.vendor, date, Some(size)).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn second_customer_is_turned_away_then_cancellation_frees_the_drums() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        let now = placed_at();

        let a = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 2)]), now).await.unwrap();
        assert_eq!(a.total_amount, BigDecimal::from(3000));
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.available_count), (2, 0));

        let err = fx
            .service
            .place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), now)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrderError::Ledger(LedgerError::InsufficientCapacity { available: 0, requested: 1, .. })
        ));

        let a = fx
            .service
            .confirm_payment(a.id, paid("GC-100"), now + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(a.status, OrderStatus::Confirmed);
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.booked_count, small.available_count), (0, 2, 0));

        fx.service
            .cancel_order(a.id, CancelReason::CustomerCancelled, now + Duration::hours(2))
            .await
            .unwrap();
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.booked_count, small.available_count), (0, 2));
    }

    #[tokio::test]
    async fn unpaid_reservation_is_swept_after_the_window() {
        let fx = fixture(&[(DrumSize::Medium, 5)]).await;
        let now = placed_at();

        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Medium, 3)]), now).await.unwrap();
        let medium = view(&fx, june(1), DrumSize::Medium).await;
        assert_eq!((medium.reserved_count, medium.available_count), (3, 2));

        let early = fx.service.release_expired_reservations(now + Duration::minutes(20)).await.unwrap();
        assert_eq!(early.expired, 0);

        let report = fx.service.release_expired_reservations(now + Duration::minutes(31)).await.unwrap();
        assert_eq!(report, SweepReport { expired: 1, failed: 0 });

        let swept = fx.service.get_order(order.id).await.unwrap();
        assert_eq!(swept.status, OrderStatus::Cancelled);
        assert!(swept.was_declined_for(CancelReason::ReservationExpired));
        assert!(fx.store.pending_payment(order.id).is_none());

        let medium = view(&fx, june(1), DrumSize::Medium).await;
        assert_eq!((medium.reserved_count, medium.available_count), (0, 5));

        let again = fx.service.release_expired_reservations(now + Duration::minutes(40)).await.unwrap();
        assert_eq!(again.expired, 0);
        let medium = view(&fx, june(1), DrumSize::Medium).await;
        assert_eq!(medium.available_count, 5);

        let events = fx.store.recorded_events();
        assert!(events.contains(&NotificationEvent::ReservationExpired { order_id: order.id }));
        assert!(events.contains(&NotificationEvent::OrderCancelled {
            order_id: order.id,
            reason: CancelReason::ReservationExpired,
        }));
    }

    #[tokio::test]
    async fn payment_inside_the_window_survives_the_sweep() {
        let fx = fixture(&[(DrumSize::Large, 4)]).await;
        let now = placed_at();

        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Large, 3)]), now).await.unwrap();
        fx.service
            .confirm_payment(order.id, paid("GC-200"), now + Duration::minutes(29))
            .await
            .unwrap();

        let report = fx.service.release_expired_reservations(now + Duration::minutes(31)).await.unwrap();
        assert_eq!(report.expired, 0);

        let large = view(&fx, june(1), DrumSize::Large).await;
        assert_eq!((large.reserved_count, large.booked_count, large.available_count), (0, 3, 1));
    }

    #[tokio::test]
    async fn payment_at_or_after_expiry_is_rejected() {
        let fx = fixture(&[(DrumSize::Large, 4)]).await;
        let now = placed_at();

        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Large, 3)]), now).await.unwrap();
        let err = fx
            .service
            .confirm_payment(order.id, paid("GC-300"), order.reservation_expires_at)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::ReservationExpired));
        assert_eq!(err.to_string(), "Reservation expired. Please place a new order.");

        let large = view(&fx, june(1), DrumSize::Large).await;
        assert_eq!((large.reserved_count, large.booked_count), (3, 0));

        fx.service.release_expired_reservations(now + Duration::minutes(31)).await.unwrap();
        let err = fx
            .service
            .confirm_payment(order.id, paid("GC-300"), now + Duration::minutes(32))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::ReservationExpired));

        let large = view(&fx, june(1), DrumSize::Large).await;
        assert_eq!((large.reserved_count, large.booked_count, large.available_count), (0, 0, 4));
    }

    #[tokio::test]
    async fn racing_payment_and_sweep_never_both_apply() {
        for _ in 0..20 {
            let fx = fixture(&[(DrumSize::Small, 3)]).await;
            let now = placed_at();
            let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 2)]), now).await.unwrap();

            let payer = fx.service.clone();
            let sweeper = fx.service.clone();
            let expires = order.reservation_expires_at;
            let (payment, sweep) = tokio::join!(
                tokio::spawn(async move {
                    payer
                        .confirm_payment(order.id, paid("GC-400"), expires - Duration::seconds(1))
                        .await
                }),
                tokio::spawn(async move { sweeper.release_expired_reservations(expires + Duration::seconds(1)).await })
            );
            let payment = payment.unwrap();
            let sweep = sweep.unwrap().unwrap();

            let small = view(&fx, june(1), DrumSize::Small).await;
            assert_eq!(small.reserved_count + small.booked_count + small.available_count, 3);
            match payment {
                Ok(_) => {
                    assert_eq!(sweep.expired, 0);
                    assert_eq!((small.reserved_count, small.booked_count), (0, 2));
                }
                Err(OrderError::ReservationExpired) => {
                    assert_eq!(sweep.expired, 1);
                    assert_eq!((small.reserved_count, small.booked_count), (0, 0));
                }
                Err(other) => panic!("unexpected payment outcome: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn failed_item_releases_the_earlier_reservations() {
        let fx = fixture(&[(DrumSize::Small, 2), (DrumSize::Large, 1)]).await;

        let err = fx
            .service
            .place_order(
                order_for(fx.vendor, &[(DrumSize::Small, 2), (DrumSize::Large, 2)]),
                placed_at(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrderError::Ledger(LedgerError::InsufficientCapacity { available: 1, requested: 2, .. })
        ));

        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.available_count), (0, 2));
        assert!(fx.store.recorded_events().is_empty());
    }

    #[tokio::test]
    async fn orders_need_items_quantities_and_lead_time() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        let now = placed_at();

        let err = fx.service.place_order(order_for(fx.vendor, &[]), now).await.unwrap_err();
        assert!(matches!(err, OrderError::EmptyOrder));

        let err = fx
            .service
            .place_order(order_for(fx.vendor, &[(DrumSize::Small, 0)]), now)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidQuantity(0)));

        // 2025-06-01 14:00 +08:00 is 06:00 UTC; ten hours before is too late.
        let late = Utc.with_ymd_and_hms(2025, 5, 31, 20, 0, 0).unwrap();
        let err = fx
            .service
            .place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), late)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::LeadTimeTooShort { hours: 24 }));

        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!(small.available_count, 2);
    }

    #[tokio::test]
    async fn cancelling_twice_releases_once() {
        let fx = fixture(&[(DrumSize::Medium, 3)]).await;
        let now = placed_at();

        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Medium, 2)]), now).await.unwrap();
        let first = fx
            .service
            .cancel_order(order.id, CancelReason::CustomerCancelled, now)
            .await
            .unwrap();
        let second = fx
            .service
            .cancel_order(order.id, CancelReason::CustomerCancelled, now)
            .await
            .unwrap();
        assert_eq!(first.version, second.version);

        let medium = view(&fx, june(1), DrumSize::Medium).await;
        assert_eq!((medium.reserved_count, medium.available_count), (0, 3));

        let err = fx
            .service
            .confirm_payment(order.id, paid("GC-500"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn payment_references_apply_once_and_never_go_backwards() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), now).await.unwrap();

        let partial = PaymentConfirmation {
            payment_status: PaymentStatus::Partial,
            reference: Some("GC-600".to_string()),
        };
        let order = fx.service.confirm_payment(order.id, partial, now).await.unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Partial);

        let replay = fx.service.confirm_payment(order.id, paid("GC-600"), now).await.unwrap();
        assert_eq!(replay.payment_status, PaymentStatus::Partial);

        let order = fx.service.confirm_payment(order.id, paid("GC-601"), now).await.unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Paid);
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!(small.booked_count, 1);

        let backwards = PaymentConfirmation {
            payment_status: PaymentStatus::Partial,
            reference: None,
        };
        let err = fx.service.confirm_payment(order.id, backwards, now).await.unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn preparation_waits_for_payment() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), now).await.unwrap();

        let err = fx
            .service
            .update_status(order.id, OrderStatus::Preparing, now)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::PaymentRequired(_)));

        fx.service.confirm_payment(order.id, paid("GC-700"), now).await.unwrap();
        let order = fx.service.update_status(order.id, OrderStatus::Preparing, now).await.unwrap();
        assert_eq!(order.status, OrderStatus::Preparing);

        let err = fx
            .service
            .update_status(order.id, OrderStatus::Confirmed, now)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::InvalidTransition { .. }));

        let declined = fx.service.update_status(order.id, OrderStatus::Cancelled, now).await.unwrap();
        assert!(declined.was_declined_for(CancelReason::VendorDeclined));
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.booked_count, small.available_count), (0, 2));
    }

    #[tokio::test]
    async fn drums_returned_after_a_past_delivery_count_for_today() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), now).await.unwrap();
        fx.service.confirm_payment(order.id, paid("GC-800"), now).await.unwrap();
        fx.service.update_status(order.id, OrderStatus::Delivered, now).await.unwrap();

        let returned_at = Utc.with_ymd_and_hms(2025, 6, 3, 1, 0, 0).unwrap();
        fx.service.return_drums(order.id, returned_at).await.unwrap();
        let again = fx.service.return_drums(order.id, returned_at).await.unwrap();
        assert!(again.items.iter().all(|item| item.ledger == ItemLedgerState::Released));

        let today = view(&fx, june(3), DrumSize::Small).await;
        assert_eq!(today.available_count, 3);
        let past = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!(past.booked_count, 1);

        assert!(fx.store.recorded_events().contains(&NotificationEvent::DrumsReturned {
            order_id: order.id,
            quantity: 1,
            credited_date: june(3),
        }));
    }

    #[tokio::test]
    async fn reminders_go_out_once_shortly_before_expiry() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), now).await.unwrap();

        assert_eq!(fx.service.send_payment_reminders(now + Duration::minutes(5)).await.unwrap(), 0);
        assert_eq!(fx.service.send_payment_reminders(now + Duration::minutes(21)).await.unwrap(), 1);
        assert_eq!(fx.service.send_payment_reminders(now + Duration::minutes(22)).await.unwrap(), 0);
        assert!(fx.store.pending_payment(order.id).unwrap().reminder_sent);

        let reminders = fx
            .store
            .recorded_events()
            .into_iter()
            .filter(|event| matches!(event, NotificationEvent::PaymentReminder { .. }))
            .count();
        assert_eq!(reminders, 1);
    }

    async fn outstanding(fx: &Fixture) -> usize {
        fx.store.outstanding_ledger_work(100).await.unwrap().len()
    }

    #[tokio::test]
    async fn booking_that_fails_after_payment_is_finished_by_the_redelivered_notice() {
        let flaky = Arc::new(FlakyStore::new(|m| matches!(m, Mutation::Convert(_)), 1));
        let fx = fixture_on(flaky, &[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 2)]), now).await.unwrap();

        let err = fx
            .service
            .confirm_payment(order.id, paid("GC-900"), now + Duration::minutes(5))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Ledger(LedgerError::Storage(_))));
        assert_eq!(fx.service.get_order(order.id).await.unwrap().payment_status, PaymentStatus::Paid);
        assert_eq!(outstanding(&fx).await, 1);
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.booked_count), (2, 0));

        let retried = fx
            .service
            .confirm_payment(order.id, paid("GC-900"), now + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(retried.payment_status, PaymentStatus::Paid);
        assert_eq!(outstanding(&fx).await, 0);
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.booked_count, small.available_count), (0, 2, 0));

        fx.service.release_expired_reservations(now + Duration::minutes(40)).await.unwrap();
        fx.service
            .cancel_order(order.id, CancelReason::CustomerCancelled, now + Duration::hours(1))
            .await
            .unwrap();
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.booked_count, small.available_count), (0, 0, 2));
    }

    #[tokio::test]
    async fn scheduled_retry_lands_booking_then_release_in_order() {
        let flaky = Arc::new(FlakyStore::new(|m| matches!(m, Mutation::Convert(_)), 2));
        let fx = fixture_on(flaky, &[(DrumSize::Medium, 3)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Medium, 2)]), now).await.unwrap();

        assert!(fx.service.confirm_payment(order.id, paid("GC-910"), now).await.is_err());
        // The cancel is stored, but its release waits behind the unbooked conversion.
        assert!(fx
            .service
            .cancel_order(order.id, CancelReason::CustomerCancelled, now)
            .await
            .is_err());
        assert_eq!(outstanding(&fx).await, 2);
        let medium = view(&fx, june(1), DrumSize::Medium).await;
        assert_eq!((medium.reserved_count, medium.booked_count), (2, 0));

        let report = fx.service.retry_ledger_work().await.unwrap();
        assert_eq!(report, LedgerWorkReport { settled: 2, deferred: 0 });
        let medium = view(&fx, june(1), DrumSize::Medium).await;
        assert_eq!((medium.reserved_count, medium.booked_count, medium.available_count), (0, 0, 3));

        let again = fx.service.retry_ledger_work().await.unwrap();
        assert_eq!(again, LedgerWorkReport::default());
    }

    #[tokio::test]
    async fn failed_release_on_cancel_is_finished_by_cancelling_again() {
        let flaky = Arc::new(FlakyStore::new(|m| matches!(m, Mutation::Release { .. }), 1));
        let fx = fixture_on(flaky, &[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 2)]), now).await.unwrap();

        let err = fx
            .service
            .cancel_order(order.id, CancelReason::CustomerCancelled, now)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Ledger(_)));
        assert_eq!(fx.service.get_order(order.id).await.unwrap().status, OrderStatus::Cancelled);
        assert_eq!(view(&fx, june(1), DrumSize::Small).await.available_count, 0);

        fx.service
            .cancel_order(order.id, CancelReason::CustomerCancelled, now)
            .await
            .unwrap();
        assert_eq!(outstanding(&fx).await, 0);
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.available_count), (0, 2));
    }

    #[tokio::test]
    async fn failed_return_credit_is_retried_by_the_scheduler() {
        let flaky = Arc::new(FlakyStore::new(|m| matches!(m, Mutation::Credit(_)), 1));
        let fx = fixture_on(flaky, &[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), now).await.unwrap();
        fx.service.confirm_payment(order.id, paid("GC-920"), now).await.unwrap();
        fx.service.update_status(order.id, OrderStatus::Delivered, now).await.unwrap();

        let returned_at = Utc.with_ymd_and_hms(2025, 6, 3, 1, 0, 0).unwrap();
        assert!(fx.service.return_drums(order.id, returned_at).await.is_err());
        assert_eq!(view(&fx, june(3), DrumSize::Small).await.available_count, 2);

        let report = fx.service.retry_ledger_work().await.unwrap();
        assert_eq!(report.settled, 1);
        assert_eq!(view(&fx, june(3), DrumSize::Small).await.available_count, 3);
    }

    #[tokio::test]
    async fn return_onto_maxed_out_stock_fails_cleanly() {
        let fx = fixture(&[(DrumSize::Small, i32::MAX)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 2)]), now).await.unwrap();
        fx.service.confirm_payment(order.id, paid("GC-930"), now).await.unwrap();
        fx.service.update_status(order.id, OrderStatus::Delivered, now).await.unwrap();

        let returned_at = Utc.with_ymd_and_hms(2025, 6, 3, 1, 0, 0).unwrap();
        let err = fx.service.return_drums(order.id, returned_at).await.unwrap_err();
        assert!(matches!(err, OrderError::Ledger(LedgerError::CapacityOverflow { .. })));

        let today = view(&fx, june(3), DrumSize::Small).await;
        assert_eq!(today.total_capacity, i32::MAX);
        assert_eq!(outstanding(&fx).await, 1);
    }

    #[tokio::test]
    async fn failed_compensation_is_queued_and_retried() {
        let flaky = Arc::new(FlakyStore::new(|m| matches!(m, Mutation::Release { .. }), 1));
        let fx = fixture_on(flaky, &[(DrumSize::Small, 2), (DrumSize::Large, 1)]).await;

        let err = fx
            .service
            .place_order(
                order_for(fx.vendor, &[(DrumSize::Small, 2), (DrumSize::Large, 2)]),
                placed_at(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Ledger(LedgerError::InsufficientCapacity { .. })));
        assert_eq!(view(&fx, june(1), DrumSize::Small).await.reserved_count, 2);
        assert_eq!(outstanding(&fx).await, 1);

        let report = fx.service.retry_ledger_work().await.unwrap();
        assert_eq!(report.settled, 1);
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.available_count), (0, 2));
    }

    #[tokio::test]
    async fn order_write_failure_hands_the_reservation_back() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        fx.store.fail_next_writes(1);

        let err = fx
            .service
            .place_order(order_for(fx.vendor, &[(DrumSize::Small, 2)]), placed_at())
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::Storage(_)));
        assert!(fx.store.recorded_events().is_empty());
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.available_count), (0, 2));
    }

    #[tokio::test]
    async fn payment_write_failure_leaves_the_reservation_untouched() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 2)]), now).await.unwrap();

        fx.store.fail_next_writes(1);
        let err = fx.service.confirm_payment(order.id, paid("GC-940"), now).await.unwrap_err();
        assert!(matches!(err, OrderError::Storage(_)));
        let stored = fx.service.get_order(order.id).await.unwrap();
        assert_eq!((stored.payment_status, stored.version), (PaymentStatus::Unpaid, 0));
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.booked_count), (2, 0));

        fx.service.confirm_payment(order.id, paid("GC-940"), now).await.unwrap();
        let small = view(&fx, june(1), DrumSize::Small).await;
        assert_eq!((small.reserved_count, small.booked_count), (0, 2));
    }

    #[tokio::test]
    async fn payment_reference_of_another_order_is_refused() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let first = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), now).await.unwrap();
        let second = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), now).await.unwrap();

        fx.service.confirm_payment(first.id, paid("GC-950"), now).await.unwrap();
        let err = fx
            .service
            .confirm_payment(second.id, paid("GC-950"), now)
            .await
            .unwrap_err();
        match err {
            OrderError::PaymentReferenceReused { reference, order_id } => {
                assert_eq!(reference, "GC-950");
                assert_eq!(order_id, first.id);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(fx.service.get_order(second.id).await.unwrap().payment_status, PaymentStatus::Unpaid);
    }

    #[tokio::test]
    async fn vendor_confirmation_restarts_the_payment_window() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), now).await.unwrap();

        let confirmed = fx
            .service
            .update_status(order.id, OrderStatus::Confirmed, now + Duration::minutes(20))
            .await
            .unwrap();
        assert_eq!(confirmed.reservation_expires_at, now + Duration::minutes(50));
        assert_eq!(
            fx.store.pending_payment(order.id).unwrap().expires_at,
            now + Duration::minutes(50)
        );

        let report = fx.service.release_expired_reservations(now + Duration::minutes(31)).await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(fx.service.send_payment_reminders(now + Duration::minutes(41)).await.unwrap(), 1);

        let report = fx.service.release_expired_reservations(now + Duration::minutes(51)).await.unwrap();
        assert_eq!(report.expired, 1);
    }

    #[tokio::test]
    async fn lapsed_reservation_cannot_be_confirmed_by_the_vendor() {
        let fx = fixture(&[(DrumSize::Small, 2)]).await;
        let now = placed_at();
        let order = fx.service.place_order(order_for(fx.vendor, &[(DrumSize::Small, 1)]), now).await.unwrap();

        let err = fx
            .service
            .update_status(order.id, OrderStatus::Confirmed, now + Duration::minutes(30))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::ReservationExpired));
    }
}
