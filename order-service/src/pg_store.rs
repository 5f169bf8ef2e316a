use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use drum_ledger::DbPool;
use shared::*;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;
use crate::store::OrderStore;

const SWEEP_BATCH: i64 = 500;

pub struct PgOrderStore {
    pool: DbPool,
}

impl PgOrderStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn ledger_rows(tasks: &[LedgerTask]) -> Result<Vec<NewLedgerTask>> {
    tasks.iter().map(NewLedgerTask::try_from).collect()
}

fn outbox_rows(events: &[NotificationEvent]) -> Result<Vec<DbOutboxEvent>> {
    events
        .iter()
        .map(|event| Ok(DbOutboxEvent::from(OutboxEvent::new(event)?)))
        .collect()
}

async fn load_items(conn: &mut AsyncPgConnection, order_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<DbOrderItem>>> {
    let rows = order_items::table
        .filter(order_items::order_id.eq_any(order_ids))
        .order((order_items::order_id, order_items::line_no))
        .load::<DbOrderItem>(conn)
        .await?;

    let mut grouped: HashMap<Uuid, Vec<DbOrderItem>> = HashMap::new();
    for row in rows {
        grouped.entry(row.order_id).or_default().push(row);
    }
    Ok(grouped)
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn insert_order(&self, order: &Order, events: &[NotificationEvent]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let (order_row, item_rows) = order.to_rows();
        let pending = DbPendingPayment {
            order_id: order.id,
            customer_id: order.customer_id,
            expires_at: order.reservation_expires_at,
            reminder_sent: false,
            created_at: Some(Utc::now()),
        };
        let outbox = outbox_rows(events)?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(orders::table)
                    .values(&order_row)
                    .execute(conn)
                    .await?;

                diesel::insert_into(order_items::table)
                    .values(&item_rows)
                    .execute(conn)
                    .await?;

                diesel::insert_into(pending_payments::table)
                    .values(&pending)
                    .execute(conn)
                    .await?;

                diesel::insert_into(outbox_events::table)
                    .values(&outbox)
                    .execute(conn)
                    .await?;

                Ok(())
            })
        }).await?;

        Ok(())
    }

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>> {
        let mut conn = self.pool.get().await?;
        let order_row = orders::table
            .filter(orders::id.eq(id))
            .first::<DbOrder>(&mut conn)
            .await
            .optional()?;

        let Some(order_row) = order_row else {
            return Ok(None);
        };

        let mut items = load_items(&mut conn, &[id]).await?;
        let order = Order::from_rows(order_row, items.remove(&id).unwrap_or_default())?;
        Ok(Some(order))
    }

    async fn update_order(
        &self,
        order: &Order,
        events: &[NotificationEvent],
        ledger_work: &[LedgerTask],
    ) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let (order_row, item_rows) = order.to_rows();
        let outbox = outbox_rows(events)?;
        let work = ledger_rows(ledger_work)?;
        let drop_pending = order.payment_status.is_settled() || order.status == OrderStatus::Cancelled;

        let written = conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let updated = diesel::update(
                    orders::table
                        .filter(orders::id.eq(order_row.id))
                        .filter(orders::version.eq(order_row.version)),
                )
                .set((
                    orders::status.eq(&order_row.status),
                    orders::payment_status.eq(&order_row.payment_status),
                    orders::payment_reference.eq(&order_row.payment_reference),
                    orders::decline_reason.eq(&order_row.decline_reason),
                    orders::reservation_expires_at.eq(order_row.reservation_expires_at),
                    orders::version.eq(order_row.version + 1),
                    orders::updated_at.eq(order_row.updated_at),
                ))
                .execute(conn)
                .await?;

                if updated == 0 {
                    return Ok(false);
                }

                for item in &item_rows {
                    diesel::update(order_items::table.filter(order_items::id.eq(item.id)))
                        .set((
                            order_items::ledger_state.eq(&item.ledger_state),
                            order_items::ledger_quantity.eq(item.ledger_quantity),
                        ))
                        .execute(conn)
                        .await?;
                }

                if drop_pending {
                    diesel::delete(pending_payments::table.filter(pending_payments::order_id.eq(order_row.id)))
                        .execute(conn)
                        .await?;
                } else {
                    diesel::update(
                        pending_payments::table
                            .filter(pending_payments::order_id.eq(order_row.id))
                            .filter(pending_payments::expires_at.ne(order_row.reservation_expires_at)),
                    )
                    .set((
                        pending_payments::expires_at.eq(order_row.reservation_expires_at),
                        pending_payments::reminder_sent.eq(false),
                    ))
                    .execute(conn)
                    .await?;
                }

                if let Some(reference) = &order_row.payment_reference {
                    diesel::insert_into(processed_payments::table)
                        .values(&ProcessedPayment {
                            reference: reference.clone(),
                            order_id: order_row.id,
                            processed_at: Some(Utc::now()),
                        })
                        .on_conflict(processed_payments::reference)
                        .do_nothing()
                        .execute(conn)
                        .await?;
                }

                diesel::insert_into(outbox_events::table)
                    .values(&outbox)
                    .execute(conn)
                    .await?;

                if !work.is_empty() {
                    diesel::insert_into(ledger_tasks::table)
                        .values(&work)
                        .execute(conn)
                        .await?;
                }

                Ok(true)
            })
        }).await?;

        Ok(written)
    }

    async fn expired_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Order>> {
        let mut conn = self.pool.get().await?;
        let rows = orders::table
            .filter(orders::status.eq_any([OrderStatus::Pending.as_str(), OrderStatus::Confirmed.as_str()]))
            .filter(orders::payment_status.eq(PaymentStatus::Unpaid.as_str()))
            .filter(orders::reservation_expires_at.lt(now))
            .order(orders::reservation_expires_at.asc())
            .limit(SWEEP_BATCH)
            .load::<DbOrder>(&mut conn)
            .await?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let mut items = load_items(&mut conn, &ids).await?;

        rows.into_iter()
            .map(|row| {
                let row_items = items.remove(&row.id).unwrap_or_default();
                Order::from_rows(row, row_items)
            })
            .collect()
    }

    async fn reminders_due(&self, now: DateTime<Utc>, horizon: DateTime<Utc>) -> Result<Vec<PendingPayment>> {
        let mut conn = self.pool.get().await?;
        let rows = pending_payments::table
            .filter(pending_payments::reminder_sent.eq(false))
            .filter(pending_payments::expires_at.gt(now))
            .filter(pending_payments::expires_at.le(horizon))
            .order(pending_payments::expires_at.asc())
            .load::<DbPendingPayment>(&mut conn)
            .await?;

        Ok(rows.into_iter().map(PendingPayment::from).collect())
    }

    async fn mark_reminded(&self, order_id: Uuid, event: &NotificationEvent) -> Result<bool> {
        let mut conn = self.pool.get().await?;
        let outbox = DbOutboxEvent::from(OutboxEvent::new(event)?);

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let updated = diesel::update(
                    pending_payments::table
                        .filter(pending_payments::order_id.eq(order_id))
                        .filter(pending_payments::reminder_sent.eq(false)),
                )
                .set(pending_payments::reminder_sent.eq(true))
                .execute(conn)
                .await?;

                if updated == 0 {
                    return Ok(false);
                }

                diesel::insert_into(outbox_events::table)
                    .values(&outbox)
                    .execute(conn)
                    .await?;

                Ok(true)
            })
        }).await
    }

    async fn payment_reference_owner(&self, reference: &str) -> Result<Option<Uuid>> {
        let mut conn = self.pool.get().await?;
        let owner = processed_payments::table
            .filter(processed_payments::reference.eq(reference))
            .select(processed_payments::order_id)
            .first::<Uuid>(&mut conn)
            .await
            .optional()?;
        Ok(owner)
    }

    async fn enqueue_ledger_work(&self, tasks: &[LedgerTask]) -> Result<()> {
        let rows = ledger_rows(tasks)?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        diesel::insert_into(ledger_tasks::table)
            .values(&rows)
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn ledger_work_for(&self, order_id: Uuid) -> Result<Vec<LedgerTask>> {
        let mut conn = self.pool.get().await?;
        let rows = ledger_tasks::table
            .filter(ledger_tasks::order_id.eq(order_id))
            .filter(ledger_tasks::completed_at.is_null())
            .order(ledger_tasks::seq.asc())
            .load::<DbLedgerTask>(&mut conn)
            .await?;
        rows.into_iter().map(LedgerTask::try_from).collect()
    }

    async fn outstanding_ledger_work(&self, limit: i64) -> Result<Vec<LedgerTask>> {
        let mut conn = self.pool.get().await?;
        let rows = ledger_tasks::table
            .filter(ledger_tasks::completed_at.is_null())
            .order(ledger_tasks::seq.asc())
            .limit(limit)
            .load::<DbLedgerTask>(&mut conn)
            .await?;
        rows.into_iter().map(LedgerTask::try_from).collect()
    }

    async fn complete_ledger_work(&self, task_id: Uuid) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::update(
            ledger_tasks::table
                .filter(ledger_tasks::id.eq(task_id))
                .filter(ledger_tasks::completed_at.is_null()),
        )
        .set(ledger_tasks::completed_at.eq(Some(Utc::now())))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn ledger_work_failed(&self, task_id: Uuid, error: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::update(ledger_tasks::table.filter(ledger_tasks::id.eq(task_id)))
            .set((
                ledger_tasks::attempts.eq(ledger_tasks::attempts + 1),
                ledger_tasks::last_error.eq(Some(error.to_string())),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn unpublished_events(&self, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut conn = self.pool.get().await?;
        let rows = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .load::<DbOutboxEvent>(&mut conn)
            .await?;
        Ok(rows.into_iter().map(OutboxEvent::from).collect())
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(event_id)))
            .set(outbox_events::processed.eq(true))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
