use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::DrumSize;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::*;
use crate::record::{Applied, AvailabilityKey, AvailabilityRecord, Mutation};
use crate::schema::*;
use crate::store::{AvailabilityStore, VendorStock};

pub type DbPool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Availability records in PostgreSQL. Each mutation runs in its own
/// transaction holding a row lock on the record.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

async fn apply_locked(
    conn: &mut AsyncPgConnection,
    key: AvailabilityKey,
    seed_capacity: i32,
    mutation: Mutation,
    operation: Option<Uuid>,
) -> Result<Applied, LedgerError> {
    conn.transaction::<_, LedgerError, _>(|conn| {
        Box::pin(async move {
            diesel::sql_query("SET LOCAL lock_timeout = '5s'")
                .execute(conn)
                .await?;

            let inserted = diesel::insert_into(drum_availability::table)
                .values(&NewAvailability::seeded(&key, seed_capacity))
                .on_conflict((
                    drum_availability::vendor_id,
                    drum_availability::delivery_date,
                    drum_availability::drum_size,
                ))
                .do_nothing()
                .execute(conn)
                .await?;

            let row = drum_availability::table
                .filter(drum_availability::vendor_id.eq(key.vendor_id))
                .filter(drum_availability::delivery_date.eq(key.delivery_date))
                .filter(drum_availability::drum_size.eq(key.drum_size.as_str()))
                .for_update()
                .load::<DbAvailability>(conn)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("Availability row {} vanished inside its transaction", key))?;

            let mut record = AvailabilityRecord::try_from(row)?;

            if let Some(operation_id) = operation {
                let recorded = diesel::insert_into(drum_ledger_operations::table)
                    .values(&NewLedgerOperation::new(operation_id, &key))
                    .on_conflict(drum_ledger_operations::operation_id)
                    .do_nothing()
                    .execute(conn)
                    .await?;
                if recorded == 0 {
                    return Ok(Applied::replayed(record));
                }
            }

            let applied = record.apply(mutation, inserted > 0)?;

            diesel::update(
                drum_availability::table
                    .filter(drum_availability::vendor_id.eq(key.vendor_id))
                    .filter(drum_availability::delivery_date.eq(key.delivery_date))
                    .filter(drum_availability::drum_size.eq(key.drum_size.as_str())),
            )
            .set((
                drum_availability::total_capacity.eq(record.total_capacity),
                drum_availability::reserved_count.eq(record.reserved_count),
                drum_availability::booked_count.eq(record.booked_count),
                drum_availability::available_count.eq(record.available_count),
                drum_availability::updated_at.eq(Some(Utc::now())),
            ))
            .execute(conn)
            .await?;

            Ok(applied)
        })
    })
    .await
}

#[async_trait]
impl AvailabilityStore for PgStore {
    async fn apply(
        &self,
        key: &AvailabilityKey,
        seed_capacity: i32,
        mutation: Mutation,
        operation: Option<Uuid>,
    ) -> Result<Applied, LedgerError> {
        let mut conn = self.pool.get().await.map_err(anyhow::Error::from)?;
        apply_locked(&mut conn, key.clone(), seed_capacity, mutation, operation).await
    }

    async fn load(&self, key: &AvailabilityKey) -> Result<Option<AvailabilityRecord>> {
        let mut conn = self.pool.get().await?;
        let row = drum_availability::table
            .filter(drum_availability::vendor_id.eq(key.vendor_id))
            .filter(drum_availability::delivery_date.eq(key.delivery_date))
            .filter(drum_availability::drum_size.eq(key.drum_size.as_str()))
            .first::<DbAvailability>(&mut conn)
            .await
            .optional()?;

        row.map(AvailabilityRecord::try_from).transpose()
    }

    async fn load_for_date(&self, vendor_id: Uuid, date: NaiveDate) -> Result<Vec<AvailabilityRecord>> {
        let mut conn = self.pool.get().await?;
        let rows = drum_availability::table
            .filter(drum_availability::vendor_id.eq(vendor_id))
            .filter(drum_availability::delivery_date.eq(date))
            .order(drum_availability::drum_size.asc())
            .load::<DbAvailability>(&mut conn)
            .await?;

        let mut records = rows
            .into_iter()
            .map(AvailabilityRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|record| record.key.drum_size);
        Ok(records)
    }

    async fn mismatched_keys(&self) -> Result<Vec<AvailabilityKey>> {
        let mut conn = self.pool.get().await?;
        let rows = drum_availability::table
            .filter(
                drum_availability::available_count.ne(drum_availability::total_capacity
                    - drum_availability::booked_count
                    - drum_availability::reserved_count),
            )
            .select((
                drum_availability::vendor_id,
                drum_availability::delivery_date,
                drum_availability::drum_size,
            ))
            .load::<(Uuid, NaiveDate, String)>(&mut conn)
            .await?;

        rows.into_iter()
            .map(|(vendor_id, date, size)| -> Result<AvailabilityKey> {
                Ok(AvailabilityKey::new(vendor_id, date, size.parse()?))
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct PgVendorStock {
    pool: DbPool,
}

impl PgVendorStock {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VendorStock for PgVendorStock {
    async fn stock_for(&self, vendor_id: Uuid, size: DrumSize) -> Result<Option<i32>> {
        let mut conn = self.pool.get().await?;
        let stock = vendor_drum_stock::table
            .filter(vendor_drum_stock::vendor_id.eq(vendor_id))
            .filter(vendor_drum_stock::drum_size.eq(size.as_str()))
            .select(vendor_drum_stock::stock)
            .first::<i32>(&mut conn)
            .await
            .optional()?;
        Ok(stock)
    }

    async fn configured(&self, vendor_id: Uuid) -> Result<Vec<(DrumSize, i32)>> {
        let mut conn = self.pool.get().await?;
        let rows = vendor_drum_stock::table
            .filter(vendor_drum_stock::vendor_id.eq(vendor_id))
            .select((vendor_drum_stock::drum_size, vendor_drum_stock::stock))
            .load::<(String, i32)>(&mut conn)
            .await?;

        let mut sizes = rows
            .into_iter()
            .map(|(size, stock)| -> Result<(DrumSize, i32)> { Ok((size.parse()?, stock)) })
            .collect::<Result<Vec<_>>>()?;
        sizes.sort();
        Ok(sizes)
    }

    async fn set_stock(&self, vendor_id: Uuid, size: DrumSize, stock: i32) -> Result<()> {
        let mut conn = self.pool.get().await?;
        diesel::insert_into(vendor_drum_stock::table)
            .values(&NewVendorStock {
                vendor_id,
                drum_size: size.as_str().to_string(),
                stock,
            })
            .on_conflict((vendor_drum_stock::vendor_id, vendor_drum_stock::drum_size))
            .do_update()
            .set((
                vendor_drum_stock::stock.eq(stock),
                vendor_drum_stock::updated_at.eq(Some(Utc::now())),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
