use diesel::prelude::*;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::record::{AvailabilityKey, AvailabilityRecord};

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::drum_availability)]
pub struct DbAvailability {
    pub vendor_id: Uuid,
    pub delivery_date: NaiveDate,
    pub drum_size: String,
    pub total_capacity: i32,
    pub reserved_count: i32,
    pub booked_count: i32,
    pub available_count: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::drum_availability)]
pub struct NewAvailability {
    pub vendor_id: Uuid,
    pub delivery_date: NaiveDate,
    pub drum_size: String,
    pub total_capacity: i32,
    pub reserved_count: i32,
    pub booked_count: i32,
    pub available_count: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::vendor_drum_stock)]
pub struct NewVendorStock {
    pub vendor_id: Uuid,
    pub drum_size: String,
    pub stock: i32,
}

/// Marks an operation id as applied to one availability record.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::drum_ledger_operations)]
pub struct NewLedgerOperation {
    pub operation_id: Uuid,
    pub vendor_id: Uuid,
    pub delivery_date: NaiveDate,
    pub drum_size: String,
}

impl NewLedgerOperation {
    pub fn new(operation_id: Uuid, key: &AvailabilityKey) -> Self {
        Self {
            operation_id,
            vendor_id: key.vendor_id,
            delivery_date: key.delivery_date,
            drum_size: key.drum_size.as_str().to_string(),
        }
    }
}

impl NewAvailability {
    pub fn seeded(key: &AvailabilityKey, total_capacity: i32) -> Self {
        let record = AvailabilityRecord::seeded(key.clone(), total_capacity);
        Self {
            vendor_id: key.vendor_id,
            delivery_date: key.delivery_date,
            drum_size: key.drum_size.as_str().to_string(),
            total_capacity: record.total_capacity,
            reserved_count: record.reserved_count,
            booked_count: record.booked_count,
            available_count: record.available_count,
        }
    }
}

impl TryFrom<DbAvailability> for AvailabilityRecord {
    type Error = anyhow::Error;

    fn try_from(row: DbAvailability) -> Result<Self, Self::Error> {
        Ok(Self {
            key: AvailabilityKey::new(row.vendor_id, row.delivery_date, row.drum_size.parse()?),
            total_capacity: row.total_capacity,
            reserved_count: row.reserved_count,
            booked_count: row.booked_count,
            available_count: row.available_count,
        })
    }
}
