//! In-process stores, used when the service runs without a database and by
//! the test suites.

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use shared::DrumSize;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::record::{Applied, AvailabilityKey, AvailabilityRecord, Mutation};
use crate::store::{AvailabilityStore, VendorStock};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<AvailabilityKey, AvailabilityRecord>,
    operations: DashMap<Uuid, AvailabilityKey>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a record verbatim, bypassing the transition rules.
    pub fn put_raw(&self, record: AvailabilityRecord) {
        self.records.insert(record.key.clone(), record);
    }
}

#[async_trait]
impl AvailabilityStore for MemoryStore {
    async fn apply(
        &self,
        key: &AvailabilityKey,
        seed_capacity: i32,
        mutation: Mutation,
        operation: Option<Uuid>,
    ) -> Result<Applied, LedgerError> {
        let mut created = false;
        // The entry guard holds the key's shard for the whole transition.
        let mut record = self.records.entry(key.clone()).or_insert_with(|| {
            created = true;
            AvailabilityRecord::seeded(key.clone(), seed_capacity)
        });
        if let Some(operation) = operation {
            if self.operations.contains_key(&operation) {
                return Ok(Applied::replayed(record.clone()));
            }
        }
        let applied = record.apply(mutation, created)?;
        if let Some(operation) = operation {
            self.operations.insert(operation, key.clone());
        }
        Ok(applied)
    }

    async fn load(&self, key: &AvailabilityKey) -> anyhow::Result<Option<AvailabilityRecord>> {
        Ok(self.records.get(key).map(|record| record.clone()))
    }

    async fn load_for_date(&self, vendor_id: Uuid, date: NaiveDate) -> anyhow::Result<Vec<AvailabilityRecord>> {
        let mut records: Vec<AvailabilityRecord> = self
            .records
            .iter()
            .filter(|entry| entry.key().vendor_id == vendor_id && entry.key().delivery_date == date)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.key.drum_size);
        Ok(records)
    }

    async fn mismatched_keys(&self) -> anyhow::Result<Vec<AvailabilityKey>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| !entry.value().is_consistent())
            .map(|entry| entry.key().clone())
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryVendorStock {
    stock: DashMap<(Uuid, DrumSize), i32>,
}

impl MemoryVendorStock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VendorStock for MemoryVendorStock {
    async fn stock_for(&self, vendor_id: Uuid, size: DrumSize) -> anyhow::Result<Option<i32>> {
        Ok(self.stock.get(&(vendor_id, size)).map(|stock| *stock))
    }

    async fn configured(&self, vendor_id: Uuid) -> anyhow::Result<Vec<(DrumSize, i32)>> {
        let mut sizes: Vec<(DrumSize, i32)> = self
            .stock
            .iter()
            .filter(|entry| entry.key().0 == vendor_id)
            .map(|entry| (entry.key().1, *entry.value()))
            .collect();
        sizes.sort();
        Ok(sizes)
    }

    async fn set_stock(&self, vendor_id: Uuid, size: DrumSize, stock: i32) -> anyhow::Result<()> {
        self.stock.insert((vendor_id, size), stock);
        Ok(())
    }
}
