use chrono::NaiveDate;
use shared::DrumSize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::memory::{MemoryStore, MemoryVendorStock};
use crate::record::{Applied, AvailabilityKey, AvailabilityRecord, AvailabilityView, LedgerFlag, Mutation};
use crate::store::{AvailabilityStore, VendorStock};

/// Drum capacity per (vendor, delivery date, drum size).
///
/// Every capacity-affecting operation goes through [`AvailabilityStore::apply`],
/// so all of them are serialized per key by the store. The ledger never emits
/// notifications; callers do that once a mutation has succeeded.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn AvailabilityStore>,
    stock: Arc<dyn VendorStock>,
}

impl Ledger {
    pub fn new(store: Arc<dyn AvailabilityStore>, stock: Arc<dyn VendorStock>) -> Self {
        Self { store, stock }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(MemoryVendorStock::new()))
    }

    /// Holds `quantity` drums against an unpaid order.
    pub async fn reserve(&self, key: &AvailabilityKey, quantity: i32) -> Result<Applied, LedgerError> {
        let applied = self.mutate(key, Mutation::Reserve(quantity), None).await?;
        info!(
            "Reserved {} drums on {}, {} left",
            quantity, key, applied.record.available_count
        );
        Ok(applied)
    }

    /// Commits up to `quantity` reserved drums once payment arrives. Converts
    /// only what is actually reserved; a shortfall is flagged, never borrowed
    /// from the available pool.
    pub async fn convert_reserved_to_booked(&self, key: &AvailabilityKey, quantity: i32) -> Result<Applied, LedgerError> {
        let applied = self.mutate(key, Mutation::Convert(quantity), None).await?;
        info!("Booked {} of {} reserved drums on {}", applied.moved, quantity, key);
        Ok(applied)
    }

    pub async fn release(&self, key: &AvailabilityKey, quantity: i32, from_booked: bool) -> Result<Applied, LedgerError> {
        let applied = self
            .mutate(key, Mutation::Release { quantity, from_booked }, None)
            .await?;
        info!(
            "Released {} {} drums on {}",
            applied.moved,
            if from_booked { "booked" } else { "reserved" },
            key
        );
        Ok(applied)
    }

    /// Puts physically returned drums back into circulation. Returns to the
    /// original delivery date while that date is still ahead; otherwise the
    /// drums are credited to `today` so they can be ordered right away.
    pub async fn return_booked_immediately(
        &self,
        vendor_id: Uuid,
        original_date: NaiveDate,
        size: DrumSize,
        quantity: i32,
        today: NaiveDate,
    ) -> Result<Applied, LedgerError> {
        let (key, mutation) = Self::return_target(vendor_id, original_date, size, quantity, today);
        let applied = self.mutate(&key, mutation, None).await?;
        info!(
            "Returned {} drums to {} (originally delivered {})",
            quantity, key, original_date
        );
        Ok(applied)
    }

    /// Where a drum return lands and what it does there.
    pub fn return_target(
        vendor_id: Uuid,
        original_date: NaiveDate,
        size: DrumSize,
        quantity: i32,
        today: NaiveDate,
    ) -> (AvailabilityKey, Mutation) {
        if original_date >= today {
            (
                AvailabilityKey::new(vendor_id, original_date, size),
                Mutation::Release { quantity, from_booked: true },
            )
        } else {
            (AvailabilityKey::new(vendor_id, today, size), Mutation::Credit(quantity))
        }
    }

    /// Applies `mutation` under `operation_id`. Running the same id again,
    /// from a retry or from a second worker, changes nothing.
    pub async fn apply_once(
        &self,
        operation_id: Uuid,
        key: &AvailabilityKey,
        mutation: Mutation,
    ) -> Result<Applied, LedgerError> {
        let applied = self.mutate(key, mutation, Some(operation_id)).await?;
        if applied.replayed {
            info!("Ledger operation {} on {} was already applied", operation_id, key);
        } else {
            info!("Applied {:?} on {} as operation {}", mutation, key, operation_id);
        }
        Ok(applied)
    }

    /// Capacity for a vendor on `date`, one entry per size. Sizes the vendor
    /// stocks but nobody has ordered yet are projected from the stock config.
    pub async fn availability(
        &self,
        vendor_id: Uuid,
        date: NaiveDate,
        size: Option<DrumSize>,
    ) -> Result<Vec<AvailabilityView>, LedgerError> {
        let mut views: BTreeMap<DrumSize, AvailabilityView> = BTreeMap::new();

        for (drum_size, stock) in self.stock.configured(vendor_id).await? {
            let key = AvailabilityKey::new(vendor_id, date, drum_size);
            views.insert(drum_size, AvailabilityRecord::seeded(key, stock).view());
        }

        for record in self.store.load_for_date(vendor_id, date).await? {
            if !record.is_consistent() {
                warn!(
                    "Stored availability for {} is stale (stored {}, expected {})",
                    record.key,
                    record.available_count,
                    record.expected_available()
                );
            }
            views.insert(record.key.drum_size, record.view());
        }

        if let Some(size) = size {
            let view = match views.remove(&size) {
                Some(view) => view,
                None => AvailabilityRecord::seeded(AvailabilityKey::new(vendor_id, date, size), 0).view(),
            };
            return Ok(vec![view]);
        }

        Ok(views.into_values().collect())
    }

    pub async fn set_stock(&self, vendor_id: Uuid, size: DrumSize, stock: i32) -> Result<(), LedgerError> {
        if stock < 0 {
            return Err(LedgerError::InvalidStock(stock));
        }
        self.stock.set_stock(vendor_id, size, stock).await?;
        info!("Vendor {} now stocks {} {} drums", vendor_id, stock, size);
        Ok(())
    }

    /// Heals every record whose cached `available_count` drifted. Returns how
    /// many records were touched.
    pub async fn reconcile(&self) -> Result<usize, LedgerError> {
        let keys = self.store.mismatched_keys().await?;
        for key in &keys {
            self.mutate(key, Mutation::Reconcile, None).await?;
        }
        if !keys.is_empty() {
            warn!("Reconciled {} availability records", keys.len());
        }
        Ok(keys.len())
    }

    async fn mutate(
        &self,
        key: &AvailabilityKey,
        mutation: Mutation,
        operation: Option<Uuid>,
    ) -> Result<Applied, LedgerError> {
        let seed = self
            .stock
            .stock_for(key.vendor_id, key.drum_size)
            .await?
            .unwrap_or(0)
            .max(0);
        let applied = self.store.apply(key, seed, mutation, operation).await?;
        report(key, &mutation, &applied.flags);
        Ok(applied)
    }
}

fn report(key: &AvailabilityKey, mutation: &Mutation, flags: &[LedgerFlag]) {
    for flag in flags {
        match flag {
            LedgerFlag::ReconciliationMismatch { stored, expected } => warn!(
                "Reconciliation mismatch on {}: stored available {} but counters give {}",
                key, stored, expected
            ),
            LedgerFlag::Overcommitted { total_capacity, committed } => warn!(
                "Over-committed record {}: {} drums committed against capacity {}",
                key, committed, total_capacity
            ),
            LedgerFlag::MissingRecord => warn!(
                "No availability record existed for {} during {:?}; needs manual review",
                key, mutation
            ),
            LedgerFlag::UnderReserved { requested, converted } => warn!(
                "Only {} of {} drums were reserved on {} when booking; needs manual review",
                converted, requested, key
            ),
            LedgerFlag::OverRelease { requested, released } => warn!(
                "Released {} of {} drums on {}; the rest were not held",
                released, requested, key
            ),
        }
    }
}
