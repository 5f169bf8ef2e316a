use async_trait::async_trait;
use chrono::NaiveDate;
use shared::DrumSize;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::record::{Applied, AvailabilityKey, AvailabilityRecord, Mutation};

/// Row access for availability records.
///
/// Implementations must apply every mutation for a key atomically with respect
/// to every other mutation for the same key: load (or lazily create with
/// `seed_capacity`), run [`AvailabilityRecord::apply`], persist, all while the
/// record is held exclusively. Different keys need no coordination.
///
/// A mutation carrying an `operation` id is applied at most once: the id is
/// recorded under the same lock, and a repeat returns [`Applied::replayed`]
/// with the record untouched.
#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    async fn apply(
        &self,
        key: &AvailabilityKey,
        seed_capacity: i32,
        mutation: Mutation,
        operation: Option<Uuid>,
    ) -> Result<Applied, LedgerError>;

    async fn load(&self, key: &AvailabilityKey) -> anyhow::Result<Option<AvailabilityRecord>>;

    async fn load_for_date(&self, vendor_id: Uuid, date: NaiveDate) -> anyhow::Result<Vec<AvailabilityRecord>>;

    /// Keys whose stored `available_count` no longer matches the counters.
    async fn mismatched_keys(&self) -> anyhow::Result<Vec<AvailabilityKey>>;
}

/// The vendor configuration store that seeds `total_capacity`.
#[async_trait]
pub trait VendorStock: Send + Sync {
    async fn stock_for(&self, vendor_id: Uuid, size: DrumSize) -> anyhow::Result<Option<i32>>;

    async fn configured(&self, vendor_id: Uuid) -> anyhow::Result<Vec<(DrumSize, i32)>>;

    async fn set_stock(&self, vendor_id: Uuid, size: DrumSize, stock: i32) -> anyhow::Result<()>;
}
