//! The per-record transition core.
//!
//! Everything in here is synchronous and storage-agnostic: a store loads the
//! row for a key under its own lock, calls [`AvailabilityRecord::apply`] and
//! writes the result back.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use shared::DrumSize;
use std::fmt;
use uuid::Uuid;

use crate::error::LedgerError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AvailabilityKey {
    pub vendor_id: Uuid,
    pub delivery_date: NaiveDate,
    pub drum_size: DrumSize,
}

impl AvailabilityKey {
    pub fn new(vendor_id: Uuid, delivery_date: NaiveDate, drum_size: DrumSize) -> Self {
        Self { vendor_id, delivery_date, drum_size }
    }
}

impl fmt::Display for AvailabilityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vendor_id, self.delivery_date, self.drum_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    Reserve(i32),
    Convert(i32),
    Release { quantity: i32, from_booked: bool },
    /// Grow the pool for this date (a drum came back after delivery).
    Credit(i32),
    /// Heal the cached `available_count` only.
    Reconcile,
}

/// Irregularities found while applying a mutation. None of them fail the
/// caller; they are reported for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LedgerFlag {
    ReconciliationMismatch { stored: i32, expected: i32 },
    Overcommitted { total_capacity: i32, committed: i32 },
    MissingRecord,
    UnderReserved { requested: i32, converted: i32 },
    OverRelease { requested: i32, released: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityRecord {
    #[serde(flatten)]
    pub key: AvailabilityKey,
    pub total_capacity: i32,
    pub reserved_count: i32,
    pub booked_count: i32,
    /// Cached projection of the other three counters.
    pub available_count: i32,
}

/// Read-side view of a record with `available_count` recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityView {
    pub drum_size: DrumSize,
    pub total_capacity: i32,
    pub booked_count: i32,
    pub reserved_count: i32,
    pub available_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub record: AvailabilityRecord,
    /// Drums actually moved by the mutation.
    pub moved: i32,
    pub flags: Vec<LedgerFlag>,
    /// The operation id had already been applied; nothing changed.
    pub replayed: bool,
}

impl Applied {
    pub fn replayed(record: AvailabilityRecord) -> Self {
        Self {
            record,
            moved: 0,
            flags: Vec::new(),
            replayed: true,
        }
    }
}

impl AvailabilityRecord {
    pub fn seeded(key: AvailabilityKey, total_capacity: i32) -> Self {
        let total_capacity = total_capacity.max(0);
        Self {
            key,
            total_capacity,
            reserved_count: 0,
            booked_count: 0,
            available_count: total_capacity,
        }
    }

    pub fn expected_available(&self) -> i32 {
        (self.total_capacity - self.booked_count - self.reserved_count).max(0)
    }

    pub fn is_consistent(&self) -> bool {
        self.available_count == self.expected_available()
            && self.reserved_count + self.booked_count <= self.total_capacity
    }

    pub fn view(&self) -> AvailabilityView {
        AvailabilityView {
            drum_size: self.key.drum_size,
            total_capacity: self.total_capacity,
            booked_count: self.booked_count,
            reserved_count: self.reserved_count,
            available_count: self.expected_available(),
        }
    }

    fn heal(&mut self, flags: &mut Vec<LedgerFlag>) {
        let committed = self.reserved_count + self.booked_count;
        if committed > self.total_capacity {
            flags.push(LedgerFlag::Overcommitted {
                total_capacity: self.total_capacity,
                committed,
            });
        }
        let expected = self.expected_available();
        if self.available_count != expected {
            flags.push(LedgerFlag::ReconciliationMismatch {
                stored: self.available_count,
                expected,
            });
            self.available_count = expected;
        }
    }

    /// Applies one transition. On error the counters are left as they were
    /// (apart from healing the cached `available_count`).
    pub fn apply(&mut self, mutation: Mutation, created: bool) -> Result<Applied, LedgerError> {
        let mut flags = Vec::new();
        self.heal(&mut flags);

        let moved = match mutation {
            Mutation::Reserve(quantity) => {
                ensure_positive(quantity)?;
                let available = self.expected_available();
                if available < quantity {
                    return Err(LedgerError::InsufficientCapacity {
                        size: self.key.drum_size,
                        available,
                        requested: quantity,
                    });
                }
                self.reserved_count += quantity;
                quantity
            }
            Mutation::Convert(quantity) => {
                ensure_positive(quantity)?;
                if created {
                    flags.push(LedgerFlag::MissingRecord);
                }
                let converted = quantity.min(self.reserved_count);
                if converted < quantity {
                    flags.push(LedgerFlag::UnderReserved { requested: quantity, converted });
                }
                self.reserved_count -= converted;
                self.booked_count += converted;
                converted
            }
            Mutation::Release { quantity, from_booked } => {
                ensure_positive(quantity)?;
                if created {
                    flags.push(LedgerFlag::MissingRecord);
                }
                let counter = if from_booked {
                    &mut self.booked_count
                } else {
                    &mut self.reserved_count
                };
                let released = quantity.min(*counter);
                *counter -= released;
                if released < quantity {
                    flags.push(LedgerFlag::OverRelease { requested: quantity, released });
                }
                released
            }
            Mutation::Credit(quantity) => {
                ensure_positive(quantity)?;
                self.total_capacity = self.total_capacity.checked_add(quantity).ok_or(
                    LedgerError::CapacityOverflow {
                        size: self.key.drum_size,
                        total_capacity: self.total_capacity,
                        quantity,
                    },
                )?;
                quantity
            }
            Mutation::Reconcile => 0,
        };

        self.available_count = self.expected_available();

        Ok(Applied {
            record: self.clone(),
            moved,
            flags,
            replayed: false,
        })
    }
}

fn ensure_positive(quantity: i32) -> Result<(), LedgerError> {
    if quantity <= 0 {
        return Err(LedgerError::InvalidQuantity(quantity));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total: i32) -> AvailabilityRecord {
        let key = AvailabilityKey::new(
            Uuid::new_v4(),
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            DrumSize::Small,
        );
        AvailabilityRecord::seeded(key, total)
    }

    fn conserved(record: &AvailabilityRecord) -> bool {
        record.reserved_count + record.booked_count + record.available_count == record.total_capacity
    }

    #[test]
    fn reserve_rejects_more_than_available() {
        let mut rec = record(2);
        rec.apply(Mutation::Reserve(2), true).unwrap();
        assert_eq!(rec.available_count, 0);

        let err = rec.apply(Mutation::Reserve(1), false).unwrap_err();
        match err {
            LedgerError::InsufficientCapacity { available, requested, .. } => {
                assert_eq!(available, 0);
                assert_eq!(requested, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(rec.reserved_count, 2);
        assert!(conserved(&rec));
    }

    #[test]
    fn non_positive_quantities_are_rejected() {
        let mut rec = record(2);
        assert!(matches!(rec.apply(Mutation::Reserve(0), true), Err(LedgerError::InvalidQuantity(0))));
        assert!(matches!(rec.apply(Mutation::Convert(-1), false), Err(LedgerError::InvalidQuantity(-1))));
        assert_eq!(rec, record_like(&rec, 2, 0, 0));
    }

    fn record_like(rec: &AvailabilityRecord, total: i32, reserved: i32, booked: i32) -> AvailabilityRecord {
        AvailabilityRecord {
            key: rec.key.clone(),
            total_capacity: total,
            reserved_count: reserved,
            booked_count: booked,
            available_count: total - reserved - booked,
        }
    }

    #[test]
    fn convert_moves_only_what_is_reserved() {
        let mut rec = record(5);
        rec.apply(Mutation::Reserve(2), true).unwrap();

        let applied = rec.apply(Mutation::Convert(3), false).unwrap();
        assert_eq!(applied.moved, 2);
        assert_eq!(applied.flags, vec![LedgerFlag::UnderReserved { requested: 3, converted: 2 }]);
        assert_eq!(rec.reserved_count, 0);
        assert_eq!(rec.booked_count, 2);
        assert_eq!(rec.available_count, 3);
        assert!(conserved(&rec));
    }

    #[test]
    fn convert_on_fresh_record_flags_missing_reservation() {
        let mut rec = record(4);
        let applied = rec.apply(Mutation::Convert(1), true).unwrap();
        assert_eq!(applied.moved, 0);
        assert!(applied.flags.contains(&LedgerFlag::MissingRecord));
        assert_eq!(rec.booked_count, 0);
        assert_eq!(rec.available_count, 4);
    }

    #[test]
    fn release_clamps_at_zero() {
        let mut rec = record(3);
        rec.apply(Mutation::Reserve(2), true).unwrap();
        rec.apply(Mutation::Convert(2), false).unwrap();

        let first = rec.apply(Mutation::Release { quantity: 2, from_booked: true }, false).unwrap();
        assert_eq!(first.moved, 2);
        let second = rec.apply(Mutation::Release { quantity: 2, from_booked: true }, false).unwrap();
        assert_eq!(second.moved, 0);
        assert_eq!(second.flags, vec![LedgerFlag::OverRelease { requested: 2, released: 0 }]);

        assert_eq!(rec.booked_count, 0);
        assert_eq!(rec.available_count, 3);
        assert!(conserved(&rec));
    }

    #[test]
    fn credit_grows_the_pool() {
        let mut rec = record(1);
        rec.apply(Mutation::Reserve(1), true).unwrap();
        rec.apply(Mutation::Credit(1), false).unwrap();
        assert_eq!(rec.total_capacity, 2);
        assert_eq!(rec.available_count, 1);
        assert!(conserved(&rec));
    }

    #[test]
    fn credit_refuses_to_overflow_capacity() {
        let mut rec = record(i32::MAX);
        let err = rec.apply(Mutation::Credit(2), false).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::CapacityOverflow { total_capacity: i32::MAX, quantity: 2, .. }
        ));
        assert_eq!(rec.total_capacity, i32::MAX);
        assert!(conserved(&rec));
    }

    #[test]
    fn stale_available_count_is_healed_and_flagged() {
        let mut rec = record(5);
        rec.reserved_count = 1;
        rec.available_count = 5;

        let applied = rec.apply(Mutation::Reconcile, false).unwrap();
        assert_eq!(applied.flags, vec![LedgerFlag::ReconciliationMismatch { stored: 5, expected: 4 }]);
        assert_eq!(rec.available_count, 4);
        assert!(rec.is_consistent());
    }

    #[test]
    fn reserve_uses_recomputed_availability_not_the_cached_one() {
        let mut rec = record(3);
        rec.booked_count = 3;
        rec.available_count = 3;

        assert!(rec.apply(Mutation::Reserve(1), false).is_err());
        assert_eq!(rec.available_count, 0);
    }
}
