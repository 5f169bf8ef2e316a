use shared::DrumSize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Only {available} {size} drums available for this date. Another customer may have reserved them.")]
    InsufficientCapacity {
        size: DrumSize,
        available: i32,
        requested: i32,
    },

    #[error("drum quantity must be positive, got {0}")]
    InvalidQuantity(i32),

    #[error("crediting {quantity} {size} drums would overflow a capacity of {total_capacity}")]
    CapacityOverflow {
        size: DrumSize,
        total_capacity: i32,
        quantity: i32,
    },

    #[error("vendor stock must not be negative, got {0}")]
    InvalidStock(i32),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl LedgerError {
    /// Errors the caller can hand back to the customer as-is.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientCapacity { .. }
                | LedgerError::InvalidQuantity(_)
                | LedgerError::InvalidStock(_)
        )
    }
}
