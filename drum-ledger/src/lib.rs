pub mod error;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod pg;
pub mod record;
pub mod schema;
pub mod store;

pub use error::LedgerError;
pub use ledger::Ledger;
pub use memory::{MemoryStore, MemoryVendorStock};
pub use pg::{DbPool, PgStore, PgVendorStock};
pub use record::{Applied, AvailabilityKey, AvailabilityRecord, AvailabilityView, LedgerFlag, Mutation};
pub use store::{AvailabilityStore, VendorStock};
