//! Storage backends for transactional units.
//!
//! The coordinator only talks to [`ImportStore`]. [`PgStore`] writes to
//! Postgres; [`MemoryStore`] keeps rows in process for tests and dry runs.

pub mod memory;
pub mod migration;
pub mod postgres;

pub use memory::{MemoryStore, UnitEvent, UnitEventKind};
pub use migration::run_migrations;
pub use postgres::PgStore;

use crate::import::error::StoreError;
use crate::import::result::ImportResult;
use crate::import::unit::TransactionalUnit;
use chrono::{DateTime, Utc};

#[rocket::async_trait]
pub trait ImportStore: Send + Sync {
    /// Apply every operation of `unit` inside one transaction.
    ///
    /// Either all operations commit and their identifiers are returned, or
    /// nothing is written.
    async fn run_unit(&self, unit: &TransactionalUnit) -> Result<ImportResult, StoreError>;

    /// Flag the given blocks so an indexer fetches them again. Returns the
    /// number of blocks flagged.
    async fn mark_blocks_for_refetch(
        &self,
        numbers: &[i64],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}
