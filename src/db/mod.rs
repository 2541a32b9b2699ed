//! Settlement record storage
//!
//! The state machine only talks to [`SettlementStore`]; `PgStore` backs it in
//! production and `MemoryStore` in tests and local runs. Every method is a
//! single atomic statement on one record.

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::types::Status;

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PgStore;

#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Insert a new `pending` record. Returns `None` if `external_id` exists.
    async fn insert(&self, new: &NewSettlement) -> Result<Option<SettlementRecord>>;

    async fn select_by_external_id(&self, external_id: &str) -> Result<Option<SettlementRecord>>;

    async fn select_by_source_chain_ref(
        &self,
        source_chain_ref: &str,
    ) -> Result<Option<SettlementRecord>>;

    /// Compare-and-set: apply `update` only if the record is still in
    /// `expected`. Returns the updated record, or `None` if it is missing or
    /// has moved on.
    async fn update_fields(
        &self,
        external_id: &str,
        expected: Status,
        update: &RecordUpdate,
    ) -> Result<Option<SettlementRecord>>;

    /// Oldest first
    async fn select_by_status(&self, status: Status) -> Result<Vec<SettlementRecord>>;

    async fn count_by_status(&self) -> Result<Vec<(Status, i64)>>;
}

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}
