use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::PgPool;
use tracing::error;

use super::{NewSettlement, RecordUpdate, SettlementRecord, SettlementStore};
use crate::types::Status;

// Cast amounts to TEXT since sqlx can't decode NUMERIC into String
const RECORD_COLUMNS: &str = r#"id, external_id, kind, asset, amount::TEXT AS amount,
    target_amount::TEXT AS target_amount, caller_identity, counterparty_address,
    source_chain_ref, target_chain_ref, status, operation_id, failure_reason,
    created_at, updated_at"#;

/// Postgres-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn select_one_by(&self, column: &str, value: &str) -> Result<Option<SettlementRecord>> {
        let sql = format!(
            "SELECT {} FROM settlements WHERE {} = $1",
            RECORD_COLUMNS, column
        );
        let row = sqlx::query_as::<_, SettlementRecord>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("SQL error selecting settlement by {}: {:?}", column, e);
                e
            })
            .wrap_err_with(|| format!("Failed to select settlement by {}", column))?;

        Ok(row)
    }
}

#[async_trait]
impl SettlementStore for PgStore {
    async fn insert(&self, new: &NewSettlement) -> Result<Option<SettlementRecord>> {
        // Duplicate external ids hit ON CONFLICT and return no row
        let sql = format!(
            r#"
            INSERT INTO settlements (id, external_id, kind, asset, amount, caller_identity,
                counterparty_address, source_chain_ref, status)
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7, $8, 'pending')
            ON CONFLICT (external_id) DO NOTHING
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, SettlementRecord>(&sql)
            .bind(new.id)
            .bind(&new.external_id)
            .bind(new.kind)
            .bind(new.asset)
            .bind(&new.amount)
            .bind(&new.caller_identity)
            .bind(&new.counterparty_address)
            .bind(&new.source_chain_ref)
            .fetch_optional(&self.pool)
            .await
            .wrap_err("Failed to insert settlement")?;

        Ok(row)
    }

    async fn select_by_external_id(&self, external_id: &str) -> Result<Option<SettlementRecord>> {
        self.select_one_by("external_id", external_id).await
    }

    async fn select_by_source_chain_ref(
        &self,
        source_chain_ref: &str,
    ) -> Result<Option<SettlementRecord>> {
        self.select_one_by("source_chain_ref", source_chain_ref)
            .await
    }

    async fn update_fields(
        &self,
        external_id: &str,
        expected: Status,
        update: &RecordUpdate,
    ) -> Result<Option<SettlementRecord>> {
        let sql = format!(
            r#"
            UPDATE settlements SET
                status = COALESCE($3::VARCHAR, status),
                operation_id = CASE WHEN $4::BOOLEAN THEN $5::VARCHAR ELSE operation_id END,
                source_chain_ref = COALESCE($6::VARCHAR, source_chain_ref),
                target_chain_ref = COALESCE($7::VARCHAR, target_chain_ref),
                target_amount = COALESCE($8::NUMERIC, target_amount),
                failure_reason = COALESCE($9::TEXT, failure_reason),
                updated_at = NOW()
            WHERE external_id = $1 AND status = $2
            RETURNING {}
            "#,
            RECORD_COLUMNS
        );
        let row = sqlx::query_as::<_, SettlementRecord>(&sql)
            .bind(external_id)
            .bind(expected)
            .bind(update.status)
            .bind(update.operation_id.is_some())
            .bind(update.operation_id.clone().flatten())
            .bind(&update.source_chain_ref)
            .bind(&update.target_chain_ref)
            .bind(&update.target_amount)
            .bind(&update.failure_reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!(external_id, "SQL error updating settlement: {:?}", e);
                e
            })
            .wrap_err("Failed to update settlement")?;

        Ok(row)
    }

    async fn select_by_status(&self, status: Status) -> Result<Vec<SettlementRecord>> {
        let sql = format!(
            "SELECT {} FROM settlements WHERE status = $1 ORDER BY created_at ASC",
            RECORD_COLUMNS
        );
        let rows = sqlx::query_as::<_, SettlementRecord>(&sql)
            .bind(status)
            .fetch_all(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to select {} settlements", status))?;

        Ok(rows)
    }

    async fn count_by_status(&self) -> Result<Vec<(Status, i64)>> {
        let rows = sqlx::query_as::<_, (Status, i64)>(
            "SELECT status, COUNT(*) FROM settlements GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to count settlements by status")?;

        Ok(rows)
    }
}
