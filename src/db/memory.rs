use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use eyre::{bail, Result};
use tokio::sync::RwLock;

use super::{NewSettlement, RecordUpdate, SettlementRecord, SettlementStore};
use crate::types::Status;

/// In-process store with the same uniqueness rules as the `settlements`
/// table. Used by tests and for running without Postgres.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, SettlementRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as-is, bypassing the pending-only insert rule
    pub async fn put(&self, record: SettlementRecord) {
        self.records
            .write()
            .await
            .insert(record.external_id.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn source_ref_taken(
    records: &HashMap<String, SettlementRecord>,
    reference: &str,
    owner: &str,
) -> bool {
    records
        .values()
        .any(|r| r.external_id != owner && r.source_chain_ref.as_deref() == Some(reference))
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn insert(&self, new: &NewSettlement) -> Result<Option<SettlementRecord>> {
        let mut records = self.records.write().await;
        if records.contains_key(&new.external_id) {
            return Ok(None);
        }
        if let Some(reference) = &new.source_chain_ref {
            if source_ref_taken(&records, reference, &new.external_id) {
                bail!("source_chain_ref {} already attached to another settlement", reference);
            }
        }

        let now = Utc::now();
        let record = SettlementRecord {
            id: new.id,
            external_id: new.external_id.clone(),
            kind: new.kind,
            asset: new.asset,
            amount: new.amount.clone(),
            target_amount: None,
            caller_identity: new.caller_identity.clone(),
            counterparty_address: new.counterparty_address.clone(),
            source_chain_ref: new.source_chain_ref.clone(),
            target_chain_ref: None,
            status: Status::Pending,
            operation_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        records.insert(new.external_id.clone(), record.clone());
        Ok(Some(record))
    }

    async fn select_by_external_id(&self, external_id: &str) -> Result<Option<SettlementRecord>> {
        Ok(self.records.read().await.get(external_id).cloned())
    }

    async fn select_by_source_chain_ref(
        &self,
        source_chain_ref: &str,
    ) -> Result<Option<SettlementRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.source_chain_ref.as_deref() == Some(source_chain_ref))
            .cloned())
    }

    async fn update_fields(
        &self,
        external_id: &str,
        expected: Status,
        update: &RecordUpdate,
    ) -> Result<Option<SettlementRecord>> {
        let mut records = self.records.write().await;
        if let Some(reference) = &update.source_chain_ref {
            if source_ref_taken(&records, reference, external_id) {
                bail!("source_chain_ref {} already attached to another settlement", reference);
            }
        }

        match records.get_mut(external_id) {
            Some(record) if record.status == expected => {
                update.apply_to(record, Utc::now());
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn select_by_status(&self, status: Status) -> Result<Vec<SettlementRecord>> {
        let mut rows: Vec<SettlementRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn count_by_status(&self) -> Result<Vec<(Status, i64)>> {
        let records = self.records.read().await;
        Ok(Status::ALL
            .iter()
            .map(|s| (*s, records.values().filter(|r| r.status == *s).count() as i64))
            .filter(|(_, n)| *n > 0)
            .collect())
    }
}
