use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::types::{Asset, SettlementKind, Status};

// Amounts are carried as plain decimal strings. The database stores them as
// NUMERIC; inserts cast with `$n::NUMERIC` and selects read back `::TEXT`, so
// `amount` is always rendered with the column's full scale ("1.500000000").

/// One settlement from intake to its terminal status
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub id: Uuid,
    /// Client-supplied idempotency key
    pub external_id: String,
    pub kind: SettlementKind,
    pub asset: Asset,
    /// Source-chain amount, 9 fractional digits
    pub amount: String,
    /// ZEC sent, 8 fractional digits; set together with `submitted`
    pub target_amount: Option<String>,
    /// Caller's source-chain public key
    pub caller_identity: String,
    /// Shielded recipient on the Zcash side
    pub counterparty_address: String,
    /// Source-chain transaction signature
    pub source_chain_ref: Option<String>,
    /// Zcash txid; present iff `status == sent`
    pub target_chain_ref: Option<String>,
    pub status: Status,
    /// zcashd async operation id; present iff `status == submitted`
    pub operation_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// For inserting new settlements; always inserted as `pending`
#[derive(Debug, Clone)]
pub struct NewSettlement {
    pub id: Uuid,
    pub external_id: String,
    pub kind: SettlementKind,
    pub asset: Asset,
    pub amount: String,
    pub caller_identity: String,
    pub counterparty_address: String,
    pub source_chain_ref: Option<String>,
}

/// Partial update applied by `SettlementStore::update_fields`.
///
/// `None` leaves a column untouched. `operation_id` is doubly optional so it
/// can be cleared: `Some(None)` writes NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub status: Option<Status>,
    pub operation_id: Option<Option<String>>,
    pub source_chain_ref: Option<String>,
    pub target_chain_ref: Option<String>,
    pub target_amount: Option<String>,
    pub failure_reason: Option<String>,
}

impl RecordUpdate {
    /// `pending -> submitted`
    pub fn submitted(operation_id: String, target_amount: String) -> Self {
        Self {
            status: Some(Status::Submitted),
            operation_id: Some(Some(operation_id)),
            target_amount: Some(target_amount),
            ..Default::default()
        }
    }

    /// `submitted -> sent`
    pub fn sent(txid: String) -> Self {
        Self {
            status: Some(Status::Sent),
            operation_id: Some(None),
            target_chain_ref: Some(txid),
            ..Default::default()
        }
    }

    /// `pending | submitted -> failed`
    pub fn failed(reason: String) -> Self {
        Self {
            status: Some(Status::Failed),
            operation_id: Some(None),
            failure_reason: Some(reason),
            ..Default::default()
        }
    }

    /// Quote written ahead of `z_sendmany`; status stays `pending`
    pub fn quoted(target_amount: String) -> Self {
        Self {
            target_amount: Some(target_amount),
            ..Default::default()
        }
    }

    pub fn source_chain_ref(reference: String) -> Self {
        Self {
            source_chain_ref: Some(reference),
            ..Default::default()
        }
    }

    /// Apply to an in-memory copy of a record
    pub fn apply_to(&self, record: &mut SettlementRecord, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(operation_id) = &self.operation_id {
            record.operation_id = operation_id.clone();
        }
        if let Some(reference) = &self.source_chain_ref {
            record.source_chain_ref = Some(reference.clone());
        }
        if let Some(txid) = &self.target_chain_ref {
            record.target_chain_ref = Some(txid.clone());
        }
        if let Some(amount) = &self.target_amount {
            record.target_amount = Some(amount.clone());
        }
        if let Some(reason) = &self.failure_reason {
            record.failure_reason = Some(reason.clone());
        }
        record.updated_at = now;
    }
}
