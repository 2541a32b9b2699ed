//! Settlement state machine
//!
//! ```text
//! pending ──submit ok──▶ submitted ──Success──▶ sent
//!    │                       │
//!    └──submit error──▶ failed ◀──Failed/Cancelled
//! ```
//!
//! Every transition happens under the record's lock and is written with a
//! compare-and-set on the previous status. Polling the node happens outside
//! the lock; only the commit of its outcome takes it.
//!
//! A record that has an operation id is never submitted again. Anything that
//! cannot be resolved automatically (unknown operation, node contract
//! violations) stays `submitted` and is logged for an operator.

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::address::{self, AddressKind};
use crate::conversion::{self, ConversionError};
use crate::db::{NewSettlement, RecordUpdate, SettlementRecord, SettlementStore};
use crate::error::SettlementError;
use crate::locks::RecordLocks;
use crate::metrics;
use crate::oracle::PriceOracle;
use crate::poller::{OperationPoller, Outcome, PollerSettings};
use crate::shutdown::StopToken;
use crate::types::{Asset, SettlementKind, Status, AMOUNT_SCALE, ZEC_DECIMALS};
use crate::zcash::{SendRecipient, ZcashRpc};

const MAX_ID_LEN: usize = 128;
const MAX_AMOUNT: u64 = 1_000_000_000;

/// What the request layer hands over for a new settlement
#[derive(Debug, Clone)]
pub struct SettlementIntent {
    pub external_id: String,
    pub kind: SettlementKind,
    pub asset: Asset,
    /// Decimal string in source-asset units
    pub amount: String,
    pub counterparty_address: String,
    pub caller_identity: String,
    /// Deposits that are already funded may carry their signature at intake
    pub source_chain_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub from_address: String,
    pub min_confirmations: u32,
    /// `z_sendmany` fee in ZEC
    pub fee: String,
    pub max_concurrent_polls: usize,
    pub reconcile_interval: Duration,
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub sent: usize,
    pub failed: usize,
    /// Still `submitted` after this pass (timed out)
    pub unresolved: usize,
    /// Needs manual attention or hit a transient error
    pub errors: usize,
}

pub struct SettlementEngine {
    store: Arc<dyn SettlementStore>,
    rpc: Arc<dyn ZcashRpc>,
    oracle: Arc<dyn PriceOracle>,
    poller: OperationPoller,
    locks: RecordLocks,
    polls: Semaphore,
    settings: EngineSettings,
    stop: StopToken,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        rpc: Arc<dyn ZcashRpc>,
        oracle: Arc<dyn PriceOracle>,
        settings: EngineSettings,
        poller_settings: PollerSettings,
        stop: StopToken,
    ) -> Self {
        Self {
            poller: OperationPoller::new(rpc.clone(), poller_settings),
            polls: Semaphore::new(settings.max_concurrent_polls.max(1)),
            locks: RecordLocks::new(),
            store,
            rpc,
            oracle,
            settings,
            stop,
        }
    }

    pub fn rpc(&self) -> &Arc<dyn ZcashRpc> {
        &self.rpc
    }

    pub fn poller(&self) -> &OperationPoller {
        &self.poller
    }

    /// Validate and persist a new intent. Withdrawals, and deposits that
    /// arrive with their source signature, are submitted immediately.
    ///
    /// Replaying an `external_id` returns `DuplicateIntent` with the stored
    /// record and never submits a second time. The one exception is a record
    /// whose submit stopped before its quote was written: no send can exist
    /// for it, so the replay picks the submit up again.
    pub async fn create_settlement(
        &self,
        intent: SettlementIntent,
    ) -> Result<SettlementRecord, SettlementError> {
        let amount = validate_intent(&intent)?;
        let source_chain_ref = intent
            .source_chain_ref
            .as_deref()
            .map(|r| r.trim().to_string());

        let _guard = self.locks.lock(&intent.external_id).await;

        if let Some(existing) = self.load(&intent.external_id).await? {
            if awaiting_submit(&existing) {
                info!(
                    external_id = %intent.external_id,
                    "Replayed intent never reached the node, retrying submit"
                );
                return self.submit_locked(&intent.external_id).await;
            }
            metrics::record_duplicate();
            info!(
                external_id = %intent.external_id,
                status = %existing.status,
                "Duplicate settlement intent"
            );
            return Err(SettlementError::DuplicateIntent(Box::new(existing)));
        }

        if let Some(reference) = &source_chain_ref {
            self.ensure_ref_unowned(reference).await?;
        }

        let verdict = self
            .rpc
            .validate_address(&intent.counterparty_address)
            .await?;
        if !verdict.isvalid {
            return Err(SettlementError::InvalidAddress(
                "address rejected by the zcash node".to_string(),
            ));
        }

        let submit_now =
            intent.kind == SettlementKind::Withdrawal || source_chain_ref.is_some();
        if submit_now {
            // Fail before anything is written if the send could not be priced
            self.quote(intent.asset, &amount)?;
        }

        let new = NewSettlement {
            id: Uuid::new_v4(),
            external_id: intent.external_id.clone(),
            kind: intent.kind,
            asset: intent.asset,
            amount: fixed(&amount, AMOUNT_SCALE)?,
            caller_identity: intent.caller_identity.clone(),
            counterparty_address: intent.counterparty_address.clone(),
            source_chain_ref,
        };

        let record = match self
            .store
            .insert(&new)
            .await
            .map_err(SettlementError::persistence)?
        {
            Some(record) => record,
            None => {
                // Lost a race with another process on the unique key
                metrics::record_duplicate();
                let existing = self.require(&intent.external_id).await?;
                return Err(SettlementError::DuplicateIntent(Box::new(existing)));
            }
        };

        metrics::record_created(record.kind.as_str(), record.asset.as_str());
        info!(
            external_id = %record.external_id,
            id = %record.id,
            kind = %record.kind,
            asset = %record.asset,
            amount = %record.amount,
            "Settlement created"
        );

        if submit_now {
            return self.submit_locked(&record.external_id).await;
        }
        Ok(record)
    }

    pub async fn get_status(&self, external_id: &str) -> Result<SettlementRecord, SettlementError> {
        self.require(external_id).await
    }

    pub async fn get_by_source_chain_ref(
        &self,
        source_chain_ref: &str,
    ) -> Result<SettlementRecord, SettlementError> {
        self.store
            .select_by_source_chain_ref(source_chain_ref)
            .await
            .map_err(SettlementError::persistence)?
            .ok_or_else(|| SettlementError::NotFound(source_chain_ref.to_string()))
    }

    /// Record the source-chain transaction for a settlement. For a pending
    /// deposit this is the funding signal and triggers the submit.
    ///
    /// Re-attaching the same reference is an acknowledgement; on a deposit
    /// still `pending` (e.g. the rate was unavailable) it retries the submit,
    /// unless an earlier attempt got as far as recording its quote.
    pub async fn attach_source_chain_ref(
        &self,
        external_id: &str,
        reference: &str,
    ) -> Result<SettlementRecord, SettlementError> {
        let reference = reference.trim();
        if reference.is_empty() || reference.len() > MAX_ID_LEN {
            return Err(SettlementError::Validation(
                "source chain reference must be 1-128 characters".to_string(),
            ));
        }

        let _guard = self.locks.lock(external_id).await;
        let record = self.require(external_id).await?;

        let record = match record.source_chain_ref.as_deref() {
            Some(existing) if existing == reference => record,
            Some(_) => {
                return Err(SettlementError::InvalidTransition {
                    external_id: external_id.to_string(),
                    status: record.status,
                    attempted: "attach a different source chain reference".to_string(),
                })
            }
            None => {
                if record.status.is_terminal() {
                    return Err(SettlementError::InvalidTransition {
                        external_id: external_id.to_string(),
                        status: record.status,
                        attempted: "attach source chain reference".to_string(),
                    });
                }
                self.ensure_ref_unowned(reference).await?;

                let updated = self
                    .store
                    .update_fields(
                        external_id,
                        record.status,
                        &RecordUpdate::source_chain_ref(reference.to_string()),
                    )
                    .await
                    .map_err(SettlementError::persistence)?
                    .ok_or_else(|| SettlementError::InvalidTransition {
                        external_id: external_id.to_string(),
                        status: record.status,
                        attempted: "attach source chain reference".to_string(),
                    })?;
                info!(external_id, reference, "Source chain reference attached");
                updated
            }
        };

        if record.kind == SettlementKind::Deposit && record.status == Status::Pending {
            return self.submit_locked(external_id).await;
        }
        Ok(record)
    }

    async fn ensure_ref_unowned(&self, reference: &str) -> Result<(), SettlementError> {
        match self
            .store
            .select_by_source_chain_ref(reference)
            .await
            .map_err(SettlementError::persistence)?
        {
            Some(owner) => Err(SettlementError::Validation(format!(
                "source chain reference already attached to settlement {}",
                owner.external_id
            ))),
            None => Ok(()),
        }
    }

    /// `pending -> submitted | failed`. Caller holds the record lock.
    ///
    /// The quoted target amount is persisted before `z_sendmany`. A pending
    /// record that already carries one may have moved funds whose operation id
    /// was never recorded, so it is refused here and left for an operator.
    async fn submit_locked(&self, external_id: &str) -> Result<SettlementRecord, SettlementError> {
        let record = self.require(external_id).await?;
        if !record.status.can_transition_to(Status::Submitted) {
            return Err(SettlementError::DuplicateIntent(Box::new(record)));
        }
        if record.target_amount.is_some() {
            error!(
                external_id,
                target_amount = ?record.target_amount,
                "Earlier submit may have reached the node without a recorded operation; refusing to resubmit"
            );
            return Err(SettlementError::InvalidTransition {
                external_id: external_id.to_string(),
                status: record.status,
                attempted: "resubmit after an unrecorded send".to_string(),
            });
        }

        let amount = conversion::parse_amount(&record.amount, AMOUNT_SCALE)
            .map_err(|e| SettlementError::Validation(e.to_string()))?;
        let target = self.quote(record.asset, &amount)?;
        let target_amount = fixed(&target, ZEC_DECIMALS)?;

        self.store
            .update_fields(
                external_id,
                Status::Pending,
                &RecordUpdate::quoted(target_amount.clone()),
            )
            .await
            .map_err(SettlementError::persistence)?
            .ok_or_else(|| SettlementError::InvalidTransition {
                external_id: external_id.to_string(),
                status: record.status,
                attempted: "record quote before submit".to_string(),
            })?;

        let recipients = [SendRecipient {
            address: record.counterparty_address.clone(),
            amount: target_amount.clone(),
            memo: None,
        }];

        debug!(
            external_id,
            amount = %record.amount,
            target_amount = %target_amount,
            "Submitting z_sendmany"
        );

        let submitted = self
            .rpc
            .submit_send(
                &self.settings.from_address,
                &recipients,
                self.settings.min_confirmations,
                &self.settings.fee,
            )
            .await;

        match submitted {
            Ok(operation_id) => {
                metrics::record_submit(true);
                let update = RecordUpdate::submitted(operation_id.clone(), target_amount);
                match self
                    .store
                    .update_fields(external_id, Status::Pending, &update)
                    .await
                {
                    Ok(Some(updated)) => {
                        metrics::record_transition(Status::Submitted);
                        info!(
                            external_id,
                            operation_id = %operation_id,
                            "Settlement submitted"
                        );
                        Ok(updated)
                    }
                    Ok(None) => {
                        metrics::record_critical_persistence_failure();
                        error!(
                            external_id,
                            operation_id = %operation_id,
                            "CRITICAL: funds moved without record; settlement left pending state during submit"
                        );
                        Err(SettlementError::Persistence(format!(
                            "settlement {} changed while operation {} was submitted",
                            external_id, operation_id
                        )))
                    }
                    Err(e) => {
                        metrics::record_critical_persistence_failure();
                        error!(
                            external_id,
                            operation_id = %operation_id,
                            error = %e,
                            "CRITICAL: funds moved without record; failed to persist submitted state"
                        );
                        Err(SettlementError::persistence(e))
                    }
                }
            }
            Err(e) => {
                metrics::record_submit(false);
                warn!(external_id, error = %e, "z_sendmany failed, marking settlement failed");
                let updated = self
                    .store
                    .update_fields(
                        external_id,
                        Status::Pending,
                        &RecordUpdate::failed(e.to_string()),
                    )
                    .await
                    .map_err(SettlementError::persistence)?
                    .ok_or_else(|| {
                        SettlementError::Persistence(format!(
                            "settlement {} changed while its submit failed",
                            external_id
                        ))
                    })?;
                metrics::record_transition(Status::Failed);
                Ok(updated)
            }
        }
    }

    /// Wait for a submitted record's operation and commit the result.
    /// Records in any other status are returned unchanged.
    pub async fn drive(&self, external_id: &str) -> Result<SettlementRecord, SettlementError> {
        let record = self.require(external_id).await?;
        if record.status != Status::Submitted {
            return Ok(record);
        }
        let operation_id = record.operation_id.clone().ok_or_else(|| {
            SettlementError::Persistence(format!(
                "submitted settlement {} has no operation id",
                external_id
            ))
        })?;

        let outcome = {
            // Acquire only fails on a closed semaphore; this one is never closed
            let _permit = self.polls.acquire().await.ok();
            self.poller.resolve(&operation_id, &self.stop).await
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // The node forgets an operation once its result is released, so
                // a concurrent driver that committed first looks like a failed poll.
                let current = self.require(external_id).await?;
                if current.status.is_terminal() {
                    return Ok(current);
                }
                match &e {
                    SettlementError::ProtocolViolation { .. }
                    | SettlementError::OperationNotFound(_) => error!(
                        external_id,
                        operation_id = %operation_id,
                        error = %e,
                        "Operation needs manual intervention; settlement left submitted"
                    ),
                    _ => warn!(
                        external_id,
                        operation_id = %operation_id,
                        error = %e,
                        "Failed to poll operation"
                    ),
                }
                return Err(e);
            }
        };

        match self.apply_outcome(external_id, &operation_id, &outcome).await {
            Err(SettlementError::InvalidTransition { .. }) => {
                // Another driver committed the same operation first
                let current = self.require(external_id).await?;
                if current.status.is_terminal() {
                    Ok(current)
                } else {
                    Err(SettlementError::InvalidTransition {
                        external_id: external_id.to_string(),
                        status: current.status,
                        attempted: format!("apply {} outcome", outcome.label()),
                    })
                }
            }
            other => other,
        }
    }

    /// Commit a poll outcome for `operation_id`. `TimedOut` is a no-op.
    pub async fn apply_outcome(
        &self,
        external_id: &str,
        operation_id: &str,
        outcome: &Outcome,
    ) -> Result<SettlementRecord, SettlementError> {
        let (update, target) = match outcome {
            Outcome::TimedOut => {
                debug!(external_id, operation_id, "Operation still running");
                return self.require(external_id).await;
            }
            Outcome::Success { txid } => (RecordUpdate::sent(txid.clone()), Status::Sent),
            Outcome::Failed { reason } | Outcome::Cancelled { reason } => {
                (RecordUpdate::failed(reason.clone()), Status::Failed)
            }
        };

        let guard = self.locks.lock(external_id).await;
        let record = self.require(external_id).await?;
        if !record.status.can_transition_to(target)
            || record.operation_id.as_deref() != Some(operation_id)
        {
            return Err(SettlementError::InvalidTransition {
                external_id: external_id.to_string(),
                status: record.status,
                attempted: format!("apply {} outcome of {}", outcome.label(), operation_id),
            });
        }

        let updated = match self
            .store
            .update_fields(external_id, Status::Submitted, &update)
            .await
        {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                return Err(SettlementError::InvalidTransition {
                    external_id: external_id.to_string(),
                    status: record.status,
                    attempted: format!("apply {} outcome of {}", outcome.label(), operation_id),
                })
            }
            Err(e) => {
                metrics::record_critical_persistence_failure();
                error!(
                    external_id,
                    operation_id,
                    outcome = outcome.label(),
                    error = %e,
                    "CRITICAL: funds moved without record; failed to persist terminal state"
                );
                return Err(SettlementError::persistence(e));
            }
        };
        drop(guard);

        metrics::record_transition(target);
        match outcome {
            Outcome::Success { txid } => {
                info!(external_id, operation_id, txid = %txid, "Settlement sent")
            }
            _ => warn!(
                external_id,
                operation_id,
                reason = ?updated.failure_reason,
                "Settlement failed"
            ),
        }

        self.poller.release(operation_id).await;
        Ok(updated)
    }

    /// Re-poll every `submitted` record by its stored operation id. Run once
    /// before accepting work and then periodically.
    pub async fn reconcile(&self) -> Result<ReconcileReport, SettlementError> {
        let submitted = self
            .store
            .select_by_status(Status::Submitted)
            .await
            .map_err(SettlementError::persistence)?;

        let mut report = ReconcileReport {
            examined: submitted.len(),
            ..Default::default()
        };
        if !submitted.is_empty() {
            info!(count = submitted.len(), "Reconciling submitted settlements");
        }

        let results = join_all(submitted.iter().map(|r| self.drive(&r.external_id))).await;
        for result in results {
            match result {
                Ok(r) if r.status == Status::Sent => report.sent += 1,
                Ok(r) if r.status == Status::Failed => report.failed += 1,
                Ok(_) => report.unresolved += 1,
                Err(_) => report.errors += 1,
            }
        }

        self.refresh_counts().await;
        metrics::record_reconcile();
        Ok(report)
    }

    /// Reconcile every `reconcile_interval` until stopped. The first pass
    /// runs one interval after start; callers do the startup pass themselves.
    pub async fn run_reconciler(self: Arc<Self>) {
        info!(
            interval_ms = self.settings.reconcile_interval.as_millis() as u64,
            "Reconciler started"
        );
        while self.stop.sleep(self.settings.reconcile_interval).await {
            match self.reconcile().await {
                Ok(report) if report.examined > 0 => {
                    info!(?report, "Reconciliation pass complete")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Reconciliation pass failed"),
            }
        }
        info!("Reconciler stopped");
    }

    /// Drive a record in the background, e.g. right after it was submitted
    pub fn spawn_drive(self: &Arc<Self>, external_id: String) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.drive(&external_id).await {
                debug!(external_id = %external_id, error = %e, "Background drive ended with error");
            }
        });
    }

    pub async fn status_counts(&self) -> Result<Vec<(Status, i64)>, SettlementError> {
        self.store
            .count_by_status()
            .await
            .map_err(SettlementError::persistence)
    }

    async fn refresh_counts(&self) {
        match self.status_counts().await {
            Ok(counts) => {
                for status in Status::ALL {
                    let n = counts
                        .iter()
                        .find(|(s, _)| *s == status)
                        .map_or(0, |(_, n)| *n);
                    metrics::set_record_count(status, n);
                }
            }
            Err(e) => warn!(error = %e, "Failed to refresh record counts"),
        }
    }

    /// ZEC to send for `amount` of `asset`, truncated to zatoshi
    fn quote(&self, asset: Asset, amount: &BigDecimal) -> Result<BigDecimal, SettlementError> {
        let rate = self.oracle.current_rate(asset)?;
        let target = conversion::to_zec(amount, &rate);
        if !conversion::is_positive(&target) {
            return Err(SettlementError::Validation(format!(
                "{} {} converts to less than one zatoshi",
                amount, asset
            )));
        }
        Ok(target)
    }

    async fn load(&self, external_id: &str) -> Result<Option<SettlementRecord>, SettlementError> {
        self.store
            .select_by_external_id(external_id)
            .await
            .map_err(SettlementError::persistence)
    }

    async fn require(&self, external_id: &str) -> Result<SettlementRecord, SettlementError> {
        self.load(external_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(external_id.to_string()))
    }
}

/// Pending, never quoted, and due for a send: nothing can exist on the node
/// for it yet.
fn awaiting_submit(record: &SettlementRecord) -> bool {
    record.status == Status::Pending
        && record.target_amount.is_none()
        && (record.kind == SettlementKind::Withdrawal || record.source_chain_ref.is_some())
}

fn fixed(amount: &BigDecimal, decimals: u32) -> Result<String, SettlementError> {
    conversion::format_fixed(amount, decimals).map_err(|e| SettlementError::Validation(e.to_string()))
}

/// Shape checks that need no I/O. Returns the parsed amount.
fn validate_intent(intent: &SettlementIntent) -> Result<BigDecimal, SettlementError> {
    if intent.external_id.trim().is_empty() || intent.external_id.len() > MAX_ID_LEN {
        return Err(SettlementError::Validation(
            "external id must be 1-128 characters".to_string(),
        ));
    }
    if intent.caller_identity.trim().is_empty() || intent.caller_identity.len() > MAX_ID_LEN {
        return Err(SettlementError::Validation(
            "caller identity must be 1-128 characters".to_string(),
        ));
    }
    if let Some(reference) = &intent.source_chain_ref {
        let reference = reference.trim();
        if reference.is_empty() || reference.len() > MAX_ID_LEN {
            return Err(SettlementError::Validation(
                "source chain reference must be 1-128 characters".to_string(),
            ));
        }
    }

    let amount = conversion::parse_amount(&intent.amount, AMOUNT_SCALE)
        .map_err(|e| SettlementError::Validation(e.to_string()))?;
    if !conversion::is_positive(&amount) {
        return Err(SettlementError::Validation(
            "amount must be greater than zero".to_string(),
        ));
    }
    // NUMERIC(18, 9) leaves nine integer digits
    if amount >= BigDecimal::from(MAX_AMOUNT) {
        return Err(SettlementError::Validation(format!(
            "amount must be below {}",
            MAX_AMOUNT
        )));
    }
    // Must be representable in the asset's minimal unit
    conversion::to_minimal_unit(&amount, intent.asset.decimals()).map_err(|e| match e {
        ConversionError::TooPrecise { .. } => SettlementError::Validation(format!(
            "{} supports at most {} decimals",
            intent.asset,
            intent.asset.decimals()
        )),
        other => SettlementError::Validation(other.to_string()),
    })?;

    let check = address::validate(&intent.counterparty_address);
    if !check.valid {
        let reason = match check.kind {
            AddressKind::Transparent => "transparent addresses are not accepted",
            _ => "expected a shielded address starting with 'z' or 'u1'",
        };
        return Err(SettlementError::InvalidAddress(reason.to_string()));
    }

    Ok(amount)
}
