//! Operation poller
//!
//! `z_sendmany` returns before the transaction exists; the node works through
//! it asynchronously and reports progress under an operation id. The poller
//! turns that progress into a single [`Outcome`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bounded_cache::BoundedCache;
use crate::error::SettlementError;
use crate::metrics;
use crate::retry::{with_retry, RetryConfig};
use crate::shutdown::StopToken;
use crate::zcash::{OperationState, OperationStatus, ZcashRpc};

const FALLBACK_FAILED: &str = "Operation failed";
const FALLBACK_CANCELLED: &str = "Operation cancelled";

/// How an await on an operation ended. `TimedOut` is not a failure: the
/// operation may still complete and is picked up again by reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success { txid: String },
    Failed { reason: String },
    Cancelled { reason: String },
    TimedOut,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::TimedOut)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Failed { .. } => "failed",
            Outcome::Cancelled { .. } => "cancelled",
            Outcome::TimedOut => "timed_out",
        }
    }
}

/// Map one status entry to an outcome; `None` means still in progress.
pub fn classify_status(status: &OperationStatus) -> Result<Option<Outcome>, SettlementError> {
    match status.status {
        OperationState::Queued | OperationState::Executing => Ok(None),
        OperationState::Unknown => {
            warn!(operation_id = %status.id, "Unrecognized operation state, still polling");
            Ok(None)
        }
        OperationState::Success => match status.txid() {
            Some(txid) => Ok(Some(Outcome::Success {
                txid: txid.to_string(),
            })),
            None => Err(SettlementError::ProtocolViolation {
                operation_id: status.id.clone(),
                detail: "operation reported success without a txid".to_string(),
            }),
        },
        OperationState::Failed => Ok(Some(Outcome::Failed {
            reason: status
                .error_message()
                .unwrap_or(FALLBACK_FAILED)
                .to_string(),
        })),
        OperationState::Cancelled => Ok(Some(Outcome::Cancelled {
            reason: status
                .error_message()
                .unwrap_or(FALLBACK_CANCELLED)
                .to_string(),
        })),
    }
}

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// How long an operation id may be absent from the node before giving up
    pub not_found_grace: Duration,
    pub retry: RetryConfig,
    pub outcome_cache_size: usize,
    pub outcome_cache_ttl: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_wait: Duration::from_secs(300),
            not_found_grace: Duration::from_secs(30),
            retry: RetryConfig::default(),
            outcome_cache_size: 10_000,
            outcome_cache_ttl: Duration::from_secs(86_400),
        }
    }
}

pub struct OperationPoller {
    rpc: Arc<dyn ZcashRpc>,
    settings: PollerSettings,
    /// Terminal outcomes by operation id
    outcomes: Mutex<BoundedCache<String, Outcome>>,
}

impl OperationPoller {
    pub fn new(rpc: Arc<dyn ZcashRpc>, settings: PollerSettings) -> Self {
        let outcomes = BoundedCache::new(settings.outcome_cache_size, settings.outcome_cache_ttl);
        Self {
            rpc,
            settings,
            outcomes: Mutex::new(outcomes),
        }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    /// Poll `operation_id` until it reaches a terminal state, `max_wait`
    /// elapses or `stop` fires. The last two both yield `TimedOut`.
    pub async fn await_outcome(
        &self,
        operation_id: &str,
        max_wait: Duration,
        poll_interval: Duration,
        stop: &StopToken,
    ) -> Result<Outcome, SettlementError> {
        let _in_flight = metrics::InFlightPoll::start();
        let started = Instant::now();

        let result = self
            .poll_until_settled(operation_id, started, max_wait, poll_interval, stop)
            .await;

        let elapsed = started.elapsed().as_secs_f64();
        match &result {
            Ok(outcome) => {
                metrics::record_poll_outcome(outcome.label(), elapsed);
                debug!(operation_id, outcome = outcome.label(), elapsed, "Poll finished");
            }
            Err(e) => {
                metrics::record_poll_outcome(e.label(), elapsed);
            }
        }
        result
    }

    async fn poll_until_settled(
        &self,
        operation_id: &str,
        started: Instant,
        max_wait: Duration,
        poll_interval: Duration,
        stop: &StopToken,
    ) -> Result<Outcome, SettlementError> {
        let deadline = tokio::time::Instant::from_std(started + max_wait);
        let ids = [operation_id.to_string()];
        let ids: &[String] = &ids;
        let rpc = &self.rpc;
        let mut missing_since: Option<Instant> = None;

        loop {
            if stop.is_stopped() {
                return Ok(Outcome::TimedOut);
            }

            let query = with_retry(&self.settings.retry, stop, move |_| {
                rpc.query_operation_status(Some(ids))
            });
            let statuses = match tokio::time::timeout_at(deadline, query).await {
                Err(_) => return Ok(Outcome::TimedOut),
                Ok(Err(_)) if stop.is_stopped() => return Ok(Outcome::TimedOut),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(statuses)) => statuses,
            };

            match statuses.iter().find(|s| s.id == operation_id) {
                Some(status) => {
                    missing_since = None;
                    if let Some(outcome) = classify_status(status)? {
                        return Ok(outcome);
                    }
                }
                None => {
                    let since = *missing_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.settings.not_found_grace {
                        return Err(SettlementError::OperationNotFound(
                            operation_id.to_string(),
                        ));
                    }
                    debug!(operation_id, "Operation not listed by node yet");
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Outcome::TimedOut);
            }
            if !stop.sleep(poll_interval.min(deadline - now)).await {
                return Ok(Outcome::TimedOut);
            }
        }
    }

    /// Idempotent await using the configured budget. Terminal outcomes are
    /// memoized, so repeated calls for a settled operation never hit the node.
    pub async fn resolve(
        &self,
        operation_id: &str,
        stop: &StopToken,
    ) -> Result<Outcome, SettlementError> {
        if let Some(outcome) = self.cached(operation_id) {
            debug!(operation_id, "Outcome served from cache");
            return Ok(outcome);
        }

        let outcome = self
            .await_outcome(
                operation_id,
                self.settings.max_wait,
                self.settings.poll_interval,
                stop,
            )
            .await?;

        if outcome.is_terminal() {
            self.lock_outcomes()
                .insert(operation_id.to_string(), outcome.clone());
        }
        Ok(outcome)
    }

    /// Drop the node's copy of a finished operation (`z_getoperationresult`).
    /// Call only after the terminal transition is persisted; the node forgets
    /// the result once it has been handed out.
    pub async fn release(&self, operation_id: &str) {
        let ids = [operation_id.to_string()];
        match self.rpc.consume_operation_result(Some(&ids)).await {
            Ok(results) => {
                info!(operation_id, returned = results.len(), "Released operation result");
            }
            Err(e) => {
                warn!(operation_id, error = %e, "Failed to release operation result");
            }
        }
    }

    fn cached(&self, operation_id: &str) -> Option<Outcome> {
        self.lock_outcomes().get(&operation_id.to_string())
    }

    fn lock_outcomes(&self) -> std::sync::MutexGuard<'_, BoundedCache<String, Outcome>> {
        self.outcomes.lock().unwrap_or_else(|poisoned| {
            error!("Outcome cache mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }
}
