//! Scripted in-process zcashd for tests and local dry runs

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::address;
use crate::db::SettlementStore;
use crate::error::GatewayError;
use crate::oracle::PriceOracle;
use crate::poller::PollerSettings;
use crate::retry::RetryConfig;
use crate::settlement::{EngineSettings, SettlementEngine};
use crate::shutdown::StopToken;
use crate::zcash::types::{OperationError, OperationResult};
use crate::zcash::{
    AddressValidation, BlockchainInfo, OperationState, OperationStatus, SendRecipient,
    TotalBalance, ZcashRpc,
};

/// Funding address used by [`engine_with`]
pub const TEST_FROM_ADDRESS: &str =
    "zs1fromfromfromfromfromfromfromfromfromfromfromfromfromfromfromfromfromfromfrom";

/// Millisecond-scale polling so tests finish quickly
pub fn fast_poller_settings() -> PollerSettings {
    PollerSettings {
        poll_interval: Duration::from_millis(5),
        max_wait: Duration::from_millis(150),
        not_found_grace: Duration::from_millis(30),
        retry: RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        },
        outcome_cache_size: 64,
        outcome_cache_ttl: Duration::from_secs(60),
    }
}

/// Engine wired to the given node, store and oracle with fast polling
pub fn engine_with(
    node: Arc<MockZcashNode>,
    store: Arc<dyn SettlementStore>,
    oracle: Arc<dyn PriceOracle>,
    stop: StopToken,
) -> Arc<SettlementEngine> {
    Arc::new(SettlementEngine::new(
        store,
        node,
        oracle,
        EngineSettings {
            from_address: TEST_FROM_ADDRESS.to_string(),
            min_confirmations: 1,
            fee: "0.0001".to_string(),
            max_concurrent_polls: 4,
            reconcile_interval: Duration::from_millis(10),
        },
        fast_poller_settings(),
        stop,
    ))
}

/// One scripted answer for an operation's status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStatus {
    Queued,
    Executing,
    Success(Option<String>),
    Failed(Option<String>),
    Cancelled(Option<String>),
    /// Operation absent from the node's answer
    Missing,
    /// The whole status query fails with a transport error
    Error,
}

/// Arguments of a recorded `z_sendmany`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCall {
    pub from: String,
    pub recipients: Vec<SendRecipient>,
    pub min_confirmations: u32,
    pub fee: String,
}

#[derive(Default)]
struct NodeState {
    submit_script: VecDeque<Result<String, GatewayError>>,
    next_op: u64,
    /// Per-operation answers; the last one repeats
    statuses: HashMap<String, VecDeque<MockStatus>>,
    submits: Vec<SubmitCall>,
    status_calls: usize,
    consumed: Vec<String>,
    unreachable: bool,
    query_delay: Option<Duration>,
}

/// `ZcashRpc` implementation driven by scripts.
///
/// Unscripted submits succeed with `opid-1`, `opid-2`, ...; operations with
/// no status script are reported missing.
#[derive(Default)]
pub struct MockZcashNode {
    state: Mutex<NodeState>,
    queries_in_flight: AtomicUsize,
    peak_queries: AtomicUsize,
}

/// Counts one `z_getoperationstatus` call for as long as it is alive
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(current)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockZcashNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue the result of the next `submit_send`
    pub fn script_submit(&self, result: Result<String, GatewayError>) {
        self.state().submit_script.push_back(result);
    }

    pub fn script_status(&self, operation_id: &str, answers: Vec<MockStatus>) {
        self.state()
            .statuses
            .insert(operation_id.to_string(), answers.into());
    }

    /// Make every call fail with a transport error
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Hold every status query open for `delay` before answering
    pub fn set_query_delay(&self, delay: Duration) {
        self.state().query_delay = Some(delay);
    }

    /// Most status queries ever open at the same time
    pub fn peak_concurrent_queries(&self) -> usize {
        self.peak_queries.load(Ordering::SeqCst)
    }

    pub fn submits(&self) -> Vec<SubmitCall> {
        self.state().submits.clone()
    }

    pub fn submit_calls(&self) -> usize {
        self.state().submits.len()
    }

    pub fn status_calls(&self) -> usize {
        self.state().status_calls
    }

    /// Operation ids passed to `z_getoperationresult`, in call order
    pub fn consumed(&self) -> Vec<String> {
        self.state().consumed.clone()
    }

    fn check_reachable(&self, method: &str) -> Result<(), GatewayError> {
        if self.state().unreachable {
            return Err(transport(method, "connection refused"));
        }
        Ok(())
    }
}

fn transport(method: &str, message: &str) -> GatewayError {
    GatewayError::Transport {
        method: method.to_string(),
        message: message.to_string(),
    }
}

fn next_answer(script: &mut VecDeque<MockStatus>) -> MockStatus {
    if script.len() > 1 {
        script.pop_front().unwrap_or(MockStatus::Missing)
    } else {
        script.front().cloned().unwrap_or(MockStatus::Missing)
    }
}

fn to_status(id: &str, answer: MockStatus) -> Option<OperationStatus> {
    let (status, result, error) = match answer {
        MockStatus::Queued => (OperationState::Queued, None, None),
        MockStatus::Executing => (OperationState::Executing, None, None),
        MockStatus::Success(txid) => (
            OperationState::Success,
            Some(OperationResult { txid }),
            None,
        ),
        MockStatus::Failed(message) => (
            OperationState::Failed,
            None,
            message.map(|message| OperationError { code: -6, message }),
        ),
        MockStatus::Cancelled(message) => (
            OperationState::Cancelled,
            None,
            message.map(|message| OperationError { code: -1, message }),
        ),
        MockStatus::Missing | MockStatus::Error => return None,
    };
    Some(OperationStatus {
        id: id.to_string(),
        status,
        creation_time: 0,
        result,
        error,
    })
}

#[async_trait]
impl ZcashRpc for MockZcashNode {
    async fn submit_send(
        &self,
        from: &str,
        recipients: &[SendRecipient],
        min_confirmations: u32,
        fee: &str,
    ) -> Result<String, GatewayError> {
        self.check_reachable("z_sendmany")?;
        let mut state = self.state();
        state.submits.push(SubmitCall {
            from: from.to_string(),
            recipients: recipients.to_vec(),
            min_confirmations,
            fee: fee.to_string(),
        });
        match state.submit_script.pop_front() {
            Some(result) => result,
            None => {
                state.next_op += 1;
                Ok(format!("opid-{}", state.next_op))
            }
        }
    }

    async fn query_operation_status(
        &self,
        operation_ids: Option<&[String]>,
    ) -> Result<Vec<OperationStatus>, GatewayError> {
        self.check_reachable("z_getoperationstatus")?;
        let _in_flight = InFlight::enter(&self.queries_in_flight, &self.peak_queries);
        let delay = self.state().query_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.status_calls += 1;

        let ids: Vec<String> = match operation_ids {
            Some(ids) => ids.to_vec(),
            None => state.statuses.keys().cloned().collect(),
        };

        let mut out = Vec::new();
        for id in ids {
            let answer = match state.statuses.get_mut(&id) {
                Some(script) => next_answer(script),
                None => MockStatus::Missing,
            };
            if answer == MockStatus::Error {
                return Err(transport("z_getoperationstatus", "connection reset by peer"));
            }
            out.extend(to_status(&id, answer));
        }
        Ok(out)
    }

    async fn consume_operation_result(
        &self,
        operation_ids: Option<&[String]>,
    ) -> Result<Vec<OperationStatus>, GatewayError> {
        self.check_reachable("z_getoperationresult")?;
        let mut state = self.state();

        let ids: Vec<String> = match operation_ids {
            Some(ids) => ids.to_vec(),
            None => state.statuses.keys().cloned().collect(),
        };

        let mut out = Vec::new();
        for id in ids {
            state.consumed.push(id.clone());
            if let Some(mut script) = state.statuses.remove(&id) {
                out.extend(to_status(&id, next_answer(&mut script)));
            }
        }
        Ok(out)
    }

    async fn validate_address(&self, address: &str) -> Result<AddressValidation, GatewayError> {
        self.check_reachable("z_validateaddress")?;
        let check = address::validate(address);
        Ok(AddressValidation {
            isvalid: check.valid,
            address: check.valid.then(|| address.to_string()),
            address_type: check.form.map(|f| format!("{:?}", f).to_lowercase()),
            ismine: Some(false),
        })
    }

    async fn get_balance(&self, _address: &str, _min_confirmations: u32) -> Result<f64, GatewayError> {
        self.check_reachable("z_getbalance")?;
        Ok(10.0)
    }

    async fn get_total_balance(&self, _min_confirmations: u32) -> Result<TotalBalance, GatewayError> {
        self.check_reachable("z_gettotalbalance")?;
        Ok(TotalBalance {
            transparent: "0.00".to_string(),
            private: "10.00".to_string(),
            total: "10.00".to_string(),
        })
    }

    async fn list_addresses(&self) -> Result<Vec<String>, GatewayError> {
        self.check_reachable("z_listaddresses")?;
        Ok(Vec::new())
    }

    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, GatewayError> {
        self.check_reachable("getblockchaininfo")?;
        Ok(BlockchainInfo {
            chain: "regtest".to_string(),
            blocks: 200,
            bestblockhash: String::new(),
            verificationprogress: 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_last_answer_repeats() {
        let node = MockZcashNode::new();
        node.script_status("opid-1", vec![MockStatus::Queued, MockStatus::Executing]);
        let ids = vec!["opid-1".to_string()];

        let states: Vec<OperationState> = {
            let mut v = Vec::new();
            for _ in 0..3 {
                v.push(node.query_operation_status(Some(&ids)).await.unwrap()[0].status);
            }
            v
        };
        assert_eq!(
            states,
            vec![
                OperationState::Queued,
                OperationState::Executing,
                OperationState::Executing
            ]
        );
        assert_eq!(node.status_calls(), 3);
    }

    #[tokio::test]
    async fn test_unscripted_submits_get_sequential_ids() {
        let node = MockZcashNode::new();
        assert_eq!(node.submit_send("zs1", &[], 1, "0.0001").await.unwrap(), "opid-1");
        assert_eq!(node.submit_send("zs1", &[], 1, "0.0001").await.unwrap(), "opid-2");
        assert_eq!(node.submit_calls(), 2);
    }

    #[tokio::test]
    async fn test_consumed_operation_disappears() {
        let node = MockZcashNode::new();
        node.script_status("opid-1", vec![MockStatus::Success(Some("abc".to_string()))]);
        let ids = vec!["opid-1".to_string()];

        let consumed = node.consume_operation_result(Some(&ids)).await.unwrap();
        assert_eq!(consumed[0].txid(), Some("abc"));
        assert!(node.query_operation_status(Some(&ids)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_queries_raise_peak() {
        let node = MockZcashNode::new();
        node.set_query_delay(Duration::from_millis(20));
        let ids = vec!["opid-1".to_string()];

        let (a, b) = tokio::join!(
            node.query_operation_status(Some(&ids)),
            node.query_operation_status(Some(&ids))
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(node.peak_concurrent_queries(), 2);

        node.query_operation_status(Some(&ids)).await.unwrap();
        assert_eq!(node.peak_concurrent_queries(), 2);
    }
}
