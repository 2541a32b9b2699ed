//! Prometheus metrics for the settlement operator
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec,
    register_int_gauge_vec, Counter, CounterVec, Gauge, HistogramVec, IntGaugeVec,
};

use crate::types::Status;

lazy_static! {
    // Intake
    pub static ref SETTLEMENTS_CREATED: CounterVec = register_counter_vec!(
        "zwap_settlements_created_total",
        "Total number of settlement records created",
        &["kind", "asset"]
    ).unwrap();

    pub static ref DUPLICATE_INTENTS: Counter = register_counter!(
        "zwap_duplicate_intents_total",
        "Create requests rejected by the idempotency guard"
    ).unwrap();

    // Lifecycle
    pub static ref TRANSITIONS: CounterVec = register_counter_vec!(
        "zwap_transitions_total",
        "Status transitions committed, by target status",
        &["to"]
    ).unwrap();

    pub static ref SUBMITS: CounterVec = register_counter_vec!(
        "zwap_submits_total",
        "z_sendmany submissions",
        &["result"]
    ).unwrap();

    // Polling
    pub static ref POLL_OUTCOMES: CounterVec = register_counter_vec!(
        "zwap_poll_outcomes_total",
        "Results of awaiting an operation",
        &["outcome"]
    ).unwrap();

    pub static ref POLL_LATENCY: HistogramVec = register_histogram_vec!(
        "zwap_poll_latency_seconds",
        "Time from the first status query to the outcome",
        &["outcome"],
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    pub static ref POLLS_IN_FLIGHT: Gauge = register_gauge!(
        "zwap_polls_in_flight",
        "Operations currently being polled"
    ).unwrap();

    // Errors
    pub static ref RPC_ERRORS: CounterVec = register_counter_vec!(
        "zwap_rpc_errors_total",
        "Failed zcashd RPC calls",
        &["method", "kind"]
    ).unwrap();

    pub static ref CRITICAL_PERSISTENCE_FAILURES: Counter = register_counter!(
        "zwap_critical_persistence_failures_total",
        "Transitions that could not be persisted after funds may have moved"
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "zwap_up",
        "Whether the operator is up and running"
    ).unwrap();

    pub static ref RECORDS_BY_STATUS: IntGaugeVec = register_int_gauge_vec!(
        "zwap_records",
        "Settlement records by status, refreshed on each reconciliation pass",
        &["status"]
    ).unwrap();

    pub static ref LAST_RECONCILE: Gauge = register_gauge!(
        "zwap_last_reconcile_timestamp",
        "Unix timestamp of the last completed reconciliation pass"
    ).unwrap();
}

pub fn record_created(kind: &str, asset: &str) {
    SETTLEMENTS_CREATED.with_label_values(&[kind, asset]).inc();
}

pub fn record_duplicate() {
    DUPLICATE_INTENTS.inc();
}

pub fn record_transition(to: Status) {
    TRANSITIONS.with_label_values(&[to.as_str()]).inc();
}

pub fn record_submit(success: bool) {
    let result = if success { "success" } else { "failure" };
    SUBMITS.with_label_values(&[result]).inc();
}

/// Record how an await ended and how long it took
pub fn record_poll_outcome(outcome: &str, seconds: f64) {
    POLL_OUTCOMES.with_label_values(&[outcome]).inc();
    POLL_LATENCY.with_label_values(&[outcome]).observe(seconds);
}

pub fn record_rpc_error(method: &str, kind: &str) {
    RPC_ERRORS.with_label_values(&[method, kind]).inc();
}

pub fn record_critical_persistence_failure() {
    CRITICAL_PERSISTENCE_FAILURES.inc();
}

/// RAII guard that keeps `POLLS_IN_FLIGHT` accurate across early returns
pub struct InFlightPoll;

impl InFlightPoll {
    pub fn start() -> Self {
        POLLS_IN_FLIGHT.inc();
        InFlightPoll
    }
}

impl Drop for InFlightPoll {
    fn drop(&mut self) {
        POLLS_IN_FLIGHT.dec();
    }
}

pub fn set_record_count(status: Status, count: i64) {
    RECORDS_BY_STATUS
        .with_label_values(&[status.as_str()])
        .set(count);
}

/// Record completion of a reconciliation pass
pub fn record_reconcile() {
    LAST_RECONCILE.set(chrono::Utc::now().timestamp() as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_gathered() {
        record_rpc_error("z_sendmany", "transport");
        let names: Vec<String> = prometheus::gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "zwap_rpc_errors_total"));
    }
}
