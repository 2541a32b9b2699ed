//! Error taxonomy for the settlement core
//!
//! `GatewayError` covers a single round trip to zcashd. `SettlementError` is
//! what the state machine and request layer see. A poll that runs out of time
//! is not an error; see [`crate::poller::Outcome::TimedOut`].

use thiserror::Error;

use crate::db::SettlementRecord;
use crate::types::Status;

/// Failure of one JSON-RPC call to the shielded-chain node
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The node answered with a non-null `error` object
    #[error("zcash RPC error in {method}: {message} (code: {code})")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    /// Timeout, refused connection, or a body that is not a JSON-RPC response
    #[error("zcash transport error in {method}: {message}")]
    Transport { method: String, message: String },
}

impl GatewayError {
    pub fn method(&self) -> &str {
        match self {
            GatewayError::Rpc { method, .. } | GatewayError::Transport { method, .. } => method,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Rpc { .. } => "rpc",
            GatewayError::Transport { .. } => "transport",
        }
    }
}

#[derive(Debug, Error)]
pub enum SettlementError {
    /// Malformed input, rejected before any state mutation
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid shielded address: {0}")]
    InvalidAddress(String),

    /// Idempotency guard tripped; carries the record that already exists
    #[error("settlement {} already exists with status {}", .0.external_id, .0.status)]
    DuplicateIntent(Box<SettlementRecord>),

    #[error("settlement {0} not found")]
    NotFound(String),

    #[error("invalid transition for settlement {external_id} in status {status}: {attempted}")]
    InvalidTransition {
        external_id: String,
        status: Status,
        attempted: String,
    },

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("operation {0} not found on the node")]
    OperationNotFound(String),

    /// The node broke its documented contract; needs manual intervention
    #[error("protocol violation for operation {operation_id}: {detail}")]
    ProtocolViolation {
        operation_id: String,
        detail: String,
    },

    #[error("exchange rate unavailable for {0}")]
    RateUnavailable(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl SettlementError {
    pub(crate) fn persistence(err: eyre::Report) -> Self {
        SettlementError::Persistence(format!("{:#}", err))
    }

    /// Short label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            SettlementError::Validation(_) => "validation",
            SettlementError::InvalidAddress(_) => "invalid_address",
            SettlementError::DuplicateIntent(_) => "duplicate_intent",
            SettlementError::NotFound(_) => "not_found",
            SettlementError::InvalidTransition { .. } => "invalid_transition",
            SettlementError::Gateway(e) => e.kind(),
            SettlementError::OperationNotFound(_) => "operation_not_found",
            SettlementError::ProtocolViolation { .. } => "protocol_violation",
            SettlementError::RateUnavailable(_) => "rate_unavailable",
            SettlementError::Persistence(_) => "persistence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::Rpc {
            method: "z_sendmany".to_string(),
            code: -6,
            message: "Insufficient funds".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "zcash RPC error in z_sendmany: Insufficient funds (code: -6)"
        );
        assert_eq!(err.kind(), "rpc");
        assert_eq!(err.method(), "z_sendmany");
    }

    #[test]
    fn test_gateway_error_converts_into_settlement_error() {
        let err: SettlementError = GatewayError::Transport {
            method: "z_getoperationstatus".to_string(),
            message: "connection refused".to_string(),
        }
        .into();
        assert_eq!(err.label(), "transport");
    }

    #[test]
    fn test_persistence_keeps_context_chain() {
        let report = eyre::eyre!("connection reset").wrap_err("Failed to update settlement");
        let err = SettlementError::persistence(report);
        let msg = err.to_string();
        assert!(msg.contains("Failed to update settlement"), "{}", msg);
        assert!(msg.contains("connection reset"), "{}", msg);
    }
}
