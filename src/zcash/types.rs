//! Wire types for zcashd's JSON-RPC responses

use serde::{Deserialize, Serialize};

/// JSON-RPC 1.0 response envelope
#[derive(Debug, Deserialize)]
pub(crate) struct RpcResponse<T> {
    pub result: Option<T>,
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// One output of a `z_sendmany` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendRecipient {
    pub address: String,
    /// ZEC amount as a plain decimal string; zcashd accepts strings for amounts
    pub amount: String,
    /// Hex-encoded memo (shielded recipients only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Node-side state of an asynchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Queued,
    Executing,
    Success,
    Failed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationResult {
    #[serde(default)]
    pub txid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    pub code: i64,
    pub message: String,
}

/// Entry of `z_getoperationstatus` / `z_getoperationresult`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub id: String,
    pub status: OperationState,
    #[serde(default)]
    pub creation_time: i64,
    #[serde(default)]
    pub result: Option<OperationResult>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

impl OperationStatus {
    pub fn txid(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|r| r.txid.as_deref())
            .filter(|t| !t.is_empty())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_ref()
            .map(|e| e.message.as_str())
            .filter(|m| !m.is_empty())
    }
}

/// `z_validateaddress` response
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressValidation {
    pub isvalid: bool,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, rename = "type")]
    pub address_type: Option<String>,
    #[serde(default)]
    pub ismine: Option<bool>,
}

/// `z_gettotalbalance` response; zcashd reports amounts as strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalBalance {
    pub transparent: String,
    pub private: String,
    pub total: String,
}

/// Subset of `getblockchaininfo` used for readiness checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(default)]
    pub bestblockhash: String,
    #[serde(default)]
    pub verificationprogress: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_status() {
        let raw = r#"{"id":"opid-1","status":"success","creation_time":1700000000,
                      "result":{"txid":"abc"},"execution_secs":12.5}"#;
        let status: OperationStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(status.status, OperationState::Success);
        assert_eq!(status.txid(), Some("abc"));
        assert_eq!(status.error_message(), None);
    }

    #[test]
    fn test_parse_failed_status_with_error() {
        let raw = r#"{"id":"opid-2","status":"failed","creation_time":1,
                      "error":{"code":-6,"message":"Insufficient funds"}}"#;
        let status: OperationStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(status.status, OperationState::Failed);
        assert_eq!(status.error_message(), Some("Insufficient funds"));
    }

    #[test]
    fn test_unknown_state_does_not_fail_parsing() {
        let raw = r#"{"id":"opid-3","status":"paused","creation_time":1}"#;
        let status: OperationStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(status.status, OperationState::Unknown);
    }

    #[test]
    fn test_empty_txid_is_treated_as_missing() {
        let raw = r#"{"id":"opid-4","status":"success","creation_time":1,"result":{"txid":""}}"#;
        let status: OperationStatus = serde_json::from_str(raw).unwrap();
        assert_eq!(status.txid(), None);
    }

    #[test]
    fn test_send_recipient_omits_empty_memo() {
        let recipient = SendRecipient {
            address: "zs1abc".to_string(),
            amount: "0.50000000".to_string(),
            memo: None,
        };
        let json = serde_json::to_value(&recipient).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"address": "zs1abc", "amount": "0.50000000"})
        );
    }

    #[test]
    fn test_rpc_envelope_with_error() {
        let raw = r#"{"result":null,"error":{"code":-8,"message":"Invalid parameter"},"id":7}"#;
        let resp: RpcResponse<String> = serde_json::from_str(raw).unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, -8);
    }
}
