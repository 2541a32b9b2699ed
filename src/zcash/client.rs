use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use super::types::{
    AddressValidation, BlockchainInfo, OperationStatus, RpcResponse, SendRecipient, TotalBalance,
};
use super::ZcashRpc;
use crate::config::ZcashConfig;
use crate::error::GatewayError;
use crate::metrics;

/// JSON-RPC client for zcashd
pub struct ZcashClient {
    client: Client,
    rpc_url: String,
    rpc_user: String,
    rpc_password: String,
    /// Tags outgoing requests; per instance so clients stay independent
    request_id: AtomicU64,
}

impl ZcashClient {
    pub fn new(config: &ZcashConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.rpc_timeout_secs))
            .build()
            .wrap_err("Failed to build zcash RPC HTTP client")?;

        Ok(Self {
            client,
            rpc_url: config.rpc_url.clone(),
            rpc_user: config.rpc_user.clone(),
            rpc_password: config.rpc_password.clone(),
            request_id: AtomicU64::new(0),
        })
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, GatewayError> {
        let id = self.next_request_id();
        let body = request_body(id, method, params);
        debug!(method, id, "zcash RPC call");

        let result = async {
            let response = self
                .client
                .post(&self.rpc_url)
                .basic_auth(&self.rpc_user, Some(&self.rpc_password))
                .json(&body)
                .send()
                .await
                .map_err(|e| transport(method, e.to_string()))?;

            // zcashd answers RPC errors with HTTP 500 and a JSON-RPC body, so the
            // status code alone does not decide between Rpc and Transport.
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .map_err(|e| transport(method, e.to_string()))?;

            decode_response(method, status, &text)
        }
        .await;

        if let Err(ref e) = result {
            metrics::record_rpc_error(method, e.kind());
        }
        result
    }
}

fn transport(method: &str, message: String) -> GatewayError {
    GatewayError::Transport {
        method: method.to_string(),
        message,
    }
}

fn request_body(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "1.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

fn decode_response<T: DeserializeOwned>(
    method: &str,
    http_status: u16,
    body: &str,
) -> Result<T, GatewayError> {
    let response: RpcResponse<T> = serde_json::from_str(body).map_err(|e| {
        transport(
            method,
            format!("malformed response (HTTP {}): {}", http_status, e),
        )
    })?;

    if let Some(error) = response.error {
        return Err(GatewayError::Rpc {
            method: method.to_string(),
            code: error.code,
            message: error.message,
        });
    }

    response
        .result
        .ok_or_else(|| transport(method, format!("response without result (HTTP {})", http_status)))
}

#[async_trait]
impl ZcashRpc for ZcashClient {
    async fn submit_send(
        &self,
        from: &str,
        recipients: &[SendRecipient],
        min_confirmations: u32,
        fee: &str,
    ) -> Result<String, GatewayError> {
        self.rpc_call(
            "z_sendmany",
            json!([from, recipients, min_confirmations, fee]),
        )
        .await
    }

    async fn query_operation_status(
        &self,
        operation_ids: Option<&[String]>,
    ) -> Result<Vec<OperationStatus>, GatewayError> {
        self.rpc_call("z_getoperationstatus", operation_params(operation_ids))
            .await
    }

    async fn consume_operation_result(
        &self,
        operation_ids: Option<&[String]>,
    ) -> Result<Vec<OperationStatus>, GatewayError> {
        self.rpc_call("z_getoperationresult", operation_params(operation_ids))
            .await
    }

    async fn validate_address(&self, address: &str) -> Result<AddressValidation, GatewayError> {
        self.rpc_call("z_validateaddress", json!([address])).await
    }

    async fn get_balance(
        &self,
        address: &str,
        min_confirmations: u32,
    ) -> Result<f64, GatewayError> {
        self.rpc_call("z_getbalance", json!([address, min_confirmations]))
            .await
    }

    async fn get_total_balance(
        &self,
        min_confirmations: u32,
    ) -> Result<TotalBalance, GatewayError> {
        self.rpc_call("z_gettotalbalance", json!([min_confirmations]))
            .await
    }

    async fn list_addresses(&self) -> Result<Vec<String>, GatewayError> {
        self.rpc_call("z_listaddresses", json!([])).await
    }

    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, GatewayError> {
        self.rpc_call("getblockchaininfo", json!([])).await
    }
}

/// zcashd takes the id filter as an optional first positional argument
fn operation_params(operation_ids: Option<&[String]>) -> Value {
    match operation_ids {
        Some(ids) => json!([ids]),
        None => json!([]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ZcashConfig {
        ZcashConfig {
            rpc_url: "http://127.0.0.1:8232".to_string(),
            rpc_user: "user".to_string(),
            rpc_password: "secret".to_string(),
            from_address: format!("zs1{}", "q".repeat(60)),
            min_confirmations: 1,
            fee: "0.0001".to_string(),
            rpc_timeout_secs: 5,
        }
    }

    #[test]
    fn test_request_ids_are_per_instance() {
        let a = ZcashClient::new(&test_config()).unwrap();
        let b = ZcashClient::new(&test_config()).unwrap();
        assert_eq!(a.next_request_id(), 1);
        assert_eq!(a.next_request_id(), 2);
        assert_eq!(b.next_request_id(), 1);
    }

    #[test]
    fn test_request_body_shape() {
        let body = request_body(3, "z_getoperationstatus", json!([["opid-1"]]));
        assert_eq!(body["jsonrpc"], "1.0");
        assert_eq!(body["id"], 3);
        assert_eq!(body["method"], "z_getoperationstatus");
        assert_eq!(body["params"][0][0], "opid-1");
    }

    #[test]
    fn test_operation_params() {
        let ids = vec!["opid-1".to_string()];
        assert_eq!(operation_params(Some(&ids)), json!([["opid-1"]]));
        assert_eq!(operation_params(None), json!([]));
    }

    #[test]
    fn test_decode_success() {
        let op: String =
            decode_response("z_sendmany", 200, r#"{"result":"opid-1","error":null,"id":1}"#)
                .unwrap();
        assert_eq!(op, "opid-1");
    }

    #[test]
    fn test_decode_rpc_error_on_http_500() {
        let err = decode_response::<String>(
            "z_sendmany",
            500,
            r#"{"result":null,"error":{"code":-6,"message":"Insufficient funds"},"id":1}"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            GatewayError::Rpc {
                method: "z_sendmany".to_string(),
                code: -6,
                message: "Insufficient funds".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_non_json_is_transport() {
        let err = decode_response::<String>("z_sendmany", 401, "Unauthorized").unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
        assert!(err.to_string().contains("HTTP 401"));
    }

    #[test]
    fn test_decode_missing_result_is_transport() {
        let err =
            decode_response::<String>("z_sendmany", 200, r#"{"result":null,"error":null,"id":1}"#)
                .unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        // Bind then drop so nothing is listening on the port
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = test_config();
        config.rpc_url = format!("http://127.0.0.1:{}", port);
        let client = ZcashClient::new(&config).unwrap();
        let err = client.list_addresses().await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport { .. }));
    }
}
