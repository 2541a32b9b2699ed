//! Shielded-chain RPC gateway
//!
//! One method per zcashd call, one HTTP round trip per method. Nothing here
//! retries: only the caller knows whether repeating a call could duplicate a
//! transfer. `submit_send` in particular is NOT idempotent.

use async_trait::async_trait;

use crate::error::GatewayError;

pub mod client;
pub mod types;

pub use client::ZcashClient;
pub use types::{
    AddressValidation, BlockchainInfo, OperationState, OperationStatus, SendRecipient,
    TotalBalance,
};

#[async_trait]
pub trait ZcashRpc: Send + Sync {
    /// `z_sendmany`; returns the async operation id
    async fn submit_send(
        &self,
        from: &str,
        recipients: &[SendRecipient],
        min_confirmations: u32,
        fee: &str,
    ) -> Result<String, GatewayError>;

    /// `z_getoperationstatus`; `None` queries every operation the node knows
    async fn query_operation_status(
        &self,
        operation_ids: Option<&[String]>,
    ) -> Result<Vec<OperationStatus>, GatewayError>;

    /// `z_getoperationresult`. Destructive: the node drops finished results
    /// it returns here, so a second call will not see them again.
    async fn consume_operation_result(
        &self,
        operation_ids: Option<&[String]>,
    ) -> Result<Vec<OperationStatus>, GatewayError>;

    /// `z_validateaddress`
    async fn validate_address(&self, address: &str) -> Result<AddressValidation, GatewayError>;

    /// `z_getbalance`
    async fn get_balance(&self, address: &str, min_confirmations: u32)
        -> Result<f64, GatewayError>;

    /// `z_gettotalbalance`
    async fn get_total_balance(&self, min_confirmations: u32)
        -> Result<TotalBalance, GatewayError>;

    /// `z_listaddresses`
    async fn list_addresses(&self) -> Result<Vec<String>, GatewayError>;

    /// `getblockchaininfo`
    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, GatewayError>;
}
