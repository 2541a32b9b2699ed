//! Zwap settlement operator - Library interface
//!
//! Turns Solana-side intents into shielded Zcash sends and tracks each one
//! through `pending -> submitted -> sent | failed`.

pub mod address;
pub mod api;
pub mod bounded_cache;
pub mod config;
pub mod conversion;
pub mod db;
pub mod error;
pub mod locks;
pub mod metrics;
pub mod oracle;
pub mod poller;
pub mod retry;
pub mod settlement;
pub mod shutdown;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod zcash;
