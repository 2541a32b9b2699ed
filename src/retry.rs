//! Retry utilities for read-only gateway calls
//!
//! Exponential backoff with a cap, and a classifier that decides whether a
//! gateway failure is worth repeating. Only safe for idempotent queries:
//! `submit_send` never goes through here.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::shutdown::StopToken;

/// JSON-RPC codes zcashd uses for requests that will never succeed as sent
const PERMANENT_RPC_CODES: [i64; 4] = [
    -8,     // RPC_INVALID_PARAMETER
    -5,     // RPC_INVALID_ADDRESS_OR_KEY
    -32601, // method not found
    -32602, // invalid params
];

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, refused connection, node warming up
    Transient,
    /// Bad parameters or unknown method; repeating changes nothing
    Permanent,
}

pub fn classify(error: &GatewayError) -> ErrorClass {
    match error {
        GatewayError::Transport { .. } => ErrorClass::Transient,
        GatewayError::Rpc { code, .. } if PERMANENT_RPC_CODES.contains(code) => {
            ErrorClass::Permanent
        }
        GatewayError::Rpc { .. } => ErrorClass::Transient,
    }
}

/// Run `operation` until it succeeds, fails permanently, runs out of attempts
/// or `stop` fires. The last error is returned in the failure cases.
pub async fn with_retry<F, T, Fut>(
    config: &RetryConfig,
    stop: &StopToken,
    mut operation: F,
) -> Result<T, GatewayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut attempt = 0;

    loop {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempt += 1;

        if classify(&error) == ErrorClass::Permanent {
            debug!(error = %error, "Permanent gateway error, not retrying");
            return Err(error);
        }
        if !config.should_retry(attempt) {
            warn!(
                attempts = attempt,
                error = %error,
                "Retry attempts exhausted"
            );
            return Err(error);
        }

        let backoff = config.backoff_for_attempt(attempt - 1);
        warn!(
            attempt,
            max = config.max_attempts,
            ?backoff,
            error = %error,
            "Retrying after backoff"
        );

        if !stop.sleep(backoff).await {
            return Err(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::StopHandle;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn transport() -> GatewayError {
        GatewayError::Transport {
            method: "z_getoperationstatus".to_string(),
            message: "connection refused".to_string(),
        }
    }

    fn rpc(code: i64) -> GatewayError {
        GatewayError::Rpc {
            method: "z_getoperationstatus".to_string(),
            code,
            message: "boom".to_string(),
        }
    }

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(5), Duration::from_secs(10)); // capped
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify(&transport()), ErrorClass::Transient);
        assert_eq!(classify(&rpc(-28)), ErrorClass::Transient); // warming up
        assert_eq!(classify(&rpc(-8)), ErrorClass::Permanent);
        assert_eq!(classify(&rpc(-32601)), ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&fast(), &StopToken::never(), |_| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transport())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry(&fast(), &StopToken::never(), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(transport()) }
        })
        .await;

        assert_eq!(result, Err(transport()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry(&fast(), &StopToken::never(), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(rpc(-8)) }
        })
        .await;

        assert_eq!(result, Err(rpc(-8)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_backoff() {
        let (handle, token) = StopHandle::new();
        handle.stop();

        let config = RetryConfig {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            ..fast()
        };
        let result: Result<(), _> = with_retry(&config, &token, |_| async { Err(transport()) }).await;
        assert_eq!(result, Err(transport()));
    }
}
