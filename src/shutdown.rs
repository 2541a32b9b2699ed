//! Cooperative stop signal shared by poll loops and background tasks

use std::time::Duration;
use tokio::sync::watch;

/// Owning side of the stop signal; firing it is irreversible.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Cloneable observer handed to every task that must wind down on shutdown.
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopHandle {
    pub fn new() -> (Self, StopToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, StopToken { rx })
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopToken {
    /// A token that never fires
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // A closed channel keeps reporting its last value.
        drop(tx);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop is requested. Pends forever if the handle was
    /// dropped without stopping.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless stopped first. Returns `false` if stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stopped() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_completes_without_stop() {
        let (_handle, token) = StopHandle::new();
        assert!(token.sleep(Duration::from_millis(1)).await);
        assert!(!token.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let (handle, token) = StopHandle::new();
        let sleeper = tokio::spawn({
            let token = token.clone();
            async move { token.sleep(Duration::from_secs(3600)).await }
        });
        handle.stop();
        let completed = tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
        assert!(token.is_stopped());
    }

    #[tokio::test]
    async fn test_subscribed_token_sees_stop() {
        let (handle, _token) = StopHandle::new();
        let late = handle.token();
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), late.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_never_token_does_not_fire() {
        let token = StopToken::never();
        assert!(!token.is_stopped());
        let fired = tokio::time::timeout(Duration::from_millis(20), token.stopped()).await;
        assert!(fired.is_err());
    }
}
