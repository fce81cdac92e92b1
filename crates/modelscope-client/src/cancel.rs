use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{ClientError, Result};

/// Cooperative cancellation flag shared between a task and its controller.
///
/// Cancelling is sticky; awaiting [`CancelToken::cancelled`] after the fact
/// resolves immediately.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Whether both handles control the same token
    pub fn same_token(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `fut` until it finishes or `token` is cancelled, dropping the future
/// (and any request it holds) on cancellation.
pub async fn cancellable<F, T>(fut: F, token: &CancelToken) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ClientError::Cancelled),
        out = fut => out,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_is_sticky() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancellable_passes_through() {
        let token = CancelToken::new();
        let out = cancellable(async { Ok(42) }, &token).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellable_aborts_pending_future() {
        let token = CancelToken::new();
        let remote = token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.cancel();
        });

        let slow = async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        };
        let err = cancellable(slow, &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
