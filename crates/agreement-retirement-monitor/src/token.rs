use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative shutdown signal shared by the monitor loop and its owner.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self { cancelled: Arc::new(sender) }
    }

    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once [`CancellationToken::cancel`] has been called on any clone.
    pub async fn cancelled(&self) {
        let mut receiver = self.cancelled.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters_on_every_clone() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(handle.await.is_ok());

        // Already cancelled tokens resolve immediately.
        token.cancelled().await;
    }
}
