//! Cooperative cancellation for in-progress waits.

use tokio::sync::watch;

/// Cancellation signal that can be cloned and awaited.
#[derive(Clone)]
pub struct CancelSignal {
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Wait until cancellation is raised. Returns immediately if it already was.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // A closed channel means the handle is gone and nobody can cancel.
        if receiver.wait_for(|raised| *raised).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Raises cancellation for every [`CancelSignal`] it handed out.
#[derive(Clone)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Raise cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let handle = CancelHandle::new();
        let signal = handle.signal();

        let waiter = tokio::spawn(async move { signal.cancelled().await });
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_taken_after_cancel_is_already_cancelled() {
        let handle = CancelHandle::new();
        handle.cancel();
        handle.cancel();

        let signal = handle.signal();
        assert!(signal.is_cancelled());
        signal.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncancelled_signal_stays_pending() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let result = tokio::time::timeout(Duration::from_secs(5), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
