//! Low-latency wake-up for idle workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Shared "new work may exist" flag.
///
/// Setting it while nobody waits leaves a single pending permit, so a worker
/// that starts waiting later returns immediately and clears it. Waiting is
/// always bounded by a timeout; polling stays the correctness fallback.
#[derive(Debug, Clone, Default)]
pub struct WakeSignal {
    notify: Arc<Notify>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Block until the signal is set or `timeout` elapses, clearing it.
    ///
    /// Returns `true` if woken by the signal.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_signal_is_observed_once() {
        let wake = WakeSignal::new();
        wake.notify();
        wake.notify();

        assert!(wake.wait(Duration::from_millis(50)).await);
        assert!(!wake.wait(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn waiter_is_woken_by_another_task() {
        let wake = WakeSignal::new();
        let setter = wake.clone();

        let waiter = tokio::spawn(async move { wake.wait(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        setter.notify();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_signal() {
        let wake = WakeSignal::new();
        assert!(!wake.wait(Duration::from_secs(30)).await);
    }
}
