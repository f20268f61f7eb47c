//! Lease reclaimer.
//!
//! Returns claims abandoned by crashed or stalled workers to the pool. The
//! sweep is a single conditional update in the store, so it never races a
//! worker that finalizes at the same moment.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::store::EventStore;
use crate::worker::DEFAULT_MAX_ATTEMPTS;

/// Reclaimer configuration.
#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// Pause between sweeps that found nothing.
    pub interval: Duration,
    /// How long a claim may stay unfinalized.
    pub lease_timeout: Duration,
    /// Claims on this attempt are abandoned rather than returned to `idle`.
    pub max_attempts: u32,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            lease_timeout: Duration::from_secs(5),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

pub struct LeaseReclaimer<S> {
    store: Arc<S>,
    config: ReclaimerConfig,
}

impl<S> LeaseReclaimer<S>
where
    S: EventStore + 'static,
{
    pub fn new(store: Arc<S>, config: ReclaimerConfig) -> Self {
        Self { store, config }
    }

    /// One pass. Returns the number of claims reset.
    pub async fn sweep(&self) -> Result<u64> {
        let reclaimed = self
            .store
            .reclaim_expired(self.config.lease_timeout, self.config.max_attempts)
            .await?;
        if reclaimed > 0 {
            info!(reclaimed, "Un-claimed expired events");
        }
        Ok(reclaimed)
    }

    /// Sweep until `shutdown` flips to `true`.
    ///
    /// A sweep that reclaimed something is followed immediately by another.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            lease_timeout_ms = self.config.lease_timeout.as_millis() as u64,
            "Lease reclaimer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.sweep().await? > 0 {
                continue;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    debug!("Lease reclaimer sweeping");
                }
            }
        }

        info!("Lease reclaimer shutting down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventId, EventStatus, ExecutionEnds};
    use crate::memory::MemoryStore;
    use chrono::Utc;

    fn event(id: &str) -> Event {
        Event::ExecutionEnds(ExecutionEnds {
            event_id: EventId::new(id),
            timestamp: Utc::now(),
            execution_id: "x".into(),
        })
    }

    fn reclaimer(
        store: &Arc<MemoryStore>,
        lease_ms: u64,
        max_attempts: u32,
    ) -> LeaseReclaimer<MemoryStore> {
        LeaseReclaimer::new(
            store.clone(),
            ReclaimerConfig {
                interval: Duration::from_millis(10),
                lease_timeout: Duration::from_millis(lease_ms),
                max_attempts,
            },
        )
    }

    #[tokio::test]
    async fn fresh_claims_are_left_alone() {
        let store = Arc::new(MemoryStore::new());
        store.append(&event("a")).await.unwrap();
        store.claim_one(50).await.unwrap().unwrap();

        assert_eq!(reclaimer(&store, 60_000, 50).sweep().await.unwrap(), 0);
        let stored = store.get(&EventId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Claimed);
    }

    #[tokio::test]
    async fn expired_claim_returns_to_idle_and_is_reclaimable() {
        let store = Arc::new(MemoryStore::new());
        store.append(&event("a")).await.unwrap();
        store.claim_one(50).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(reclaimer(&store, 5, 50).sweep().await.unwrap(), 1);

        let again = store.claim_one(50).await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn expired_claim_on_last_attempt_is_abandoned() {
        let store = Arc::new(MemoryStore::new());
        store.append(&event("a")).await.unwrap();
        store.claim_one(1).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        reclaimer(&store, 5, 1).sweep().await.unwrap();

        let stored = store.get(&EventId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Abandoned);
    }

    #[tokio::test]
    async fn run_loop_reclaims_and_stops() {
        let store = Arc::new(MemoryStore::new());
        store.append(&event("a")).await.unwrap();
        store.claim_one(50).await.unwrap().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reclaimer(&store, 5, 50).run(shutdown_rx));

        let mut idle = false;
        for _ in 0..100 {
            if store.stats().await.unwrap().idle == 1 {
                idle = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(idle, "claim was never reclaimed");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
