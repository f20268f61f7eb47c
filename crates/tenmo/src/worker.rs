//! Queue worker: claim, materialize, finalize.
//!
//! ```text
//!            ┌──────────────┐  none   ┌──────────────────┐
//!   ┌───────►│  claim_one   │────────►│ refresh summaries│
//!   │        └──────┬───────┘         │ wait wake/poll   │
//!   │               │ event           └────────┬─────────┘
//!   │               ▼                          │
//!   │     ┌───────────────────┐                │
//!   │     │ run_materializer  │                │
//!   │     │ (apply + processed│                │
//!   │     │  in one commit)   │                │
//!   │     └─────────┬─────────┘                │
//!   │               ▼                          │
//!   │        ┌──────────────┐                  │
//!   └────────│   finalize   │◄─────────────────┘
//!            │ release on   │
//!            │ failure      │
//!            └──────────────┘
//! ```
//!
//! Any number of workers may share one store. Claims are exclusive, so no two
//! workers apply the same event at the same time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::MaterializeError;
use crate::event::{ClaimedEvent, EventStatus};
use crate::materializer::{ConsistencyMode, Materializer};
use crate::store::{EventStore, GraphStore, GraphWriter};
use crate::wake::WakeSignal;

/// Default bound on claims per event.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 50;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Claims allowed per event before it is abandoned.
    pub max_attempts: u32,
    /// Longest wait for a wake signal between idle polls.
    pub poll_interval: Duration,
    pub mode: ConsistencyMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval: Duration::from_secs(30),
            mode: ConsistencyMode::Lenient,
        }
    }
}

/// What happened to one claimed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Materialized and marked `processed`.
    Processed,
    /// Failed; back to `idle` for another attempt.
    Released,
    /// Failed on its last attempt; will never be claimed again.
    Abandoned,
    /// The lease expired and the claim moved on before this worker finished.
    LeaseLost,
}

pub struct Worker<S> {
    name: String,
    store: Arc<S>,
    materializer: Materializer,
    config: WorkerConfig,
    wake: WakeSignal,
}

impl<S> Worker<S>
where
    S: EventStore + GraphStore + 'static,
{
    pub fn new(
        name: impl Into<String>,
        store: Arc<S>,
        config: WorkerConfig,
        wake: WakeSignal,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            materializer: Materializer::new(config.mode),
            config,
            wake,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claim one eligible event, if any.
    pub async fn claim_one(&self) -> Result<Option<ClaimedEvent>> {
        self.store.claim_one(self.config.max_attempts).await
    }

    /// Materialize a claimed event and mark it processed in the same commit.
    ///
    /// `Ok(true)` means the claim was still ours when it committed; `Ok(false)`
    /// means the lease had already moved on and the unit of work was dropped.
    /// Every failure, store errors included, comes back as `Err` and leaves the
    /// graph untouched.
    pub async fn run_materializer(
        &self,
        claimed: &ClaimedEvent,
    ) -> Result<bool, MaterializeError> {
        let mut writer = self.store.begin().await?;
        self.materializer.apply(&mut writer, &claimed.event).await?;
        let still_ours = writer
            .mark_processed(claimed.id(), claimed.attempts)
            .await?;
        if !still_ours {
            // Dropping the writer discards its changes.
            return Ok(false);
        }
        writer.commit().await?;
        Ok(true)
    }

    /// Settle a claim after [`run_materializer`](Self::run_materializer).
    ///
    /// Failures release the claim, which either returns the event to `idle`
    /// or abandons it on its last attempt. Errors here are store errors.
    pub async fn finalize(
        &self,
        claimed: &ClaimedEvent,
        result: &Result<bool, MaterializeError>,
    ) -> Result<Outcome> {
        let event_id = claimed.id();
        match result {
            Ok(true) => {
                debug!(worker = %self.name, %event_id, "Event processed");
                Ok(Outcome::Processed)
            }
            Ok(false) => {
                warn!(
                    worker = %self.name,
                    %event_id,
                    attempts = claimed.attempts,
                    "Lease lost before commit"
                );
                Ok(Outcome::LeaseLost)
            }
            Err(err) => {
                let status = self
                    .store
                    .release(
                        event_id,
                        claimed.attempts,
                        self.config.max_attempts,
                        &err.to_string(),
                    )
                    .await?;
                match status {
                    Some(EventStatus::Abandoned) => {
                        error!(
                            worker = %self.name,
                            %event_id,
                            event_type = claimed.event.event_type(),
                            attempts = claimed.attempts,
                            kind = err.kind(),
                            error = %err,
                            "Event abandoned after exhausting attempts"
                        );
                        Ok(Outcome::Abandoned)
                    }
                    Some(_) => {
                        warn!(
                            worker = %self.name,
                            %event_id,
                            event_type = claimed.event.event_type(),
                            attempts = claimed.attempts,
                            kind = err.kind(),
                            error = %err,
                            "Materialization failed, event released"
                        );
                        Ok(Outcome::Released)
                    }
                    None => {
                        warn!(
                            worker = %self.name,
                            %event_id,
                            error = %err,
                            "Lease lost before release"
                        );
                        Ok(Outcome::LeaseLost)
                    }
                }
            }
        }
    }

    /// Claim, materialize and finalize one event.
    ///
    /// Returns `None` when nothing was claimable.
    pub async fn process_next(&self) -> Result<Option<Outcome>> {
        let Some(claimed) = self.claim_one().await? else {
            return Ok(None);
        };
        debug!(
            worker = %self.name,
            event_id = %claimed.id(),
            event_type = claimed.event.event_type(),
            attempts = claimed.attempts,
            "Claimed event"
        );
        let result = self.run_materializer(&claimed).await;
        self.finalize(&claimed, &result).await.map(Some)
    }

    /// Process until nothing is claimable. Returns the number of claims handled.
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        while self.process_next().await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Store errors on claim or release end the loop with `Err`; restarting
    /// is the caller's job.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            worker = %self.name,
            max_attempts = self.config.max_attempts,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            mode = %self.config.mode,
            "Worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if self.process_next().await?.is_some() {
                continue;
            }

            if let Err(e) = self.store.refresh_summaries().await {
                warn!(worker = %self.name, error = %e, "Failed to refresh execution summaries");
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                woken = self.wake.wait(self.config.poll_interval) => {
                    debug!(worker = %self.name, woken, "Worker polling");
                }
            }
        }

        info!(worker = %self.name, "Worker shutting down");
        Ok(())
    }
}
