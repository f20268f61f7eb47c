//! Store interfaces.
//!
//! The store is the only shared mutable resource. Every cross-worker
//! coordination step (claim, release, lease expiry, conflict merge) is a
//! single conditional statement inside the store; nothing here reads in one
//! call and writes in another.
//!
//! Backends implement all three traits:
//!
//! - [`EventStore`]: the durable queue of events.
//! - [`GraphStore`]: the materialized tables and their read path.
//! - [`GraphWriter`]: one unit of work against the tables, committed or
//!   discarded as a whole.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::event::{ClaimedEvent, Event, EventId, EventStatus, StoredEvent};
use crate::model::{
    Assert, Execution, ExecutionSummary, GraphSnapshot, Incarnation, Interaction, Message,
    Operation, Universe,
};
use crate::wake::WakeSignal;

/// `last_error` recorded when an expired claim is abandoned.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired on final attempt";

/// Durable, append-only event queue with claim/lease/retry bookkeeping.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event as `idle` with zero attempts.
    ///
    /// Appending an id that already exists is an error.
    async fn append(&self, event: &Event) -> Result<EventId>;

    /// Atomically claim one `idle` event with `attempts < max_attempts`.
    ///
    /// The claim flips the status to `claimed`, increments `attempts` and
    /// refreshes `last_modified`. Concurrent callers never receive the same
    /// claim. Events with fewer attempts go first, ties by id, so a retried
    /// event waits for fresh ones that may resolve its dependency.
    /// Returns `None` when nothing is claimable.
    async fn claim_one(&self, max_attempts: u32) -> Result<Option<ClaimedEvent>>;

    /// Give a failed claim back.
    ///
    /// Acts only while the event is still `claimed` with `claimed_attempts`.
    /// Moves it to `abandoned` once `claimed_attempts >= max_attempts`,
    /// otherwise to `idle`. Returns the new status, or `None` if the claim was
    /// lost to the lease reclaimer.
    async fn release(
        &self,
        id: &EventId,
        claimed_attempts: u32,
        max_attempts: u32,
        error: &str,
    ) -> Result<Option<EventStatus>>;

    /// Return every claim older than `lease_timeout` to the pool.
    ///
    /// Claims on their final attempt become `abandoned` instead, with
    /// [`LEASE_EXPIRED_ERROR`] as their `last_error`.
    async fn reclaim_expired(&self, lease_timeout: Duration, max_attempts: u32) -> Result<u64>;

    /// Look up one event and its bookkeeping.
    async fn get(&self, id: &EventId) -> Result<Option<StoredEvent>>;

    /// Count events per status.
    async fn stats(&self) -> Result<QueueStats>;

    /// Arrange for `wake` to fire whenever an event becomes claimable, until
    /// `shutdown` flips to `true`.
    ///
    /// Backends without change notification keep the default, leaving
    /// workers on their poll interval.
    async fn subscribe(
        &self,
        wake: WakeSignal,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let _ = (wake, shutdown);
        Ok(())
    }
}

/// Materialized causality graph.
#[async_trait]
pub trait GraphStore: Send + Sync {
    type Writer: GraphWriter;

    /// Start a unit of work.
    async fn begin(&self) -> Result<Self::Writer>;

    /// Read every materialized table.
    ///
    /// The reads need not share one transaction; a concurrently running
    /// worker may be observed half-way through an event's effects.
    async fn snapshot(&self) -> Result<GraphSnapshot>;

    /// Snapshot the tables and derive the [`Universe`].
    async fn load(&self) -> Result<Universe> {
        Ok(self.snapshot().await?.into_universe())
    }

    /// Recompute the execution summaries.
    async fn refresh_summaries(&self) -> Result<()>;

    /// Summaries as of the last refresh, ordered by execution id.
    async fn summaries(&self) -> Result<Vec<ExecutionSummary>>;

    /// Record an annotation edge. Returns `false` if it already existed.
    async fn annotate(&self, assert: &Assert) -> Result<bool> {
        let mut writer = self.begin().await?;
        let inserted = writer.insert_assert(assert).await?;
        writer.commit().await?;
        Ok(inserted)
    }
}

/// Conflict-tolerant write primitives used by the materializer.
///
/// Insert primitives return whether a row was created. Dropping a writer
/// without [`commit`](GraphWriter::commit) discards everything it did.
#[async_trait]
pub trait GraphWriter: Send {
    /// Insert the process if absent.
    async fn ensure_process(&mut self, process_id: &str) -> Result<bool>;

    /// Insert the execution if absent; an existing row is left untouched.
    async fn insert_execution(&mut self, execution: &Execution) -> Result<bool>;

    /// Set `end_timestamp` unless already set. Returns whether the execution exists.
    async fn finish_execution(&mut self, execution_id: &str, ts: DateTime<Utc>) -> Result<bool>;

    async fn execution_exists(&mut self, execution_id: &str) -> Result<bool>;

    /// Insert the entity if absent.
    async fn ensure_entity(&mut self, entity_id: &str, description: Option<&str>) -> Result<bool>;

    /// Insert the incarnation or merge it into the existing row.
    ///
    /// Nullable columns keep an existing value and only fill in missing ones.
    async fn merge_incarnation(&mut self, incarnation: &Incarnation) -> Result<()>;

    /// `None` if the incarnation does not exist, otherwise its creator.
    async fn incarnation_creator(&mut self, incarnation_id: &str)
        -> Result<Option<Option<String>>>;

    async fn insert_operation(&mut self, operation: &Operation) -> Result<bool>;

    /// Insert the interaction or merge it, same rule as incarnations.
    async fn merge_interaction(&mut self, interaction: &Interaction) -> Result<()>;

    async fn insert_message(&mut self, message: &Message) -> Result<bool>;

    async fn insert_assert(&mut self, assert: &Assert) -> Result<bool>;

    /// Mark the event `processed` as part of this unit of work.
    ///
    /// Fenced like [`EventStore::release`]; returns `false` if the claim was lost.
    async fn mark_processed(&mut self, id: &EventId, claimed_attempts: u32) -> Result<bool>;

    async fn commit(self) -> Result<()>;
}

/// Event counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub idle: i64,
    pub claimed: i64,
    pub processed: i64,
    pub abandoned: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.idle + self.claimed + self.processed + self.abandoned
    }
}

/// Append events in order. Stops at the first store error.
pub async fn submit<S, I>(store: &S, events: I) -> Result<Vec<EventId>>
where
    S: EventStore + ?Sized,
    I: IntoIterator<Item = Event>,
{
    let mut ids = Vec::new();
    for event in events {
        ids.push(store.append(&event).await?);
    }
    Ok(ids)
}
