//! In-process store.
//!
//! Holds the queue and the graph tables behind one async mutex. A
//! [`MemoryWriter`] owns the lock for the duration of its unit of work and
//! stages changes on a copy of the tables, so an uncommitted writer leaves no
//! trace. Intended for tests and embedding; nothing survives the process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::event::{ClaimedEvent, Event, EventId, EventStatus, OpType, StoredEvent};
use crate::model::{
    Assert, Entity, Execution, ExecutionSummary, GraphSnapshot, Incarnation, Interaction, Message,
    Operation, Process,
};
use crate::store::{EventStore, GraphStore, GraphWriter, QueueStats, LEASE_EXPIRED_ERROR};
use crate::wake::WakeSignal;

#[derive(Debug, Clone, Default)]
struct Tables {
    next_seq: u64,
    executions: BTreeMap<String, Execution>,
    processes: BTreeMap<String, Process>,
    entities: BTreeMap<String, (u64, Entity)>,
    incarnations: BTreeMap<String, (u64, Incarnation)>,
    operations: BTreeMap<String, Operation>,
    interactions: BTreeMap<String, (u64, Interaction)>,
    messages: BTreeMap<String, (u64, Message)>,
    asserts: BTreeSet<Assert>,
    summaries: BTreeMap<String, ExecutionSummary>,
}

impl Tables {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[derive(Debug, Default)]
struct State {
    events: BTreeMap<EventId, StoredEvent>,
    tables: Tables,
    watchers: Vec<WakeSignal>,
}

impl State {
    fn wake_all(&self) {
        for wake in &self.watchers {
            wake.notify();
        }
    }
}

/// Volatile implementation of [`EventStore`] and [`GraphStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn fill<T: Clone>(existing: &mut Option<T>, incoming: &Option<T>) {
    if existing.is_none() {
        existing.clone_from(incoming);
    }
}

fn ordered<T: Clone>(rows: &BTreeMap<String, (u64, T)>) -> Vec<T> {
    let mut rows: Vec<&(u64, T)> = rows.values().collect();
    rows.sort_by_key(|(seq, _)| *seq);
    rows.into_iter().map(|(_, row)| row.clone()).collect()
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: &Event) -> Result<EventId> {
        let mut state = self.state.lock().await;
        let id = event.id().clone();
        if state.events.contains_key(&id) {
            bail!("event '{}' already appended", id);
        }
        state.events.insert(
            id.clone(),
            StoredEvent {
                event: event.clone(),
                status: EventStatus::Idle,
                attempts: 0,
                last_modified: Utc::now(),
                last_error: None,
            },
        );
        state.wake_all();
        Ok(id)
    }

    async fn claim_one(&self, max_attempts: u32) -> Result<Option<ClaimedEvent>> {
        let mut state = self.state.lock().await;
        // Fresh events before retries, then by id.
        let claimable = state
            .events
            .values_mut()
            .filter(|stored| stored.status == EventStatus::Idle && stored.attempts < max_attempts)
            .min_by_key(|stored| stored.attempts);

        Ok(claimable.map(|stored| {
            stored.status = EventStatus::Claimed;
            stored.attempts += 1;
            stored.last_modified = Utc::now();
            ClaimedEvent {
                event: stored.event.clone(),
                attempts: stored.attempts,
            }
        }))
    }

    async fn release(
        &self,
        id: &EventId,
        claimed_attempts: u32,
        max_attempts: u32,
        error: &str,
    ) -> Result<Option<EventStatus>> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.events.get_mut(id) else {
            return Ok(None);
        };
        if stored.status != EventStatus::Claimed || stored.attempts != claimed_attempts {
            return Ok(None);
        }

        stored.status = if stored.attempts >= max_attempts {
            EventStatus::Abandoned
        } else {
            EventStatus::Idle
        };
        stored.last_error = Some(error.to_string());
        stored.last_modified = Utc::now();

        let status = stored.status;
        if status == EventStatus::Idle {
            state.wake_all();
        }
        Ok(Some(status))
    }

    async fn reclaim_expired(&self, lease_timeout: Duration, max_attempts: u32) -> Result<u64> {
        let lease = chrono::Duration::from_std(lease_timeout)?;
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let mut reclaimed = 0;
        for stored in state.events.values_mut() {
            if stored.status == EventStatus::Claimed && now - stored.last_modified > lease {
                if stored.attempts >= max_attempts {
                    stored.status = EventStatus::Abandoned;
                    stored.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
                } else {
                    stored.status = EventStatus::Idle;
                }
                stored.last_modified = now;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            state.wake_all();
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: &EventId) -> Result<Option<StoredEvent>> {
        Ok(self.state.lock().await.events.get(id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for stored in state.events.values() {
            match stored.status {
                EventStatus::Idle => stats.idle += 1,
                EventStatus::Claimed => stats.claimed += 1,
                EventStatus::Processed => stats.processed += 1,
                EventStatus::Abandoned => stats.abandoned += 1,
            }
        }
        Ok(stats)
    }

    /// Notifications are delivered inline, so there is no task to stop.
    async fn subscribe(
        &self,
        wake: WakeSignal,
        _shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.state.lock().await.watchers.push(wake);
        Ok(())
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    type Writer = MemoryWriter;

    async fn begin(&self) -> Result<MemoryWriter> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.tables.clone();
        Ok(MemoryWriter {
            guard,
            staged,
            processed: Vec::new(),
        })
    }

    async fn snapshot(&self) -> Result<GraphSnapshot> {
        let state = self.state.lock().await;
        let tables = &state.tables;
        Ok(GraphSnapshot {
            executions: tables.executions.values().cloned().collect(),
            processes: tables.processes.values().cloned().collect(),
            entities: ordered(&tables.entities),
            incarnations: ordered(&tables.incarnations),
            operations: tables.operations.values().cloned().collect(),
            interactions: ordered(&tables.interactions),
            messages: ordered(&tables.messages),
            asserts: tables.asserts.iter().cloned().collect(),
        })
    }

    async fn refresh_summaries(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let tables = &mut state.tables;

        let mut summaries: BTreeMap<String, ExecutionSummary> = tables
            .executions
            .values()
            .map(|execution| {
                let summary = ExecutionSummary {
                    execution_id: execution.execution_id.clone(),
                    reads: 0,
                    writes: 0,
                    duration_ms: execution
                        .end_timestamp
                        .map(|end| (end - execution.begin_timestamp).num_milliseconds()),
                };
                (execution.execution_id.clone(), summary)
            })
            .collect();

        for operation in tables.operations.values() {
            if let Some(summary) = summaries.get_mut(&operation.execution_id) {
                match operation.op_type {
                    OpType::Read => summary.reads += 1,
                    OpType::Write => summary.writes += 1,
                }
            }
        }

        tables.summaries = summaries;
        Ok(())
    }

    async fn summaries(&self) -> Result<Vec<ExecutionSummary>> {
        Ok(self
            .state
            .lock()
            .await
            .tables
            .summaries
            .values()
            .cloned()
            .collect())
    }
}

/// Unit of work over a [`MemoryStore`]. Holds the store lock until dropped.
pub struct MemoryWriter {
    guard: OwnedMutexGuard<State>,
    staged: Tables,
    processed: Vec<EventId>,
}

#[async_trait]
impl GraphWriter for MemoryWriter {
    async fn ensure_process(&mut self, process_id: &str) -> Result<bool> {
        if self.staged.processes.contains_key(process_id) {
            return Ok(false);
        }
        self.staged.processes.insert(
            process_id.to_string(),
            Process {
                process_id: process_id.to_string(),
            },
        );
        Ok(true)
    }

    async fn insert_execution(&mut self, execution: &Execution) -> Result<bool> {
        if self.staged.executions.contains_key(&execution.execution_id) {
            return Ok(false);
        }
        self.staged
            .executions
            .insert(execution.execution_id.clone(), execution.clone());
        Ok(true)
    }

    async fn finish_execution(&mut self, execution_id: &str, ts: DateTime<Utc>) -> Result<bool> {
        match self.staged.executions.get_mut(execution_id) {
            Some(execution) => {
                execution.end_timestamp.get_or_insert(ts);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn execution_exists(&mut self, execution_id: &str) -> Result<bool> {
        Ok(self.staged.executions.contains_key(execution_id))
    }

    async fn ensure_entity(&mut self, entity_id: &str, description: Option<&str>) -> Result<bool> {
        if self.staged.entities.contains_key(entity_id) {
            return Ok(false);
        }
        let seq = self.staged.seq();
        self.staged.entities.insert(
            entity_id.to_string(),
            (
                seq,
                Entity {
                    entity_id: entity_id.to_string(),
                    description: description.map(str::to_string),
                    incarnations: Vec::new(),
                },
            ),
        );
        Ok(true)
    }

    async fn merge_incarnation(&mut self, incarnation: &Incarnation) -> Result<()> {
        if let Some((_, existing)) = self.staged.incarnations.get_mut(&incarnation.incarnation_id)
        {
            fill(&mut existing.entity_id, &incarnation.entity_id);
            fill(&mut existing.parent_id, &incarnation.parent_id);
            fill(&mut existing.creator_id, &incarnation.creator_id);
            fill(&mut existing.description, &incarnation.description);
            return Ok(());
        }
        let seq = self.staged.seq();
        self.staged
            .incarnations
            .insert(incarnation.incarnation_id.clone(), (seq, incarnation.clone()));
        Ok(())
    }

    async fn incarnation_creator(
        &mut self,
        incarnation_id: &str,
    ) -> Result<Option<Option<String>>> {
        Ok(self
            .staged
            .incarnations
            .get(incarnation_id)
            .map(|(_, incarnation)| incarnation.creator_id.clone()))
    }

    async fn insert_operation(&mut self, operation: &Operation) -> Result<bool> {
        if self.staged.operations.contains_key(&operation.operation_id) {
            return Ok(false);
        }
        self.staged
            .operations
            .insert(operation.operation_id.clone(), operation.clone());
        Ok(true)
    }

    async fn merge_interaction(&mut self, interaction: &Interaction) -> Result<()> {
        if let Some((_, existing)) = self
            .staged
            .interactions
            .get_mut(&interaction.interaction_id)
        {
            fill(&mut existing.ts, &interaction.ts);
            fill(
                &mut existing.initiator_participant,
                &interaction.initiator_participant,
            );
            fill(
                &mut existing.responder_participant,
                &interaction.responder_participant,
            );
            fill(&mut existing.description, &interaction.description);
            return Ok(());
        }
        let seq = self.staged.seq();
        let mut row = interaction.clone();
        row.messages.clear();
        self.staged
            .interactions
            .insert(interaction.interaction_id.clone(), (seq, row));
        Ok(())
    }

    async fn insert_message(&mut self, message: &Message) -> Result<bool> {
        if self.staged.messages.contains_key(&message.message_id) {
            return Ok(false);
        }
        let seq = self.staged.seq();
        self.staged
            .messages
            .insert(message.message_id.clone(), (seq, message.clone()));
        Ok(true)
    }

    async fn insert_assert(&mut self, assert: &Assert) -> Result<bool> {
        Ok(self.staged.asserts.insert(assert.clone()))
    }

    async fn mark_processed(&mut self, id: &EventId, claimed_attempts: u32) -> Result<bool> {
        let still_ours = self.guard.events.get(id).is_some_and(|stored| {
            stored.status == EventStatus::Claimed && stored.attempts == claimed_attempts
        });
        if still_ours {
            self.processed.push(id.clone());
        }
        Ok(still_ours)
    }

    async fn commit(mut self) -> Result<()> {
        let now = Utc::now();
        self.guard.tables = std::mem::take(&mut self.staged);
        for id in std::mem::take(&mut self.processed) {
            if let Some(stored) = self.guard.events.get_mut(&id) {
                stored.status = EventStatus::Processed;
                stored.last_modified = now;
            }
        }
        debug!("Memory unit of work committed");
        Ok(())
    }
}
