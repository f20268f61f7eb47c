//! Causality graph model.
//!
//! Rows mirror the materialized tables one-to-one. The parent-side lists
//! ([`Entity::incarnations`], [`Interaction::messages`]) are never stored; they
//! are rebuilt from child rows when a [`GraphSnapshot`] is assembled into a
//! [`Universe`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::event::OpType;

/// A computation instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub begin_timestamp: DateTime<Utc>,
    /// Set once by `ExecutionEnds`, never overwritten.
    pub end_timestamp: Option<DateTime<Utc>>,
    /// Execution that spawned this one.
    pub parent_id: Option<String>,
    /// Execution that logically caused this one.
    pub creator_id: Option<String>,
    pub process_id: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub process_id: String,
}

/// A logical resource with an ordered history of incarnations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub description: Option<String>,
    /// Derived: incarnation ids in discovery order.
    #[serde(default)]
    pub incarnations: Vec<String>,
}

/// One concrete version of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incarnation {
    pub incarnation_id: String,
    pub entity_id: Option<String>,
    pub parent_id: Option<String>,
    /// Execution that wrote this incarnation. Filled at most once.
    pub creator_id: Option<String>,
    pub description: Option<String>,
}

/// A read or write performed by an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub ts: DateTime<Utc>,
    pub execution_id: String,
    pub op_type: OpType,
    pub entity_id: Option<String>,
    pub incarnation_id: String,
    pub entity_description: Option<String>,
    pub incarnation_description: Option<String>,
}

/// A conversation between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub interaction_id: String,
    pub ts: Option<DateTime<Utc>>,
    pub initiator_participant: Option<String>,
    pub responder_participant: Option<String>,
    pub description: Option<String>,
    /// Derived: message ids in discovery order.
    #[serde(default)]
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub interaction_id: String,
    pub ts: DateTime<Utc>,
    pub sender: String,
    pub target: String,
    pub payload: Option<String>,
    pub incarnation_ids: Option<Vec<String>>,
}

/// Out-of-band annotation edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Assert {
    pub source: String,
    pub target: String,
    pub comment: String,
}

/// Per-execution rollup recomputed while the worker is idle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub reads: i64,
    pub writes: i64,
    pub duration_ms: Option<i64>,
}

/// Raw table contents as read from a store.
///
/// Entities, incarnations, interactions and messages must be in first-observed
/// order; derived lists inherit it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub executions: Vec<Execution>,
    pub processes: Vec<Process>,
    pub entities: Vec<Entity>,
    pub incarnations: Vec<Incarnation>,
    pub operations: Vec<Operation>,
    pub interactions: Vec<Interaction>,
    pub messages: Vec<Message>,
    pub asserts: Vec<Assert>,
}

/// Complete in-memory view of the materialized graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Universe {
    pub executions: BTreeMap<String, Execution>,
    pub incarnations: BTreeMap<String, Incarnation>,
    pub operations: BTreeMap<String, Operation>,
    pub entities: BTreeMap<String, Entity>,
    pub processes: BTreeMap<String, Process>,
    pub interactions: BTreeMap<String, Interaction>,
    pub messages: BTreeMap<String, Message>,
    pub asserts: BTreeSet<Assert>,
}

impl GraphSnapshot {
    /// Index the rows and rebuild the derived child lists.
    ///
    /// Any stored `incarnations` / `messages` lists are discarded first.
    pub fn into_universe(self) -> Universe {
        let mut entities: BTreeMap<String, Entity> = self
            .entities
            .into_iter()
            .map(|mut entity| {
                entity.incarnations.clear();
                (entity.entity_id.clone(), entity)
            })
            .collect();

        let mut interactions: BTreeMap<String, Interaction> = self
            .interactions
            .into_iter()
            .map(|mut interaction| {
                interaction.messages.clear();
                (interaction.interaction_id.clone(), interaction)
            })
            .collect();

        for incarnation in &self.incarnations {
            let Some(entity_id) = &incarnation.entity_id else {
                continue;
            };
            match entities.get_mut(entity_id) {
                Some(entity) => entity
                    .incarnations
                    .push(incarnation.incarnation_id.clone()),
                None => warn!(
                    incarnation_id = %incarnation.incarnation_id,
                    entity_id = %entity_id,
                    "Incarnation references unknown entity"
                ),
            }
        }

        for message in &self.messages {
            match interactions.get_mut(&message.interaction_id) {
                Some(interaction) => interaction.messages.push(message.message_id.clone()),
                None => warn!(
                    message_id = %message.message_id,
                    interaction_id = %message.interaction_id,
                    "Message references unknown interaction"
                ),
            }
        }

        Universe {
            executions: self
                .executions
                .into_iter()
                .map(|e| (e.execution_id.clone(), e))
                .collect(),
            incarnations: self
                .incarnations
                .into_iter()
                .map(|i| (i.incarnation_id.clone(), i))
                .collect(),
            operations: self
                .operations
                .into_iter()
                .map(|o| (o.operation_id.clone(), o))
                .collect(),
            entities,
            processes: self
                .processes
                .into_iter()
                .map(|p| (p.process_id.clone(), p))
                .collect(),
            interactions,
            messages: self
                .messages
                .into_iter()
                .map(|m| (m.message_id.clone(), m))
                .collect(),
            asserts: self.asserts.into_iter().collect(),
        }
    }
}
