//! Per-event transition functions.
//!
//! Each function is idempotent: replaying an event against the tables it
//! already shaped changes nothing. All conflict handling lives in the
//! [`GraphWriter`] primitives; this module only decides which primitives an
//! event needs and in what order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::MaterializeError;
use crate::event::{
    Event, ExecutionBegins, ExecutionEnds, MessageSent, OpType, OperationObserved, UnknownValue,
};
use crate::model::{Execution, Incarnation, Interaction, Message, Operation};
use crate::store::GraphWriter;

/// How unseen incarnations are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyMode {
    /// Any operation on an unseen incarnation creates it.
    #[default]
    Lenient,
    /// Only writes create incarnations; a read of an unwritten one fails.
    Strict,
}

impl fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lenient => "lenient",
            Self::Strict => "strict",
        })
    }
}

impl FromStr for ConsistencyMode {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lenient" => Ok(Self::Lenient),
            "strict" => Ok(Self::Strict),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

/// Folds events into the graph tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct Materializer {
    mode: ConsistencyMode,
}

impl Materializer {
    pub fn new(mode: ConsistencyMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ConsistencyMode {
        self.mode
    }

    /// Apply one event through `writer`. Does not commit.
    pub async fn apply<W: GraphWriter>(
        &self,
        writer: &mut W,
        event: &Event,
    ) -> Result<(), MaterializeError> {
        match event {
            Event::ExecutionBegins(e) => self.execution_begins(writer, e).await,
            Event::ExecutionEnds(e) => self.execution_ends(writer, e).await,
            Event::Operation(e) => self.operation(writer, e).await,
            Event::Message(e) => self.message(writer, e).await,
        }
    }

    async fn execution_begins<W: GraphWriter>(
        &self,
        writer: &mut W,
        event: &ExecutionBegins,
    ) -> Result<(), MaterializeError> {
        if let Some(process_id) = &event.process_id {
            writer.ensure_process(process_id).await?;
        }

        let inserted = writer
            .insert_execution(&Execution {
                execution_id: event.execution_id.clone(),
                begin_timestamp: event.timestamp,
                end_timestamp: None,
                parent_id: event.parent_id.clone(),
                creator_id: event.creator_id.clone(),
                process_id: event.process_id.clone(),
                description: event.description.clone(),
            })
            .await?;

        if !inserted {
            debug!(execution_id = %event.execution_id, "Execution already materialized");
        }
        Ok(())
    }

    async fn execution_ends<W: GraphWriter>(
        &self,
        writer: &mut W,
        event: &ExecutionEnds,
    ) -> Result<(), MaterializeError> {
        if writer
            .finish_execution(&event.execution_id, event.timestamp)
            .await?
        {
            Ok(())
        } else {
            Err(MaterializeError::ExecutionNotFound {
                execution_id: event.execution_id.clone(),
            })
        }
    }

    async fn operation<W: GraphWriter>(
        &self,
        writer: &mut W,
        event: &OperationObserved,
    ) -> Result<(), MaterializeError> {
        if self.mode == ConsistencyMode::Strict && event.op_type == OpType::Read {
            // Reads never create in strict mode; they must find a written incarnation.
            match writer.incarnation_creator(&event.incarnation_id).await? {
                Some(Some(_)) => {}
                _ => {
                    return Err(MaterializeError::ConsistencyViolation {
                        execution_id: event.execution_id.clone(),
                        incarnation_id: event.incarnation_id.clone(),
                    })
                }
            }
        }

        if !writer.execution_exists(&event.execution_id).await? {
            return Err(MaterializeError::ExecutionNotFound {
                execution_id: event.execution_id.clone(),
            });
        }

        if let Some(entity_id) = &event.entity_id {
            writer
                .ensure_entity(entity_id, event.entity_description.as_deref())
                .await?;
        }

        let creator_id = match event.op_type {
            OpType::Write => Some(event.execution_id.clone()),
            OpType::Read => None,
        };

        writer
            .merge_incarnation(&Incarnation {
                incarnation_id: event.incarnation_id.clone(),
                entity_id: event.entity_id.clone(),
                parent_id: event.parent_incarnation_id.clone(),
                creator_id,
                description: event.incarnation_description.clone(),
            })
            .await?;

        writer
            .insert_operation(&Operation {
                operation_id: event.operation_id(),
                ts: event.timestamp,
                execution_id: event.execution_id.clone(),
                op_type: event.op_type,
                entity_id: event.entity_id.clone(),
                incarnation_id: event.incarnation_id.clone(),
                entity_description: event.entity_description.clone(),
                incarnation_description: event.incarnation_description.clone(),
            })
            .await?;
        Ok(())
    }

    async fn message<W: GraphWriter>(
        &self,
        writer: &mut W,
        event: &MessageSent,
    ) -> Result<(), MaterializeError> {
        writer
            .merge_interaction(&Interaction {
                interaction_id: event.interaction_id.clone(),
                ts: Some(event.timestamp),
                initiator_participant: Some(event.sender.clone()),
                responder_participant: Some(event.target.clone()),
                description: event.interaction_description.clone(),
                messages: Vec::new(),
            })
            .await?;

        writer
            .insert_message(&Message {
                message_id: event.message_id(),
                interaction_id: event.interaction_id.clone(),
                ts: event.timestamp,
                sender: event.sender.clone(),
                target: event.target.clone(),
                payload: event.payload.clone(),
                incarnation_ids: event.incarnation_ids.clone(),
            })
            .await?;
        Ok(())
    }
}
