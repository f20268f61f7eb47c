//! Testing utilities for tenmo.
//!
//! [`EventFactory`] hands out events with sortable ids and strictly
//! increasing timestamps, so tests can reason about claim order without
//! sleeping. [`build_scenario`] is a small but complete computation shared by
//! the backend test suites.

use chrono::{DateTime, Duration, Utc};
use tenmo::{
    Event, EventId, ExecutionBegins, ExecutionEnds, MessageSent, OpType, OperationObserved,
};

/// Builds events for tests.
///
/// Ids are `<prefix>-000001`, `<prefix>-000002`, ... so claim order (by id)
/// equals creation order. Each event is one millisecond after the previous.
#[derive(Debug, Clone)]
pub struct EventFactory {
    prefix: String,
    next: u64,
    epoch: DateTime<Utc>,
}

impl Default for EventFactory {
    fn default() -> Self {
        Self::new("ev")
    }
}

impl EventFactory {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 0,
            // 2024-01-01T00:00:00Z
            epoch: DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default(),
        }
    }

    fn tick(&mut self) -> (EventId, DateTime<Utc>) {
        self.next += 1;
        (
            EventId::new(format!("{}-{:06}", self.prefix, self.next)),
            self.epoch + Duration::milliseconds(self.next as i64),
        )
    }

    pub fn begin(&mut self, execution_id: &str) -> Event {
        self.begin_with(execution_id, None, None)
    }

    /// `ExecutionBegins` with a parent and a description.
    pub fn begin_child(&mut self, execution_id: &str, parent_id: &str, description: &str) -> Event {
        self.begin_with(execution_id, Some(parent_id), Some(description))
    }

    fn begin_with(
        &mut self,
        execution_id: &str,
        parent_id: Option<&str>,
        description: Option<&str>,
    ) -> Event {
        let (event_id, timestamp) = self.tick();
        Event::ExecutionBegins(ExecutionBegins {
            event_id,
            timestamp,
            execution_id: execution_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            creator_id: None,
            process_id: Some(format!("proc-{execution_id}")),
            description: description.map(str::to_string),
        })
    }

    pub fn end(&mut self, execution_id: &str) -> Event {
        let (event_id, timestamp) = self.tick();
        Event::ExecutionEnds(ExecutionEnds {
            event_id,
            timestamp,
            execution_id: execution_id.to_string(),
        })
    }

    /// A write of `incarnation_id` (of `entity_id`) derived from `parent`.
    pub fn write(
        &mut self,
        execution_id: &str,
        entity_id: &str,
        incarnation_id: &str,
        parent: Option<&str>,
    ) -> Event {
        self.operation(OpType::Write, execution_id, entity_id, incarnation_id, parent)
    }

    pub fn read(&mut self, execution_id: &str, entity_id: &str, incarnation_id: &str) -> Event {
        self.operation(OpType::Read, execution_id, entity_id, incarnation_id, None)
    }

    fn operation(
        &mut self,
        op_type: OpType,
        execution_id: &str,
        entity_id: &str,
        incarnation_id: &str,
        parent: Option<&str>,
    ) -> Event {
        let (event_id, timestamp) = self.tick();
        Event::Operation(OperationObserved {
            event_id,
            operation_id: None,
            timestamp,
            execution_id: execution_id.to_string(),
            op_type,
            entity_id: Some(entity_id.to_string()),
            incarnation_id: incarnation_id.to_string(),
            parent_incarnation_id: parent.map(str::to_string),
            entity_description: None,
            incarnation_description: None,
        })
    }

    pub fn message(
        &mut self,
        interaction_id: &str,
        sender: &str,
        target: &str,
        payload: &str,
    ) -> Event {
        let (event_id, timestamp) = self.tick();
        Event::Message(MessageSent {
            event_id,
            message_id: None,
            timestamp,
            interaction_id: interaction_id.to_string(),
            sender: sender.to_string(),
            target: target.to_string(),
            payload: Some(payload.to_string()),
            incarnation_ids: None,
            interaction_description: None,
        })
    }
}

/// A build with one child step.
///
/// - `build` writes `src@1` of entity `src`
/// - `compile` (child of `build`) reads `src@1` and writes `out@1`, derived from it
/// - `build` and `compile` exchange one message in interaction `rpc`
/// - both executions end
///
/// Fully materialized this gives 2 executions, 2 processes, 2 entities,
/// 2 incarnations, 3 operations, 1 interaction and 1 message.
pub fn build_scenario() -> Vec<Event> {
    let mut f = EventFactory::default();
    vec![
        f.begin("build"),
        f.write("build", "src", "src@1", None),
        f.begin_child("compile", "build", "cc main.c"),
        f.read("compile", "src", "src@1"),
        f.write("compile", "out", "out@1", Some("src@1")),
        f.message("rpc", "build", "compile", "go"),
        f.end("compile"),
        f.end("build"),
    ]
}
