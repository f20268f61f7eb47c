//! Graph tables: the read path and the per-event unit of work.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use tenmo::{
    Assert, Entity, EventId, Execution, ExecutionSummary, GraphSnapshot, GraphStore, GraphWriter,
    Incarnation, Interaction, Message, Operation, Process,
};
use tracing::debug;

use crate::{attempts_param, PgStore};

#[async_trait]
impl GraphStore for PgStore {
    type Writer = PgGraphWriter;

    async fn begin(&self) -> Result<PgGraphWriter> {
        Ok(PgGraphWriter {
            tx: self.pool.begin().await?,
        })
    }

    /// Read every table. Each query runs on its own pooled connection.
    async fn snapshot(&self) -> Result<GraphSnapshot> {
        let executions = sqlx::query(
            r#"
            SELECT execution_id, begin_timestamp, end_timestamp, parent_id,
                   creator_id, process_id, description
            FROM executions
            ORDER BY execution_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Execution {
            execution_id: row.get("execution_id"),
            begin_timestamp: row.get("begin_timestamp"),
            end_timestamp: row.get("end_timestamp"),
            parent_id: row.get("parent_id"),
            creator_id: row.get("creator_id"),
            process_id: row.get("process_id"),
            description: row.get("description"),
        })
        .collect();

        let processes = sqlx::query("SELECT process_id FROM processes ORDER BY process_id")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| Process {
                process_id: row.get("process_id"),
            })
            .collect();

        let entities = sqlx::query("SELECT entity_id, description FROM entities ORDER BY seq")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| Entity {
                entity_id: row.get("entity_id"),
                description: row.get("description"),
                incarnations: Vec::new(),
            })
            .collect();

        let incarnations = sqlx::query(
            r#"
            SELECT incarnation_id, entity_id, parent_id, creator_id, description
            FROM incarnations
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Incarnation {
            incarnation_id: row.get("incarnation_id"),
            entity_id: row.get("entity_id"),
            parent_id: row.get("parent_id"),
            creator_id: row.get("creator_id"),
            description: row.get("description"),
        })
        .collect();

        let operations = sqlx::query(
            r#"
            SELECT operation_id, ts, execution_id, op_type, entity_id, incarnation_id,
                   entity_description, incarnation_description
            FROM operations
            ORDER BY operation_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| {
            Ok(Operation {
                operation_id: row.get("operation_id"),
                ts: row.get("ts"),
                execution_id: row.get("execution_id"),
                op_type: row.get::<String, _>("op_type").parse()?,
                entity_id: row.get("entity_id"),
                incarnation_id: row.get("incarnation_id"),
                entity_description: row.get("entity_description"),
                incarnation_description: row.get("incarnation_description"),
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let interactions = sqlx::query(
            r#"
            SELECT interaction_id, ts, initiator_participant, responder_participant, description
            FROM interactions
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Interaction {
            interaction_id: row.get("interaction_id"),
            ts: row.get("ts"),
            initiator_participant: row.get("initiator_participant"),
            responder_participant: row.get("responder_participant"),
            description: row.get("description"),
            messages: Vec::new(),
        })
        .collect();

        let messages = sqlx::query(
            r#"
            SELECT message_id, interaction_id, ts, sender, target, payload, incarnation_ids
            FROM messages
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Message {
            message_id: row.get("message_id"),
            interaction_id: row.get("interaction_id"),
            ts: row.get("ts"),
            sender: row.get("sender"),
            target: row.get("target"),
            payload: row.get("payload"),
            incarnation_ids: row.get("incarnation_ids"),
        })
        .collect();

        let asserts = sqlx::query(
            "SELECT source, target, comment FROM asserts ORDER BY source, target, comment",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Assert {
            source: row.get("source"),
            target: row.get("target"),
            comment: row.get("comment"),
        })
        .collect();

        Ok(GraphSnapshot {
            executions,
            processes,
            entities,
            incarnations,
            operations,
            interactions,
            messages,
            asserts,
        })
    }

    async fn refresh_summaries(&self) -> Result<()> {
        sqlx::query("CALL populate_graph()")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn summaries(&self) -> Result<Vec<ExecutionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, reads, writes, duration_ms
            FROM execution_summaries
            ORDER BY execution_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ExecutionSummary {
                execution_id: row.get("execution_id"),
                reads: row.get("reads"),
                writes: row.get("writes"),
                duration_ms: row.get("duration_ms"),
            })
            .collect())
    }
}

/// One materialization transaction.
///
/// Every statement is idempotent: inserts use `ON CONFLICT DO NOTHING` and
/// merges use `COALESCE(existing, incoming)`, so replaying an event after a
/// crash or a lost lease changes nothing. Dropping the writer rolls back.
pub struct PgGraphWriter {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl GraphWriter for PgGraphWriter {
    async fn ensure_process(&mut self, process_id: &str) -> Result<bool> {
        let result =
            sqlx::query("INSERT INTO processes (process_id) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(process_id)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_execution(&mut self, execution: &Execution) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO executions
                (execution_id, begin_timestamp, end_timestamp, parent_id, creator_id,
                 process_id, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&execution.execution_id)
        .bind(execution.begin_timestamp)
        .bind(execution.end_timestamp)
        .bind(&execution.parent_id)
        .bind(&execution.creator_id)
        .bind(&execution.process_id)
        .bind(&execution.description)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_execution(&mut self, execution_id: &str, ts: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET end_timestamp = COALESCE(end_timestamp, $2)
            WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .bind(ts)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn execution_exists(&mut self, execution_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM executions WHERE execution_id = $1)")
            .bind(execution_id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(row.get(0))
    }

    async fn ensure_entity(&mut self, entity_id: &str, description: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO entities (entity_id, description) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(entity_id)
        .bind(description)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn merge_incarnation(&mut self, incarnation: &Incarnation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO incarnations AS old
                (incarnation_id, entity_id, parent_id, creator_id, description)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (incarnation_id) DO UPDATE
            SET entity_id = COALESCE(old.entity_id, EXCLUDED.entity_id),
                parent_id = COALESCE(old.parent_id, EXCLUDED.parent_id),
                creator_id = COALESCE(old.creator_id, EXCLUDED.creator_id),
                description = COALESCE(old.description, EXCLUDED.description)
            "#,
        )
        .bind(&incarnation.incarnation_id)
        .bind(&incarnation.entity_id)
        .bind(&incarnation.parent_id)
        .bind(&incarnation.creator_id)
        .bind(&incarnation.description)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn incarnation_creator(
        &mut self,
        incarnation_id: &str,
    ) -> Result<Option<Option<String>>> {
        let row = sqlx::query("SELECT creator_id FROM incarnations WHERE incarnation_id = $1")
            .bind(incarnation_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(|row| row.get("creator_id")))
    }

    async fn insert_operation(&mut self, operation: &Operation) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO operations
                (operation_id, ts, execution_id, op_type, entity_id, incarnation_id,
                 entity_description, incarnation_description)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&operation.operation_id)
        .bind(operation.ts)
        .bind(&operation.execution_id)
        .bind(operation.op_type.as_str())
        .bind(&operation.entity_id)
        .bind(&operation.incarnation_id)
        .bind(&operation.entity_description)
        .bind(&operation.incarnation_description)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn merge_interaction(&mut self, interaction: &Interaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO interactions AS old
                (interaction_id, ts, initiator_participant, responder_participant, description)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (interaction_id) DO UPDATE
            SET ts = COALESCE(old.ts, EXCLUDED.ts),
                initiator_participant =
                    COALESCE(old.initiator_participant, EXCLUDED.initiator_participant),
                responder_participant =
                    COALESCE(old.responder_participant, EXCLUDED.responder_participant),
                description = COALESCE(old.description, EXCLUDED.description)
            "#,
        )
        .bind(&interaction.interaction_id)
        .bind(interaction.ts)
        .bind(&interaction.initiator_participant)
        .bind(&interaction.responder_participant)
        .bind(&interaction.description)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_message(&mut self, message: &Message) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (message_id, interaction_id, ts, sender, target, payload, incarnation_ids)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&message.message_id)
        .bind(&message.interaction_id)
        .bind(message.ts)
        .bind(&message.sender)
        .bind(&message.target)
        .bind(&message.payload)
        .bind(&message.incarnation_ids)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_assert(&mut self, assert: &Assert) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO asserts (source, target, comment) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(&assert.source)
        .bind(&assert.target)
        .bind(&assert.comment)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(&mut self, id: &EventId, claimed_attempts: u32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'processed',
                last_modified = clock_timestamp()
            WHERE event_id = $1
              AND status = 'claimed'
              AND attempts = $2
            "#,
        )
        .bind(id.as_str())
        .bind(attempts_param(claimed_attempts))
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        debug!("Materialization committed");
        Ok(())
    }
}
