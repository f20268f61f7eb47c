//! PostgreSQL implementation of the tenmo event queue and graph store.
//!
//! # Features
//!
//! - Claiming with `FOR UPDATE SKIP LOCKED`
//! - Attempt-fenced release and completion
//! - Lease reclaim as a single conditional `UPDATE`
//! - `LISTEN events_changed` to wake idle workers
//! - Materialized graph tables with `ON CONFLICT` merges
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE events (
//!     event_id TEXT PRIMARY KEY,
//!     created_at TIMESTAMPTZ NOT NULL,
//!     event_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!
//!     -- Queue bookkeeping
//!     status TEXT NOT NULL DEFAULT 'idle'
//!         CHECK (status IN ('idle', 'claimed', 'processed', 'abandoned')),
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     last_modified TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
//!     last_error TEXT
//! );
//! ```
//!
//! The graph tables and the `populate_graph()` procedure live in
//! `migrations/`; see [`migrations::run`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use tenmo_postgres::{migrations, PgStore};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/tenmo").await?;
//! migrations::run(&pool).await?;
//! let store = Arc::new(PgStore::new(pool));
//!
//! let worker = Worker::new("worker-0", store.clone(), config.worker_config(), wake);
//! ```

mod graph;
pub mod migrations;

pub use graph::PgGraphWriter;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tenmo::{
    ClaimedEvent, Event, EventId, EventStatus, EventStore, QueueStats, StoredEvent, WakeSignal,
    LEASE_EXPIRED_ERROR,
};
use tracing::{debug, error, info, warn};

/// Channel notified whenever an event becomes `idle`.
pub const EVENTS_CHANNEL: &str = "events_changed";

/// PostgreSQL event and graph store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Move an undecodable claimed event straight to `abandoned`.
    async fn abandon_undecodable(
        &self,
        event_id: &str,
        attempts: i32,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events
            SET status = 'abandoned',
                last_error = $3,
                last_modified = clock_timestamp()
            WHERE event_id = $1 AND status = 'claimed' AND attempts = $2
            "#,
        )
        .bind(event_id)
        .bind(attempts)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn attempts_param(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn attempts_from(row: &PgRow) -> u32 {
    u32::try_from(row.get::<i32, _>("attempts")).unwrap_or(0)
}

fn status_from(row: &PgRow) -> Result<EventStatus> {
    Ok(row.get::<String, _>("status").parse()?)
}

#[async_trait]
impl EventStore for PgStore {
    async fn append(&self, event: &Event) -> Result<EventId> {
        let payload = serde_json::to_value(event)?;

        sqlx::query(
            r#"
            INSERT INTO events (event_id, created_at, event_type, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.id().as_str())
        .bind(event.timestamp())
        .bind(event.event_type())
        .bind(payload)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to append event '{}'", event.id()))?;

        Ok(event.id().clone())
    }

    /// Claim the next idle event.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent claimers pass over each
    /// other's rows instead of blocking. Payloads that no longer decode are
    /// abandoned on the spot and the next event is tried.
    async fn claim_one(&self, max_attempts: u32) -> Result<Option<ClaimedEvent>> {
        loop {
            let row = sqlx::query(
                r#"
                WITH claimable AS (
                    SELECT event_id
                    FROM events
                    WHERE status = 'idle'
                      AND attempts < $1
                    ORDER BY attempts ASC, event_id ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE events
                SET status = 'claimed',
                    attempts = attempts + 1,
                    last_modified = clock_timestamp()
                WHERE event_id IN (SELECT event_id FROM claimable)
                RETURNING event_id, payload, attempts
                "#,
            )
            .bind(attempts_param(max_attempts))
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let event_id: String = row.get("event_id");
            let payload: serde_json::Value = row.get("payload");
            match serde_json::from_value::<Event>(payload) {
                Ok(event) => {
                    return Ok(Some(ClaimedEvent {
                        event,
                        attempts: attempts_from(&row),
                    }))
                }
                Err(e) => {
                    let reason = format!("undecodable payload: {e}");
                    error!(%event_id, error = %e, "Abandoning undecodable event");
                    self.abandon_undecodable(&event_id, row.get("attempts"), &reason)
                        .await?;
                }
            }
        }
    }

    async fn release(
        &self,
        id: &EventId,
        claimed_attempts: u32,
        max_attempts: u32,
        error: &str,
    ) -> Result<Option<EventStatus>> {
        let row = sqlx::query(
            r#"
            UPDATE events
            SET status = CASE WHEN attempts >= $3 THEN 'abandoned' ELSE 'idle' END,
                last_error = $4,
                last_modified = clock_timestamp()
            WHERE event_id = $1
              AND status = 'claimed'
              AND attempts = $2
            RETURNING status
            "#,
        )
        .bind(id.as_str())
        .bind(attempts_param(claimed_attempts))
        .bind(attempts_param(max_attempts))
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(status_from).transpose()
    }

    /// Reclaim expired leases.
    ///
    /// Compares against `clock_timestamp()` so a long transaction does not
    /// see a stale `now()`.
    async fn reclaim_expired(&self, lease_timeout: Duration, max_attempts: u32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = CASE WHEN attempts >= $2 THEN 'abandoned' ELSE 'idle' END,
                last_error = CASE WHEN attempts >= $2 THEN $3 ELSE last_error END,
                last_modified = clock_timestamp()
            WHERE status = 'claimed'
              AND last_modified < clock_timestamp() - make_interval(secs => $1)
            "#,
        )
        .bind(lease_timeout.as_secs_f64())
        .bind(attempts_param(max_attempts))
        .bind(LEASE_EXPIRED_ERROR)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get(&self, id: &EventId) -> Result<Option<StoredEvent>> {
        let row = sqlx::query(
            r#"
            SELECT payload, status, attempts, last_modified, last_error
            FROM events
            WHERE event_id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let event = serde_json::from_value(row.get("payload"))
            .with_context(|| format!("event '{id}' has an undecodable payload"))?;
        Ok(Some(StoredEvent {
            event,
            status: status_from(&row)?,
            attempts: attempts_from(&row),
            last_modified: row.get("last_modified"),
            last_error: row.get("last_error"),
        }))
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'idle') as idle,
                COUNT(*) FILTER (WHERE status = 'claimed') as claimed,
                COUNT(*) FILTER (WHERE status = 'processed') as processed,
                COUNT(*) FILTER (WHERE status = 'abandoned') as abandoned
            FROM events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            idle: row.get("idle"),
            claimed: row.get("claimed"),
            processed: row.get("processed"),
            abandoned: row.get("abandoned"),
        })
    }

    /// `LISTEN` on [`EVENTS_CHANNEL`] and fire `wake` for every notification.
    ///
    /// The listener runs on its own connection in a background task,
    /// reconnects on connection loss and stops once `shutdown` flips.
    async fn subscribe(
        &self,
        wake: WakeSignal,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(EVENTS_CHANNEL).await?;
        info!(channel = EVENTS_CHANNEL, "Listening for new events");

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    received = listener.recv() => match received {
                        Ok(notification) => {
                            debug!(event_id = notification.payload(), "Event became claimable");
                            wake.notify();
                        }
                        Err(e) => {
                            warn!(error = %e, "Event listener failed, retrying");
                            // Wake anyway: notifications may have been missed.
                            wake.notify();
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                }
            }
            info!(channel = EVENTS_CHANNEL, "Event listener stopped");
        });
        Ok(())
    }
}
