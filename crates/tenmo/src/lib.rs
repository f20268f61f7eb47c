//! # Tenmo
//!
//! A durable event queue and an idempotent materializer that turn a stream of
//! provenance events into a causality graph of a distributed computation.
//!
//! ## Core Concepts
//!
//! Tenmo separates **observations** from **the graph**:
//! - [`Event`] = Observations (an execution began or ended, an operation touched
//!   an incarnation, a message was sent)
//! - [`Universe`] = The graph (executions, entities, incarnations, operations,
//!   interactions, messages and asserts)
//!
//! The key principle: **One Event = One Transaction**.
//! Applying an event and marking it processed commit together, so a crash can
//! only ever leave an event unprocessed, never half-applied.
//!
//! ## Architecture
//!
//! ```text
//! Producers (JSONL, CLI, SQL INSERT)
//!     │
//!     ▼ append()
//! EventStore (idle) ──── notify ───► WakeSignal
//!     │                                  │
//!     ▼ claim_one()                      │
//! Worker.run() loop ◄────────────────────┘
//!     │
//!     ├─► GraphStore.begin() ─► Materializer.apply() ─► mark_processed()
//!     │                                                       │
//!     │                                  commit() ◄───────────┘
//!     │
//!     └─► on error: release() ─► idle (retry) | abandoned (attempts exhausted)
//!
//! LeaseReclaimer.run() ─► reclaim_expired() ─► stale claims back to idle
//! ```
//!
//! ## Key Invariants
//!
//! 1. **At most one live claim** - Claiming is a single conditional update
//! 2. **Attempts fence finalization** - A worker whose lease was reclaimed
//!    cannot finalize the event anymore
//! 3. **Materialization is idempotent** - Replays never duplicate graph rows
//! 4. **Merge preserves** - Later events fill gaps but never overwrite known
//!    fields with unknown ones
//! 5. **Order independent** - Events may arrive in any order; the graph
//!    converges once their dependencies are processed
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tenmo::{submit, MemoryStore, WakeSignal, Worker, WorkerConfig};
//!
//! let store = Arc::new(MemoryStore::new());
//! let wake = WakeSignal::new();
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! store.subscribe(wake.clone(), shutdown_rx).await?;
//!
//! submit(store.as_ref(), events).await?;
//!
//! let worker = Worker::new("worker-0", store.clone(), WorkerConfig::default(), wake);
//! worker.drain().await?;
//!
//! let universe = store.load().await?;
//! std::io::stdout().write_all(&DotRenderer::default().render(&universe))?;
//! ```

pub mod config;
mod error;
mod event;
mod materializer;
pub mod memory;
mod model;
mod reclaimer;
pub mod render;
mod store;
mod wake;
mod worker;

// Re-export event types
pub use event::{
    ClaimedEvent, Event, EventId, EventStatus, ExecutionBegins, ExecutionEnds, MessageSent,
    OpType, OperationObserved, StoredEvent, UnknownValue,
};

// Re-export graph types
pub use model::{
    Assert, Entity, Execution, ExecutionSummary, GraphSnapshot, Incarnation, Interaction, Message,
    Operation, Process, Universe,
};

// Re-export store traits
pub use store::{submit, EventStore, GraphStore, GraphWriter, QueueStats, LEASE_EXPIRED_ERROR};

// Re-export error types
pub use error::MaterializeError;

// Re-export processing types
pub use materializer::{ConsistencyMode, Materializer};
pub use reclaimer::{LeaseReclaimer, ReclaimerConfig};
pub use wake::WakeSignal;
pub use worker::{Outcome, Worker, WorkerConfig, DEFAULT_MAX_ATTEMPTS};

pub use config::{Config, ConfigError};
pub use memory::MemoryStore;
pub use render::{DotRenderer, Renderer};

// Re-export commonly used external types
pub use async_trait::async_trait;
