//! Materialization errors.

use thiserror::Error;

/// Why an event could not be folded into the graph.
///
/// Every variant is handled the same way by the worker: the claim is released
/// and the event retried until it runs out of attempts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MaterializeError {
    /// The event refers to an execution whose `ExecutionBegins` has not been
    /// materialized yet. Usually resolves on a later attempt.
    #[error("execution '{execution_id}' has not been materialized yet")]
    ExecutionNotFound { execution_id: String },

    /// Strict mode: a read observed an incarnation no prior write created.
    #[error(
        "consistency violation: execution '{execution_id}' read incarnation '{incarnation_id}' before any write created it"
    )]
    ConsistencyViolation {
        execution_id: String,
        incarnation_id: String,
    },

    /// The store rejected or failed a statement.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl MaterializeError {
    /// Short stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutionNotFound { .. } => "execution_not_found",
            Self::ConsistencyViolation { .. } => "consistency_violation",
            Self::Store(_) => "store",
        }
    }
}
