// ⚠️ Error kinds for the orchestration core
//
// Entity-level failures are contained in RunRecords. Only cycle-level
// problems (aggregation, cancellation, store) surface from run_cycle().

use serde::{Deserialize, Serialize};

// ============================================================================
// VALIDATION ERROR
// ============================================================================

/// A rejected entity or update. The entity it targets is left unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{entity_id}] {field}: {message}")]
pub struct ValidationError {
    pub entity_id: String,
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(entity_id: &str, field: &str, message: impl Into<String>) -> Self {
        ValidationError {
            entity_id: entity_id.to_string(),
            field: field.to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// AGGREGATION ERROR
// ============================================================================

/// Aggregator invariant violated. Fatal to the cycle: no snapshot is published.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("computed {metric} is negative: {value}")]
    NegativeTotal { metric: &'static str, value: f64 },

    #[error("computed {metric} is not finite")]
    NonFinite { metric: &'static str },

    #[error("computed {metric} outside [0, 1]: {value}")]
    OutOfRange { metric: &'static str, value: f64 },

    #[error("entity {entity_id} has more than one run record in cycle {cycle_id}")]
    DuplicateRecord { entity_id: String, cycle_id: u64 },

    #[error("run record for {entity_id} belongs to cycle {found}, expected {expected}")]
    ForeignCycle {
        entity_id: String,
        expected: u64,
        found: u64,
    },
}

// ============================================================================
// ORCHESTRATOR ERROR
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("entity not found: {id}")]
    NotFound { id: String },

    #[error("operation failed for {entity_id}: {detail}")]
    OperationFailure { entity_id: String, detail: String },

    #[error("cycle {cycle_id} cancelled after {dispatched} dispatches")]
    CycleCancelled { cycle_id: u64, dispatched: usize },

    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("snapshot store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("registry load failed: {0}")]
    Load(String),
}

impl OrchestratorError {
    pub fn not_found(id: &str) -> Self {
        OrchestratorError::NotFound { id: id.to_string() }
    }

    /// Wrap an anyhow error coming out of a store implementation
    pub fn store(err: anyhow::Error) -> Self {
        OrchestratorError::Store(format!("{err:#}"))
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
