// Portfolio Orchestrator - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod entities;       // Entity Registry
pub mod run_record;     // Per-entity, per-cycle outcome state machine
pub mod aggregator;     // Metric Aggregator
pub mod config;
pub mod operations;     // Injected per-entity capability + built-ins
pub mod retry;
pub mod publisher;      // Snapshot Publisher
pub mod db;             // Snapshot store (memory + SQLite)
pub mod orchestrator;   // Execution Orchestrator

// Re-export commonly used types
pub use error::{AggregationError, OrchestratorError, OrchestratorResult, ValidationError};
pub use entities::{
    Entity, EntityCategory, EntityUpdate, EntityRegistry,
    load_entities, load_entities_csv, load_entities_json,
};
pub use run_record::{CycleLedger, InvalidTransition, RunRecord, RunStatus, StatusTransition};
pub use aggregator::{fingerprint, AccountSubtotal, AggregateSnapshot, MetricAggregator};
pub use config::{OperationRouting, OrchestratorConfig};
pub use operations::{
    EntityOperation, Outcome, OperationKind, OperationRouter,
    MetricFeed, FeedEntry,
    RevenuePullOperation, SyncOperation, CleanupOperation,
};
pub use retry::RetryPolicy;
pub use publisher::{SnapshotPublisher, SnapshotQuery};
pub use db::{Event, MemoryStore, SnapshotStore, SqliteStore, setup_database};
pub use orchestrator::Orchestrator;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
