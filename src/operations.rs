// 🔌 Per-entity operation capability
//
// One polymorphic interface, one variant per integration:
//   execute(entity) -> Outcome { success, value_delta, error }
//
// The orchestrator never knows which integration it is talking to; the
// router picks one by entity category from configuration.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::OperationRouting;
use crate::entities::Entity;

// ============================================================================
// OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,

    /// Added to the entity's value on success
    #[serde(default)]
    pub value_delta: f64,

    /// New completion fraction reported by the integration
    #[serde(default)]
    pub completion: Option<f64>,

    /// New automation level reported by the integration
    #[serde(default)]
    pub automation: Option<f64>,

    #[serde(default)]
    pub error: Option<String>,
}

impl Outcome {
    pub fn success(value_delta: f64) -> Self {
        Outcome {
            success: true,
            value_delta,
            completion: None,
            automation: None,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Outcome {
            success: false,
            value_delta: 0.0,
            completion: None,
            automation: None,
            error: Some(error.into()),
        }
    }

    /// Whether applying this outcome changes the entity
    pub fn changes_entity(&self) -> bool {
        self.value_delta != 0.0 || self.completion.is_some() || self.automation.is_some()
    }
}

// ============================================================================
// OPERATION TRAIT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Sync,
    Cleanup,
    RevenuePull,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Sync => "sync",
            OperationKind::Cleanup => "cleanup",
            OperationKind::RevenuePull => "revenue_pull",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Injected capability executed once per entity attempt
///
/// Implementations may block on I/O; the orchestrator bounds how many run
/// at once and applies retries and timeouts around them.
#[async_trait]
pub trait EntityOperation: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, entity: &Entity) -> Outcome;
}

// ============================================================================
// METRIC FEED
// ============================================================================

/// One entity's figures as reported by an external data feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    #[serde(default)]
    pub value_delta: f64,
    #[serde(default)]
    pub completion: Option<f64>,
    #[serde(default)]
    pub automation: Option<f64>,

    /// Feed-side error for this entity (outage, revoked credentials, ...)
    #[serde(default)]
    pub error: Option<String>,
}

/// entity id → figures; entities absent from the feed report no change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricFeed {
    #[serde(flatten)]
    pub entries: HashMap<String, FeedEntry>,
}

impl MetricFeed {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read metric feed {}", path.display()))?;
        serde_json::from_str(&raw).context("Failed to deserialize metric feed")
    }

    pub fn insert(&mut self, entity_id: &str, entry: FeedEntry) {
        self.entries.insert(entity_id.to_string(), entry);
    }

    pub fn get(&self, entity_id: &str) -> Option<&FeedEntry> {
        self.entries.get(entity_id)
    }
}

// ============================================================================
// BUILT-IN INTEGRATIONS
// ============================================================================

/// Pulls revenue deltas from the feed
pub struct RevenuePullOperation {
    feed: Arc<MetricFeed>,
}

impl RevenuePullOperation {
    pub fn new(feed: Arc<MetricFeed>) -> Self {
        RevenuePullOperation { feed }
    }
}

#[async_trait]
impl EntityOperation for RevenuePullOperation {
    fn name(&self) -> &str {
        OperationKind::RevenuePull.as_str()
    }

    async fn execute(&self, entity: &Entity) -> Outcome {
        match self.feed.get(&entity.id) {
            Some(FeedEntry {
                error: Some(err), ..
            }) => Outcome::failure(err.clone()),
            Some(entry) => Outcome::success(entry.value_delta),
            None => Outcome::success(0.0),
        }
    }
}

/// Syncs progress figures (completion, automation) from the feed
pub struct SyncOperation {
    feed: Arc<MetricFeed>,
}

impl SyncOperation {
    pub fn new(feed: Arc<MetricFeed>) -> Self {
        SyncOperation { feed }
    }
}

#[async_trait]
impl EntityOperation for SyncOperation {
    fn name(&self) -> &str {
        OperationKind::Sync.as_str()
    }

    async fn execute(&self, entity: &Entity) -> Outcome {
        match self.feed.get(&entity.id) {
            Some(FeedEntry {
                error: Some(err), ..
            }) => Outcome::failure(err.clone()),
            Some(entry) => Outcome {
                completion: entry.completion,
                automation: entry.automation,
                ..Outcome::success(0.0)
            },
            None => Outcome::success(0.0),
        }
    }
}

/// Resource cleanup; never changes metrics
pub struct CleanupOperation {
    feed: Arc<MetricFeed>,
}

impl CleanupOperation {
    pub fn new(feed: Arc<MetricFeed>) -> Self {
        CleanupOperation { feed }
    }
}

#[async_trait]
impl EntityOperation for CleanupOperation {
    fn name(&self) -> &str {
        OperationKind::Cleanup.as_str()
    }

    async fn execute(&self, entity: &Entity) -> Outcome {
        match self.feed.get(&entity.id).and_then(|e| e.error.clone()) {
            Some(err) => Outcome::failure(err),
            None => Outcome::success(0.0),
        }
    }
}

// ============================================================================
// ROUTER
// ============================================================================

/// Dispatches each entity to the integration configured for its category
pub struct OperationRouter {
    routing: OperationRouting,
    operations: HashMap<OperationKind, Arc<dyn EntityOperation>>,
}

impl OperationRouter {
    pub fn new(routing: OperationRouting) -> Self {
        OperationRouter {
            routing,
            operations: HashMap::new(),
        }
    }

    /// Router with the three built-in integrations sharing one feed
    pub fn with_builtins(routing: OperationRouting, feed: Arc<MetricFeed>) -> Self {
        OperationRouter::new(routing)
            .register(
                OperationKind::Sync,
                Arc::new(SyncOperation::new(feed.clone())),
            )
            .register(
                OperationKind::Cleanup,
                Arc::new(CleanupOperation::new(feed.clone())),
            )
            .register(
                OperationKind::RevenuePull,
                Arc::new(RevenuePullOperation::new(feed)),
            )
    }

    pub fn register(mut self, kind: OperationKind, operation: Arc<dyn EntityOperation>) -> Self {
        self.operations.insert(kind, operation);
        self
    }
}

#[async_trait]
impl EntityOperation for OperationRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn execute(&self, entity: &Entity) -> Outcome {
        let kind = self.routing.kind_for(entity.category);
        match self.operations.get(&kind) {
            Some(operation) => operation.execute(entity).await,
            None => Outcome::failure(format!("no {} operation registered", kind)),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
