// ⚙️ Orchestrator configuration
//
// TOML-backed, every field optional with a default:
//
// ```toml
// max_concurrency = 8
// max_retries = 3
// backoff_base_seconds = 1.0
// excluded_entity_ids = ["legacy-site"]
//
// [operations]
// business = "revenue_pull"
// repository = "sync"
// frontend = "cleanup"
// ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::entities::EntityCategory;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::operations::OperationKind;

// ============================================================================
// OPERATION ROUTING
// ============================================================================

/// Which integration runs for each entity category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationRouting {
    pub business: OperationKind,
    pub repository: OperationKind,
    pub frontend: OperationKind,
}

impl Default for OperationRouting {
    fn default() -> Self {
        OperationRouting {
            business: OperationKind::RevenuePull,
            repository: OperationKind::Sync,
            frontend: OperationKind::Cleanup,
        }
    }
}

impl OperationRouting {
    pub fn kind_for(&self, category: EntityCategory) -> OperationKind {
        match category {
            EntityCategory::Business => self.business,
            EntityCategory::Repository => self.repository,
            EntityCategory::Frontend => self.frontend,
        }
    }
}

// ============================================================================
// ORCHESTRATOR CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Max in-flight entity operations
    pub max_concurrency: usize,

    /// Retries after the first failed attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub backoff_base_seconds: f64,

    /// Growth factor between retries
    pub backoff_factor: f64,

    /// Upper bound on a single retry delay
    pub max_backoff_seconds: f64,

    /// Per-attempt timeout; `None` waits forever
    pub operation_timeout_seconds: Option<f64>,

    /// Entities recorded as Skipped instead of dispatched
    pub excluded_entity_ids: BTreeSet<String>,

    /// Fixed owning-account set; empty means "derive from the registry"
    pub accounts: Vec<String>,

    /// Run-record sets kept by the publisher
    pub history_limit: usize,

    /// Pause between cycles in watch mode
    pub cycle_interval_seconds: f64,

    pub operations: OperationRouting,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            max_concurrency: 8,
            max_retries: 3,
            backoff_base_seconds: 1.0,
            backoff_factor: 2.0,
            max_backoff_seconds: 30.0,
            operation_timeout_seconds: None,
            excluded_entity_ids: BTreeSet::new(),
            accounts: Vec::new(),
            history_limit: 32,
            cycle_interval_seconds: 300.0,
            operations: OperationRouting::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML file and validate
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: OrchestratorConfig = toml::from_str(raw).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.max_concurrency == 0 {
            return Err(OrchestratorError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        check_seconds("backoff_base_seconds", self.backoff_base_seconds)?;
        check_seconds("max_backoff_seconds", self.max_backoff_seconds)?;
        check_seconds("cycle_interval_seconds", self.cycle_interval_seconds)?;
        if let Some(timeout) = self.operation_timeout_seconds {
            check_seconds("operation_timeout_seconds", timeout)?;
            if timeout == 0.0 {
                return Err(OrchestratorError::Config(
                    "operation_timeout_seconds must be positive".to_string(),
                ));
            }
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(OrchestratorError::Config(format!(
                "backoff_factor must be >= 1.0, got {}",
                self.backoff_factor
            )));
        }
        Ok(())
    }

    pub fn is_excluded(&self, entity_id: &str) -> bool {
        self.excluded_entity_ids.contains(entity_id)
    }

    /// `None` when unset or out of range; `validate` rejects the latter
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_seconds
            .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.cycle_interval_seconds).unwrap_or(Duration::MAX)
    }
}

/// Non-negative and representable as a `Duration`
fn check_seconds(field: &str, seconds: f64) -> OrchestratorResult<()> {
    Duration::try_from_secs_f64(seconds).map_err(|_| {
        OrchestratorError::Config(format!(
            "{} must be a non-negative number of seconds within Duration range, got {}",
            field, seconds
        ))
    })?;
    Ok(())
}
