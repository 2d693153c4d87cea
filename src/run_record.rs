// 🧾 Run Records - per-entity, per-cycle outcome
//
// State machine per entity per cycle:
//   Pending → Running → {Succeeded | Failed (→ Running on retry) | Skipped}
//   Pending → Skipped (excluded by configuration)
//
// Every transition is appended to the record's timeline; nothing is rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// RUN STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }

    /// Succeeded, Failed and Skipped end a cycle for an entity
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Skipped)
    }

    /// Whether an entity with this final status contributes to totals
    pub fn counts_toward_totals(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Skipped)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Skipped)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Failed, RunStatus::Running)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition for {entity_id}: {from} → {to}")]
pub struct InvalidTransition {
    pub entity_id: String,
    pub from: RunStatus,
    pub to: RunStatus,
}

// ============================================================================
// RUN RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub status: RunStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub entity_id: String,
    pub cycle_id: u64,
    pub status: RunStatus,

    /// Time of the latest transition
    pub timestamp: DateTime<Utc>,

    /// Error detail of the latest failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Number of times the entity entered Running in this cycle
    pub attempts: u32,

    /// Append-only timeline (first entry is always Pending)
    pub transitions: Vec<StatusTransition>,
}

impl RunRecord {
    pub fn pending(entity_id: &str, cycle_id: u64) -> Self {
        let now = Utc::now();
        RunRecord {
            entity_id: entity_id.to_string(),
            cycle_id,
            status: RunStatus::Pending,
            timestamp: now,
            error: None,
            attempts: 0,
            transitions: vec![StatusTransition {
                status: RunStatus::Pending,
                at: now,
                detail: None,
            }],
        }
    }

    /// Move to `next`, recording `detail` as the error when failing
    pub fn transition(
        &mut self,
        next: RunStatus,
        detail: Option<String>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                entity_id: self.entity_id.clone(),
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == RunStatus::Running {
            self.attempts += 1;
        }
        if next == RunStatus::Failed {
            self.error = detail.clone();
        }

        self.status = next;
        self.timestamp = now;
        self.transitions.push(StatusTransition {
            status: next,
            at: now,
            detail,
        });
        Ok(())
    }

    /// Terminal failure from Running, or a new detail on an already Failed record
    ///
    /// Used when a cycle is cancelled while the entity waits out a retry backoff.
    pub fn fail(&mut self, detail: String) -> Result<(), InvalidTransition> {
        if self.status != RunStatus::Failed {
            return self.transition(RunStatus::Failed, Some(detail));
        }

        let now = Utc::now();
        self.error = Some(detail.clone());
        self.timestamp = now;
        self.transitions.push(StatusTransition {
            status: RunStatus::Failed,
            at: now,
            detail: Some(detail),
        });
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ============================================================================
// CYCLE LEDGER
// ============================================================================

/// All run records of one cycle, in registry order
#[derive(Debug, Clone)]
pub struct CycleLedger {
    cycle_id: u64,
    records: Vec<RunRecord>,
    index: HashMap<String, usize>,
}

impl CycleLedger {
    /// One Pending record per entity id
    pub fn new<'a, I>(cycle_id: u64, entity_ids: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut records = Vec::new();
        let mut index = HashMap::new();
        for id in entity_ids {
            if index.contains_key(id) {
                continue;
            }
            index.insert(id.to_string(), records.len());
            records.push(RunRecord::pending(id, cycle_id));
        }

        CycleLedger {
            cycle_id,
            records,
            index,
        }
    }

    pub fn cycle_id(&self) -> u64 {
        self.cycle_id
    }

    pub fn transition(
        &mut self,
        entity_id: &str,
        next: RunStatus,
        detail: Option<String>,
    ) -> Result<(), InvalidTransition> {
        match self.index.get(entity_id) {
            Some(&pos) => self.records[pos].transition(next, detail),
            None => Err(InvalidTransition {
                entity_id: entity_id.to_string(),
                from: RunStatus::Pending,
                to: next,
            }),
        }
    }

    pub fn fail(&mut self, entity_id: &str, detail: String) -> Result<(), InvalidTransition> {
        match self.index.get(entity_id) {
            Some(&pos) => self.records[pos].fail(detail),
            None => Err(InvalidTransition {
                entity_id: entity_id.to_string(),
                from: RunStatus::Pending,
                to: RunStatus::Failed,
            }),
        }
    }

    /// Entity ids currently in `status`, in registry order
    pub fn ids_with_status(&self, status: RunStatus) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.entity_id.clone())
            .collect()
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RunRecord> {
        self.records
    }
}

// ============================================================================
// TESTS
// ============================================================================
