// 📊 Metric Aggregator - roll up entities + run records into a snapshot
//
// Pure function of its inputs: no clock reads, no hidden state, fixed
// iteration order (entity slice order, BTreeMap for accounts). Same inputs
// give bit-identical totals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

use crate::entities::Entity;
use crate::error::AggregationError;
use crate::run_record::{RunRecord, RunStatus};

// ============================================================================
// SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSubtotal {
    pub account: String,

    /// Entities owned by the account, whatever their outcome
    pub entity_count: usize,

    /// Value of the account's Succeeded/Skipped entities
    pub value: f64,

    pub potential_value: f64,
    pub failure_count: usize,
}

/// Immutable roll-up of one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub cycle_id: u64,
    pub generated_at: DateTime<Utc>,

    /// Σ value over Succeeded/Skipped entities
    pub total_value: f64,

    /// Σ potential value over every entity
    pub total_potential_value: f64,

    /// Mean completion over included entities
    pub overall_completion: f64,

    /// Mean automation over included entities
    pub automation_level: f64,

    pub entity_count: usize,
    pub included_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,

    /// Entities without a terminal record (out-of-band additions)
    pub unsettled_count: usize,

    /// Ordered by account id; accounts with no entities are absent
    pub account_subtotals: Vec<AccountSubtotal>,

    /// SHA-256 over the entity inputs the totals were computed from
    pub registry_fingerprint: String,
}

impl AggregateSnapshot {
    /// Compare everything except cycle id and timestamp
    pub fn same_totals(&self, other: &AggregateSnapshot) -> bool {
        self.total_value.to_bits() == other.total_value.to_bits()
            && self.total_potential_value.to_bits() == other.total_potential_value.to_bits()
            && self.overall_completion.to_bits() == other.overall_completion.to_bits()
            && self.automation_level.to_bits() == other.automation_level.to_bits()
            && self.entity_count == other.entity_count
            && self.included_count == other.included_count
            && self.failure_count == other.failure_count
            && self.skipped_count == other.skipped_count
            && self.account_subtotals == other.account_subtotals
    }

    pub fn subtotal(&self, account: &str) -> Option<&AccountSubtotal> {
        self.account_subtotals.iter().find(|s| s.account == account)
    }

    pub fn summary(&self) -> String {
        format!(
            "Cycle {}: value {:.2} / potential {:.2}, completion {:.1}%, automation {:.1}%, {} failed, {} skipped",
            self.cycle_id,
            self.total_value,
            self.total_potential_value,
            self.overall_completion * 100.0,
            self.automation_level * 100.0,
            self.failure_count,
            self.skipped_count,
        )
    }
}

// ============================================================================
// AGGREGATOR
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricAggregator;

#[derive(Default)]
struct AccountAccumulator {
    entity_count: usize,
    value: f64,
    potential_value: f64,
    failure_count: usize,
}

impl MetricAggregator {
    pub fn new() -> Self {
        MetricAggregator
    }

    /// Build the snapshot for `cycle_id`
    ///
    /// `records` must all belong to `cycle_id`, at most one per entity.
    /// Failed entities are excluded from sums and counted in `failure_count`.
    pub fn aggregate(
        &self,
        cycle_id: u64,
        entities: &[Entity],
        records: &[RunRecord],
        generated_at: DateTime<Utc>,
    ) -> Result<AggregateSnapshot, AggregationError> {
        let latest = index_records(cycle_id, records)?;

        let mut total_value = 0.0;
        let mut total_potential_value = 0.0;
        let mut completion_sum = 0.0;
        let mut automation_sum = 0.0;
        let mut included_count = 0;
        let mut failure_count = 0;
        let mut skipped_count = 0;
        let mut unsettled_count = 0;
        let mut accounts: BTreeMap<&str, AccountAccumulator> = BTreeMap::new();

        for entity in entities {
            let status = latest.get(entity.id.as_str()).map(|r| r.status);
            let account = accounts.entry(entity.account.as_str()).or_default();

            account.entity_count += 1;
            account.potential_value += entity.potential();
            total_potential_value += entity.potential();

            match status {
                Some(s) if s.counts_toward_totals() => {
                    included_count += 1;
                    total_value += entity.value;
                    completion_sum += entity.completion;
                    automation_sum += entity.automation;
                    account.value += entity.value;
                    if s == RunStatus::Skipped {
                        skipped_count += 1;
                    }
                }
                Some(RunStatus::Failed) => {
                    failure_count += 1;
                    account.failure_count += 1;
                }
                _ => unsettled_count += 1,
            }
        }

        let (overall_completion, automation_level) = if included_count == 0 {
            (0.0, 0.0)
        } else {
            (
                completion_sum / included_count as f64,
                automation_sum / included_count as f64,
            )
        };

        check_total("total_value", total_value)?;
        check_total("total_potential_value", total_potential_value)?;
        check_fraction("overall_completion", overall_completion)?;
        check_fraction("automation_level", automation_level)?;

        let account_subtotals = accounts
            .into_iter()
            .map(|(account, acc)| AccountSubtotal {
                account: account.to_string(),
                entity_count: acc.entity_count,
                value: acc.value,
                potential_value: acc.potential_value,
                failure_count: acc.failure_count,
            })
            .collect();

        Ok(AggregateSnapshot {
            cycle_id,
            generated_at,
            total_value,
            total_potential_value,
            overall_completion,
            automation_level,
            entity_count: entities.len(),
            included_count,
            failure_count,
            skipped_count,
            unsettled_count,
            account_subtotals,
            registry_fingerprint: fingerprint(entities),
        })
    }
}

fn index_records<'a>(
    cycle_id: u64,
    records: &'a [RunRecord],
) -> Result<HashMap<&'a str, &'a RunRecord>, AggregationError> {
    let mut latest = HashMap::with_capacity(records.len());
    for record in records {
        if record.cycle_id != cycle_id {
            return Err(AggregationError::ForeignCycle {
                entity_id: record.entity_id.clone(),
                expected: cycle_id,
                found: record.cycle_id,
            });
        }
        if latest.insert(record.entity_id.as_str(), record).is_some() {
            return Err(AggregationError::DuplicateRecord {
                entity_id: record.entity_id.clone(),
                cycle_id,
            });
        }
    }
    Ok(latest)
}

fn check_total(metric: &'static str, value: f64) -> Result<(), AggregationError> {
    if !value.is_finite() {
        return Err(AggregationError::NonFinite { metric });
    }
    if value < 0.0 {
        return Err(AggregationError::NegativeTotal { metric, value });
    }
    Ok(())
}

fn check_fraction(metric: &'static str, value: f64) -> Result<(), AggregationError> {
    if !value.is_finite() {
        return Err(AggregationError::NonFinite { metric });
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(AggregationError::OutOfRange { metric, value });
    }
    Ok(())
}

/// Hash of the inputs that drive totals (identity + metrics, not versions)
pub fn fingerprint(entities: &[Entity]) -> String {
    let mut hasher = Sha256::new();
    for entity in entities {
        hasher.update(entity.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(entity.category.as_str().as_bytes());
        hasher.update(entity.account.as_bytes());
        hasher.update([0u8]);
        hasher.update(entity.value.to_bits().to_le_bytes());
        hasher.update(entity.potential().to_bits().to_le_bytes());
        hasher.update(entity.completion.to_bits().to_le_bytes());
        hasher.update(entity.automation.to_bits().to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================
