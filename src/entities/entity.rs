// 🏢 Portfolio Entity - Stable identity with mutable metrics
//
// "Entity id is IDENTITY (never changes), value/completion/automation are VALUES"
//
// - Businesses, repositories and frontends share one shape
// - Each entity belongs to exactly one owning account
// - Metrics change only through validated updates (version bumps on each)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

// ============================================================================
// ENTITY CATEGORY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    /// Revenue-generating company or product line
    #[serde(alias = "Business")]
    Business,

    /// Source repository
    #[serde(alias = "Repository")]
    Repository,

    /// Deployed frontend / dashboard
    #[serde(alias = "Frontend")]
    Frontend,
}

impl EntityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityCategory::Business => "business",
            EntityCategory::Repository => "repository",
            EntityCategory::Frontend => "frontend",
        }
    }

    pub fn all() -> [EntityCategory; 3] {
        [
            EntityCategory::Business,
            EntityCategory::Repository,
            EntityCategory::Frontend,
        ]
    }
}

impl fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "business" => Ok(EntityCategory::Business),
            "repository" | "repo" => Ok(EntityCategory::Repository),
            "frontend" => Ok(EntityCategory::Frontend),
            other => Err(format!("unknown entity category: {}", other)),
        }
    }
}

// ============================================================================
// ENTITY
// ============================================================================

/// Tracked portfolio unit
///
/// Identity: `id` (never changes)
/// Values: value, completion, automation (change after successful operations)
/// Relationship: `account` → one of the registry's fixed account ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    // ========================================================================
    // IDENTITY
    // ========================================================================
    pub id: String,

    /// Display name, defaults to the id
    #[serde(default)]
    pub name: String,

    pub category: EntityCategory,

    /// Owning account identifier
    pub account: String,

    // ========================================================================
    // VALUES (mutable)
    // ========================================================================
    /// Monetary value
    pub value: f64,

    /// Upside if every operation lands; missing means "same as value"
    #[serde(default)]
    pub potential_value: Option<f64>,

    /// Completion fraction in [0, 1]
    pub completion: f64,

    /// Automation level in [0, 1]
    pub automation: f64,

    // ========================================================================
    // VERSIONING
    // ========================================================================
    #[serde(default = "initial_version")]
    pub version: i64,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn initial_version() -> i64 {
    1
}

impl Entity {
    pub fn new(
        id: &str,
        category: EntityCategory,
        account: &str,
        value: f64,
        completion: f64,
        automation: f64,
    ) -> Self {
        Entity {
            id: id.to_string(),
            name: id.to_string(),
            category,
            account: account.to_string(),
            value,
            potential_value: None,
            completion,
            automation,
            version: 1,
            updated_at: None,
        }
    }

    /// Potential value, falling back to the current value
    pub fn potential(&self) -> f64 {
        self.potential_value.unwrap_or(self.value)
    }

    /// Check field ranges (value >= 0, fractions within [0, 1])
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::new(&self.id, "id", "Required field is empty"));
        }
        check_amount(&self.id, "value", self.value)?;
        if let Some(potential) = self.potential_value {
            check_amount(&self.id, "potential_value", potential)?;
        }
        check_fraction(&self.id, "completion", self.completion)?;
        check_fraction(&self.id, "automation", self.automation)?;
        Ok(())
    }

    /// Build the next version with `update` applied, validating the result
    ///
    /// `self` is left untouched; callers swap in the returned value.
    pub fn next_version(&self, update: &EntityUpdate) -> Result<Entity, ValidationError> {
        let mut next = self.clone();
        if let Some(value) = update.value {
            next.value = value;
        }
        if let Some(completion) = update.completion {
            next.completion = completion;
        }
        if let Some(automation) = update.automation {
            next.automation = automation;
        }
        next.validate()?;

        next.version += 1;
        next.updated_at = Some(Utc::now());
        Ok(next)
    }
}

fn check_amount(id: &str, field: &str, amount: f64) -> Result<(), ValidationError> {
    if !amount.is_finite() {
        return Err(ValidationError::new(id, field, "must be a finite number"));
    }
    if amount < 0.0 {
        return Err(ValidationError::new(
            id,
            field,
            format!("must not be negative, got {}", amount),
        ));
    }
    Ok(())
}

fn check_fraction(id: &str, field: &str, fraction: f64) -> Result<(), ValidationError> {
    if !(0.0..=1.0).contains(&fraction) {
        return Err(ValidationError::new(
            id,
            field,
            format!("must be within [0, 1], got {}", fraction),
        ));
    }
    Ok(())
}

// ============================================================================
// PARTIAL UPDATE
// ============================================================================

/// Partial update; `None` fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub value: Option<f64>,
    pub completion: Option<f64>,
    pub automation: Option<f64>,
}

impl EntityUpdate {
    pub fn value(value: f64) -> Self {
        EntityUpdate {
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.completion.is_none() && self.automation.is_none()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entity {
        Entity::new("acme-core", EntityCategory::Business, "worldwide", 100.0, 0.5, 0.25)
    }

    #[test]
    fn test_entity_creation() {
        let entity = sample();

        assert_eq!(entity.name, "acme-core");
        assert_eq!(entity.version, 1);
        assert_eq!(entity.potential(), 100.0);
        assert!(entity.validate().is_ok());
    }

    #[test]
    fn test_potential_value_override() {
        let entity = Entity {
            potential_value: Some(250.0),
            ..sample()
        };
        assert_eq!(entity.potential(), 250.0);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut entity = sample();
        entity.completion = 1.2;
        let err = entity.validate().unwrap_err();
        assert_eq!(err.field, "completion");

        let mut entity = sample();
        entity.value = -1.0;
        assert_eq!(entity.validate().unwrap_err().field, "value");

        let mut entity = sample();
        entity.automation = f64::NAN;
        assert_eq!(entity.validate().unwrap_err().field, "automation");
    }

    #[test]
    fn test_next_version_applies_partial_update() {
        let entity = sample();
        let next = entity
            .next_version(&EntityUpdate {
                completion: Some(0.75),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(next.version, 2);
        assert_eq!(next.completion, 0.75);
        assert_eq!(next.value, 100.0);
        assert!(next.updated_at.is_some());
        // Current version is untouched
        assert_eq!(entity.completion, 0.5);
    }

    #[test]
    fn test_next_version_rejects_negative_value() {
        let entity = sample();
        let err = entity.next_version(&EntityUpdate::value(-5.0)).unwrap_err();
        assert_eq!(err.field, "value");
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!("Business".parse::<EntityCategory>().unwrap(), EntityCategory::Business);
        assert_eq!("repo".parse::<EntityCategory>().unwrap(), EntityCategory::Repository);
        assert!("widget".parse::<EntityCategory>().is_err());
    }
}
