// 📚 Entity Registry - canonical ordered set of tracked entities
//
// Single source of truth for entity identity. Reads are concurrent (RwLock),
// writes are serialized and validated before anything is swapped in.
// Superseded versions are kept append-only for history queries.

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::entity::{Entity, EntityCategory, EntityUpdate};
use crate::error::{OrchestratorError, OrchestratorResult, ValidationError};

struct RegistryState {
    /// Current versions, in load order
    entities: Vec<Entity>,

    /// id → position in `entities`
    index: HashMap<String, usize>,

    /// Superseded versions (append-only, never delete)
    history: Vec<Entity>,
}

/// Registry of all tracked entities
pub struct EntityRegistry {
    /// Fixed set of owning accounts
    accounts: BTreeSet<String>,
    state: RwLock<RegistryState>,
}

impl EntityRegistry {
    /// Build a registry over a fixed account set
    ///
    /// Fails on duplicate ids, unknown accounts, or out-of-range fields.
    pub fn new<I, S>(accounts: I, entities: Vec<Entity>) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let accounts: BTreeSet<String> = accounts.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(entities.len());

        for (pos, entity) in entities.iter().enumerate() {
            entity.validate()?;

            if !accounts.contains(&entity.account) {
                return Err(ValidationError::new(
                    &entity.id,
                    "account",
                    format!("unknown owning account: {}", entity.account),
                ));
            }

            if index.insert(entity.id.clone(), pos).is_some() {
                return Err(ValidationError::new(&entity.id, "id", "duplicate entity id"));
            }
        }

        Ok(EntityRegistry {
            accounts,
            state: RwLock::new(RegistryState {
                entities,
                index,
                history: Vec::new(),
            }),
        })
    }

    /// Build a registry whose account set is whatever the entities reference
    pub fn from_entities(entities: Vec<Entity>) -> Result<Self, ValidationError> {
        let accounts: BTreeSet<String> = entities.iter().map(|e| e.account.clone()).collect();
        Self::new(accounts, entities)
    }

    /// Load a registry file (`.csv` or `.json`)
    ///
    /// An empty `accounts` slice derives the account set from the entities.
    pub fn from_path(path: &Path, accounts: &[String]) -> OrchestratorResult<Self> {
        let entities =
            load_entities(path).map_err(|e| OrchestratorError::Load(format!("{e:#}")))?;
        let registry = if accounts.is_empty() {
            Self::from_entities(entities)?
        } else {
            Self::new(accounts.iter().cloned(), entities)?
        };
        Ok(registry)
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Ordered snapshot of every current entity
    pub fn load(&self) -> Vec<Entity> {
        self.read().entities.clone()
    }

    pub fn get(&self, id: &str) -> OrchestratorResult<Entity> {
        let state = self.read();
        state
            .index
            .get(id)
            .map(|&pos| state.entities[pos].clone())
            .ok_or_else(|| OrchestratorError::not_found(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn accounts(&self) -> &BTreeSet<String> {
        &self.accounts
    }

    pub fn by_account(&self, account: &str) -> Vec<Entity> {
        self.read()
            .entities
            .iter()
            .filter(|e| e.account == account)
            .cloned()
            .collect()
    }

    pub fn by_category(&self, category: EntityCategory) -> Vec<Entity> {
        self.read()
            .entities
            .iter()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    /// All versions of an entity, oldest first, current last
    pub fn get_all_versions(&self, id: &str) -> Vec<Entity> {
        let state = self.read();
        let mut versions: Vec<Entity> = state
            .history
            .iter()
            .filter(|e| e.id == id)
            .cloned()
            .collect();
        if let Some(&pos) = state.index.get(id) {
            versions.push(state.entities[pos].clone());
        }
        versions
    }

    // ========================================================================
    // WRITES (orchestrator coordinating path only)
    // ========================================================================

    /// Apply a partial update
    ///
    /// Rejected updates leave the entity unchanged.
    pub fn update(&self, id: &str, update: &EntityUpdate) -> OrchestratorResult<Entity> {
        let mut state = self.write();
        let pos = *state
            .index
            .get(id)
            .ok_or_else(|| OrchestratorError::not_found(id))?;

        if update.is_empty() {
            return Ok(state.entities[pos].clone());
        }

        let next = state.entities[pos].next_version(update)?;
        let previous = std::mem::replace(&mut state.entities[pos], next.clone());
        state.history.push(previous);

        Ok(next)
    }
}

// ============================================================================
// LOADING
// ============================================================================

/// Load entities from a CSV file with header
/// `id,name,category,account,value,potential_value,completion,automation`
pub fn load_entities_csv(path: &Path) -> Result<Vec<Entity>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open registry CSV {}", path.display()))?;

    let mut entities = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let mut entity: Entity =
            result.with_context(|| format!("Failed to deserialize entity on row {}", line + 1))?;
        if entity.name.is_empty() {
            entity.name = entity.id.clone();
        }
        entities.push(entity);
    }

    Ok(entities)
}

/// Load entities from a JSON array
pub fn load_entities_json(path: &Path) -> Result<Vec<Entity>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read registry JSON {}", path.display()))?;
    let mut entities: Vec<Entity> =
        serde_json::from_str(&raw).context("Failed to deserialize entity list")?;
    for entity in &mut entities {
        if entity.name.is_empty() {
            entity.name = entity.id.clone();
        }
    }
    Ok(entities)
}

/// Pick the loader by file extension (`.json`, anything else is CSV)
pub fn load_entities(path: &Path) -> Result<Vec<Entity>> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => load_entities_json(path),
        _ => load_entities_csv(path),
    }
}

// ============================================================================
// TESTS
// ============================================================================
