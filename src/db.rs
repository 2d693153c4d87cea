// 🗄️ Snapshot Store - key-by-cycle-id persistence for snapshots and run history
//
// Two implementations of one contract:
// - MemoryStore: process-local, for tests and one-shot runs
// - SqliteStore: WAL-mode SQLite with an append-only events table

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::aggregator::AggregateSnapshot;
use crate::publisher::SnapshotQuery;
use crate::run_record::{RunRecord, RunStatus, StatusTransition};

// ============================================================================
// AUDIT EVENT
// ============================================================================

/// Event for the audit trail ("every cycle outcome is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub cycle_id: u64,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(event_type: &str, cycle_id: u64, data: serde_json::Value, actor: &str) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            cycle_id,
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// STORE CONTRACT
// ============================================================================

pub trait SnapshotStore: Send + Sync {
    fn save_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<()>;

    fn save_run_records(&self, cycle_id: u64, records: &[RunRecord]) -> Result<()>;

    fn load_snapshot(&self, cycle_id: u64) -> Result<Option<AggregateSnapshot>>;

    fn load_run_records(&self, cycle_id: u64) -> Result<Vec<RunRecord>>;

    /// Most recent snapshot by cycle id
    fn latest_snapshot(&self) -> Result<Option<AggregateSnapshot>>;

    /// Highest cycle id seen in either snapshots or run records
    fn latest_cycle_id(&self) -> Result<Option<u64>>;

    fn record_event(&self, event: &Event) -> Result<()>;

    fn events_for_cycle(&self, cycle_id: u64) -> Result<Vec<Event>>;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Default)]
struct MemoryState {
    snapshots: BTreeMap<u64, AggregateSnapshot>,
    runs: BTreeMap<u64, Vec<RunRecord>>,
    events: Vec<Event>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SnapshotStore for MemoryStore {
    fn save_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<()> {
        self.lock()
            .snapshots
            .insert(snapshot.cycle_id, snapshot.clone());
        Ok(())
    }

    fn save_run_records(&self, cycle_id: u64, records: &[RunRecord]) -> Result<()> {
        self.lock().runs.insert(cycle_id, records.to_vec());
        Ok(())
    }

    fn load_snapshot(&self, cycle_id: u64) -> Result<Option<AggregateSnapshot>> {
        Ok(self.lock().snapshots.get(&cycle_id).cloned())
    }

    fn load_run_records(&self, cycle_id: u64) -> Result<Vec<RunRecord>> {
        Ok(self.lock().runs.get(&cycle_id).cloned().unwrap_or_default())
    }

    fn latest_snapshot(&self) -> Result<Option<AggregateSnapshot>> {
        Ok(self.lock().snapshots.values().next_back().cloned())
    }

    fn latest_cycle_id(&self) -> Result<Option<u64>> {
        let state = self.lock();
        let snapshot_max = state.snapshots.keys().next_back().copied();
        let runs_max = state.runs.keys().next_back().copied();
        Ok(snapshot_max.max(runs_max))
    }

    fn record_event(&self, event: &Event) -> Result<()> {
        self.lock().events.push(event.clone());
        Ok(())
    }

    fn events_for_cycle(&self, cycle_id: u64) -> Result<Vec<Event>> {
        Ok(self
            .lock()
            .events
            .iter()
            .filter(|e| e.cycle_id == cycle_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// SQLITE STORE
// ============================================================================

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cycle ids with a stored snapshot, newest first
    pub fn list_cycles(&self, limit: usize) -> Result<Vec<u64>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT cycle_id FROM snapshots ORDER BY cycle_id DESC LIMIT ?1")?;
        let ids = stmt
            .query_map(params![limit as i64], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(|id| id as u64).collect())
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS snapshots (
            cycle_id INTEGER PRIMARY KEY,
            generated_at TEXT NOT NULL,
            total_value REAL NOT NULL,
            failure_count INTEGER NOT NULL,
            snapshot TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS run_records (
            cycle_id INTEGER NOT NULL,
            position INTEGER NOT NULL,
            entity_id TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            error TEXT,
            timestamp TEXT NOT NULL,
            transitions TEXT NOT NULL,
            PRIMARY KEY (cycle_id, entity_id)
        )",
        [],
    )?;

    // Audit trail (append-only)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            cycle_id INTEGER NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_cycle ON events(cycle_id)",
        [],
    )?;

    Ok(())
}

fn parse_timestamp(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl SnapshotStore for SqliteStore {
    fn save_snapshot(&self, snapshot: &AggregateSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO snapshots (
                    cycle_id, generated_at, total_value, failure_count, snapshot
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    snapshot.cycle_id as i64,
                    snapshot.generated_at.to_rfc3339(),
                    snapshot.total_value,
                    snapshot.failure_count as i64,
                    json,
                ],
            )
            .with_context(|| format!("Failed to save snapshot for cycle {}", snapshot.cycle_id))?;
        Ok(())
    }

    fn save_run_records(&self, cycle_id: u64, records: &[RunRecord]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        // Records are replaced as a whole for a cycle
        tx.execute(
            "DELETE FROM run_records WHERE cycle_id = ?1",
            params![cycle_id as i64],
        )?;

        for (position, record) in records.iter().enumerate() {
            let transitions = serde_json::to_string(&record.transitions)?;
            tx.execute(
                "INSERT INTO run_records (
                    cycle_id, position, entity_id, status, attempts, error, timestamp, transitions
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    cycle_id as i64,
                    position as i64,
                    record.entity_id,
                    record.status.as_str(),
                    record.attempts,
                    record.error,
                    record.timestamp.to_rfc3339(),
                    transitions,
                ],
            )?;
        }

        tx.commit()
            .with_context(|| format!("Failed to save run records for cycle {}", cycle_id))?;
        Ok(())
    }

    fn load_snapshot(&self, cycle_id: u64) -> Result<Option<AggregateSnapshot>> {
        let conn = self.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM snapshots WHERE cycle_id = ?1",
                params![cycle_id as i64],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|raw| serde_json::from_str(&raw).context("Failed to deserialize snapshot"))
            .transpose()
    }

    fn load_run_records(&self, cycle_id: u64) -> Result<Vec<RunRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT entity_id, status, attempts, error, timestamp, transitions
             FROM run_records
             WHERE cycle_id = ?1
             ORDER BY position",
        )?;

        let records = stmt
            .query_map(params![cycle_id as i64], |row| {
                let status_str: String = row.get(1)?;
                let timestamp_str: String = row.get(4)?;
                let transitions_json: String = row.get(5)?;

                let status = RunStatus::parse(&status_str).ok_or_else(|| {
                    rusqlite::Error::InvalidColumnType(
                        1,
                        status_str.clone(),
                        rusqlite::types::Type::Text,
                    )
                })?;
                let transitions: Vec<StatusTransition> = parse_json(&transitions_json)?;

                Ok(RunRecord {
                    entity_id: row.get(0)?,
                    cycle_id,
                    status,
                    attempts: row.get(2)?,
                    error: row.get(3)?,
                    timestamp: parse_timestamp(&timestamp_str)?,
                    transitions,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn latest_snapshot(&self) -> Result<Option<AggregateSnapshot>> {
        let latest: Option<i64> = self
            .lock()
            .query_row("SELECT MAX(cycle_id) FROM snapshots", [], |row| row.get(0))?;
        match latest {
            Some(cycle_id) => self.load_snapshot(cycle_id as u64),
            None => Ok(None),
        }
    }

    fn latest_cycle_id(&self) -> Result<Option<u64>> {
        let latest: Option<i64> = self.lock().query_row(
            "SELECT MAX(cycle_id) FROM (
                SELECT cycle_id FROM snapshots
                UNION ALL
                SELECT cycle_id FROM run_records
            )",
            [],
            |row| row.get(0),
        )?;
        Ok(latest.map(|id| id as u64))
    }

    fn record_event(&self, event: &Event) -> Result<()> {
        let data_json = serde_json::to_string(&event.data)?;

        self.lock().execute(
            "INSERT INTO events (
                event_id, timestamp, event_type, cycle_id, data, actor
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.cycle_id as i64,
                data_json,
                event.actor,
            ],
        )?;

        Ok(())
    }

    fn events_for_cycle(&self, cycle_id: u64) -> Result<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT event_id, timestamp, event_type, data, actor
             FROM events
             WHERE cycle_id = ?1
             ORDER BY id",
        )?;

        let events = stmt
            .query_map(params![cycle_id as i64], |row| {
                let timestamp_str: String = row.get(1)?;
                let data_json: String = row.get(3)?;

                Ok(Event {
                    event_id: row.get(0)?,
                    timestamp: parse_timestamp(&timestamp_str)?,
                    event_type: row.get(2)?,
                    cycle_id,
                    data: parse_json(&data_json)?,
                    actor: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }
}

impl SnapshotQuery for SqliteStore {
    fn get_latest_snapshot(&self) -> Option<AggregateSnapshot> {
        self.latest_snapshot().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read latest snapshot");
            None
        })
    }

    fn get_run_records(&self, cycle_id: u64) -> Option<Vec<RunRecord>> {
        match self.load_run_records(cycle_id) {
            Ok(records) if records.is_empty() => None,
            Ok(records) => Some(records),
            Err(e) => {
                tracing::warn!(cycle_id, error = %e, "Failed to read run records");
                None
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
