// End-to-end cycle properties: barrier, retries, cancellation, persistence

use assert_matches::assert_matches;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use portfolio_orchestrator::{
    Entity, EntityCategory, EntityOperation, EntityRegistry, MemoryStore, Orchestrator,
    OrchestratorConfig, OrchestratorError, Outcome, RunStatus, SnapshotQuery, SnapshotStore,
    SqliteStore,
};

// ============================================================================
// FAKES
// ============================================================================

/// Succeeds with zero delta except for ids listed as always failing
#[derive(Default)]
struct FailFor {
    failing: HashSet<String>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FailFor {
    fn new(ids: &[&str]) -> Self {
        FailFor {
            failing: ids.iter().map(|id| id.to_string()).collect(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn calls(&self, id: &str) -> usize {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EntityOperation for FailFor {
    fn name(&self) -> &str {
        "fail-for"
    }

    async fn execute(&self, entity: &Entity) -> Outcome {
        *self.calls.lock().unwrap().entry(entity.id.clone()).or_default() += 1;
        if self.failing.contains(&entity.id) {
            Outcome::failure("upstream returned 503")
        } else {
            Outcome::success(0.0)
        }
    }
}

/// First call announces itself then never finishes; counts every call
struct Blocking {
    started: Arc<Notify>,
    calls: AtomicUsize,
}

#[async_trait]
impl EntityOperation for Blocking {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn execute(&self, _entity: &Entity) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        std::future::pending::<()>().await;
        Outcome::success(0.0)
    }
}

/// Tracks the highest number of concurrent executions
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl EntityOperation for Gauge {
    fn name(&self) -> &str {
        "gauge"
    }

    async fn execute(&self, _entity: &Entity) -> Outcome {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Outcome::success(0.0)
    }
}

/// e00 gains 5.0, e01 never finishes, e02 fails and announces it, others succeed
struct Mixed {
    failed: Arc<Notify>,
}

#[async_trait]
impl EntityOperation for Mixed {
    fn name(&self) -> &str {
        "mixed"
    }

    async fn execute(&self, entity: &Entity) -> Outcome {
        match entity.id.as_str() {
            "e00" => Outcome::success(5.0),
            "e01" => {
                std::future::pending::<()>().await;
                Outcome::success(0.0)
            }
            "e02" => {
                self.failed.notify_one();
                Outcome::failure("upstream returned 503")
            }
            _ => Outcome::success(0.0),
        }
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

fn two_entities() -> Arc<EntityRegistry> {
    Arc::new(
        EntityRegistry::from_entities(vec![
            Entity::new("A", EntityCategory::Business, "main", 100.0, 1.0, 0.5),
            Entity::new("B", EntityCategory::Repository, "main", 50.0, 0.5, 1.0),
        ])
        .unwrap(),
    )
}

fn portfolio(n: usize) -> Arc<EntityRegistry> {
    let entities = (0..n)
        .map(|i| {
            Entity::new(
                &format!("e{:02}", i),
                EntityCategory::all()[i % 3],
                if i % 2 == 0 { "worldwide" } else { "labs" },
                10.0 * i as f64,
                0.5,
                0.25,
            )
        })
        .collect();
    Arc::new(EntityRegistry::from_entities(entities).unwrap())
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        backoff_base_seconds: 0.001,
        max_backoff_seconds: 0.01,
        ..Default::default()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn every_entity_ends_with_one_terminal_record() {
    let registry = portfolio(12);
    let mut config = fast_config();
    config.excluded_entity_ids.insert("e03".to_string());
    let op = Arc::new(FailFor::new(&["e05", "e07"]));
    let orchestrator = Orchestrator::new(registry.clone(), op, config).unwrap();

    let snapshot = orchestrator.run_cycle().await.unwrap();
    let records = orchestrator
        .publisher()
        .get_run_records(snapshot.cycle_id)
        .unwrap();

    assert_eq!(records.len(), registry.len());
    let ids: HashSet<&str> = records.iter().map(|r| r.entity_id.as_str()).collect();
    assert_eq!(ids.len(), registry.len());
    assert!(records.iter().all(|r| r.is_terminal()));
    assert!(records.iter().all(|r| r.cycle_id == snapshot.cycle_id));
    assert_eq!(snapshot.failure_count, 2);
    assert_eq!(snapshot.skipped_count, 1);
}

#[tokio::test]
async fn both_succeed_totals_150() {
    let orchestrator =
        Orchestrator::new(two_entities(), Arc::new(FailFor::new(&[])), fast_config()).unwrap();

    let snapshot = orchestrator.run_cycle().await.unwrap();

    assert_eq!(snapshot.total_value, 150.0);
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.overall_completion, 0.75);
    assert_eq!(snapshot.automation_level, 0.75);
}

#[tokio::test]
async fn failing_entity_is_excluded_after_all_attempts() {
    let op = Arc::new(FailFor::new(&["B"]));
    let config = OrchestratorConfig {
        max_retries: 2,
        ..fast_config()
    };
    let orchestrator = Orchestrator::new(two_entities(), op.clone(), config).unwrap();

    let snapshot = orchestrator.run_cycle().await.unwrap();

    assert_eq!(snapshot.total_value, 100.0);
    assert_eq!(snapshot.failure_count, 1);
    assert_eq!(op.calls("B"), 3);
    assert_eq!(op.calls("A"), 1);

    let records = orchestrator.publisher().get_run_records(1).unwrap();
    let b = records.iter().find(|r| r.entity_id == "B").unwrap();
    assert_eq!(b.status, RunStatus::Failed);
    assert_eq!(b.attempts, 3);
    assert_eq!(b.error.as_deref(), Some("upstream returned 503"));

    // Pending, then (Running, Failed) per attempt
    let statuses: Vec<RunStatus> = b.transitions.iter().map(|t| t.status).collect();
    assert_eq!(statuses.len(), 1 + 2 * 3);
    assert_eq!(statuses[0], RunStatus::Pending);
    assert!(statuses[1..]
        .chunks(2)
        .all(|pair| pair == [RunStatus::Running, RunStatus::Failed]));
}

#[tokio::test]
async fn unchanged_inputs_give_identical_totals() {
    let orchestrator =
        Orchestrator::new(portfolio(9), Arc::new(FailFor::new(&[])), fast_config()).unwrap();

    let first = orchestrator.run_cycle().await.unwrap();
    let second = orchestrator.run_cycle().await.unwrap();

    assert_ne!(first.cycle_id, second.cycle_id);
    assert!(first.same_totals(&second));
    assert_eq!(first.registry_fingerprint, second.registry_fingerprint);
}

#[tokio::test]
async fn concurrency_never_exceeds_limit() {
    let op = Arc::new(Gauge::default());
    let config = OrchestratorConfig {
        max_concurrency: 3,
        ..fast_config()
    };
    let orchestrator = Orchestrator::new(portfolio(15), op.clone(), config).unwrap();

    let snapshot = orchestrator.run_cycle().await.unwrap();

    assert_eq!(snapshot.failure_count, 0);
    assert!(op.peak.load(Ordering::SeqCst) <= 3);
    assert!(op.peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn cancellation_stops_dispatch() {
    let started = Arc::new(Notify::new());
    let op = Arc::new(Blocking {
        started: started.clone(),
        calls: AtomicUsize::new(0),
    });
    let config = OrchestratorConfig {
        max_concurrency: 1,
        ..fast_config()
    };
    let orchestrator = Orchestrator::new(portfolio(4), op.clone(), config).unwrap();
    let cancel = CancellationToken::new();

    let (result, _) = tokio::join!(orchestrator.run_cycle_with_cancel(cancel.clone()), async {
        started.notified().await;
        cancel.cancel();
    });

    assert_matches!(
        result,
        Err(OrchestratorError::CycleCancelled {
            cycle_id: 1,
            dispatched: 1
        })
    );
    assert_eq!(op.calls.load(Ordering::SeqCst), 1);

    let publisher = orchestrator.publisher();
    assert!(publisher.get_latest_snapshot().is_none());

    let records = publisher.get_run_records(1).unwrap();
    assert_eq!(records[0].status, RunStatus::Failed);
    assert_eq!(records[0].error.as_deref(), Some("cancelled"));
    assert!(records[1..].iter().all(|r| r.status == RunStatus::Pending));
    let settled = records.iter().filter(|r| r.status != RunStatus::Pending).count();
    assert!(settled <= 1);
}

#[tokio::test]
async fn cancellation_keeps_settled_successes() {
    let failed = Arc::new(Notify::new());
    let registry = portfolio(4);
    let config = OrchestratorConfig {
        max_concurrency: 2,
        backoff_base_seconds: 60.0,
        max_backoff_seconds: 60.0,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(
        registry.clone(),
        Arc::new(Mixed {
            failed: failed.clone(),
        }),
        config,
    )
    .unwrap();
    let cancel = CancellationToken::new();

    // e02 is dispatched only after e00 frees its slot; cancel once it sits in backoff
    let (result, _) = tokio::join!(orchestrator.run_cycle_with_cancel(cancel.clone()), async {
        failed.notified().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();
    });

    assert_matches!(
        result,
        Err(OrchestratorError::CycleCancelled {
            cycle_id: 1,
            dispatched: 3
        })
    );

    let records = orchestrator.publisher().get_run_records(1).unwrap();
    let by_id: HashMap<_, _> = records.iter().map(|r| (r.entity_id.as_str(), r)).collect();

    assert_eq!(by_id["e00"].status, RunStatus::Succeeded);
    assert_eq!(registry.get("e00").unwrap().value, 5.0);

    for id in ["e01", "e02"] {
        assert_eq!(by_id[id].status, RunStatus::Failed, "{}", id);
        assert_eq!(by_id[id].error.as_deref(), Some("cancelled"), "{}", id);
    }
    assert_eq!(by_id["e02"].attempts, 1);

    assert_eq!(by_id["e03"].status, RunStatus::Pending);
    assert_eq!(registry.get("e03").unwrap().value, 30.0);
    assert!(orchestrator.publisher().get_latest_snapshot().is_none());
}

#[tokio::test]
async fn previous_snapshot_stays_visible_after_cancelled_cycle() {
    let orchestrator =
        Orchestrator::new(two_entities(), Arc::new(FailFor::new(&[])), fast_config()).unwrap();
    orchestrator.run_cycle().await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = orchestrator.run_cycle_with_cancel(cancel).await;

    assert_matches!(result, Err(OrchestratorError::CycleCancelled { cycle_id: 2, .. }));
    let latest = orchestrator.publisher().get_latest_snapshot().unwrap();
    assert_eq!(latest.cycle_id, 1);
    assert_eq!(latest.total_value, 150.0);
}

#[tokio::test]
async fn aggregation_failure_publishes_nothing() {
    let registry = Arc::new(
        EntityRegistry::from_entities(vec![
            Entity::new("big-1", EntityCategory::Business, "main", f64::MAX, 0.5, 0.5),
            Entity::new("big-2", EntityCategory::Business, "main", f64::MAX, 0.5, 0.5),
        ])
        .unwrap(),
    );
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(registry, Arc::new(FailFor::new(&[])), fast_config())
        .unwrap()
        .with_store(store.clone())
        .unwrap();

    let result = orchestrator.run_cycle().await;

    assert_matches!(result, Err(OrchestratorError::Aggregation(_)));
    assert!(orchestrator.publisher().get_latest_snapshot().is_none());
    assert_eq!(orchestrator.publisher().get_run_records(1).unwrap().len(), 2);
    assert!(store.load_snapshot(1).unwrap().is_none());
    assert_eq!(store.events_for_cycle(1).unwrap()[0].event_type, "cycle_failed");
}

#[tokio::test]
async fn sqlite_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cycles.db");

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let orchestrator =
            Orchestrator::new(two_entities(), Arc::new(FailFor::new(&["B"])), fast_config())
                .unwrap()
                .with_store(store)
                .unwrap();
        orchestrator.run_cycle().await.unwrap();
        orchestrator.run_cycle().await.unwrap();
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    assert_eq!(store.latest_cycle_id().unwrap(), Some(2));

    let records = store.get_run_records(2).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].status, RunStatus::Failed);
    assert_eq!(records[1].attempts, 4);

    let orchestrator =
        Orchestrator::new(two_entities(), Arc::new(FailFor::new(&[])), fast_config())
            .unwrap()
            .with_store(store.clone())
            .unwrap();
    let snapshot = orchestrator.run_cycle().await.unwrap();

    assert_eq!(snapshot.cycle_id, 3);
    assert_eq!(snapshot.total_value, 150.0);
    assert_eq!(store.get_latest_snapshot().unwrap().cycle_id, 3);
}

#[tokio::test]
async fn subscribers_receive_each_published_cycle() {
    let orchestrator =
        Orchestrator::new(two_entities(), Arc::new(FailFor::new(&[])), fast_config()).unwrap();
    let mut rx = orchestrator.publisher().subscribe();

    orchestrator.run_cycle().await.unwrap();
    rx.changed().await.unwrap();
    let seen = rx.borrow_and_update().as_ref().map(|s| s.cycle_id);

    assert_eq!(seen, Some(1));
}
