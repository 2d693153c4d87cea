// 🎛️ Execution Orchestrator - one cycle = one pass over every entity
//
// Dispatch in registry order under a semaphore (max in-flight operations),
// retry failures with exponential backoff, join on every worker, then
// aggregate and publish. The coordinating task is the only writer of run
// records and of the registry; workers read a cloned entity and report back.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::aggregator::{AggregateSnapshot, MetricAggregator};
use crate::config::OrchestratorConfig;
use crate::db::{Event, SnapshotStore};
use crate::entities::{Entity, EntityRegistry, EntityUpdate};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::operations::{EntityOperation, Outcome};
use crate::publisher::SnapshotPublisher;
use crate::retry::RetryPolicy;
use crate::run_record::{CycleLedger, RunRecord, RunStatus};

const ACTOR: &str = "orchestrator";

/// Error detail recorded for operations stopped by cycle cancellation
pub const CANCELLED_DETAIL: &str = "cancelled";

// ============================================================================
// WORKER PROTOCOL
// ============================================================================

/// Intermediate transitions reported while a worker is still retrying
#[derive(Debug)]
enum WorkerEvent {
    AttemptFailed {
        entity_id: String,
        attempt: u32,
        detail: String,
    },
    Retrying {
        entity_id: String,
        attempt: u32,
    },
}

#[derive(Debug)]
enum WorkerOutcome {
    Succeeded(Outcome),
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
struct WorkerReport {
    entity_id: String,
    attempts: u32,
    outcome: WorkerOutcome,
}

/// Aborts the wrapped task when dropped, so cancelled attempts stop running
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct Orchestrator {
    registry: Arc<EntityRegistry>,
    operation: Arc<dyn EntityOperation>,
    config: OrchestratorConfig,
    retry: RetryPolicy,
    aggregator: MetricAggregator,
    publisher: Arc<SnapshotPublisher>,
    store: Option<Arc<dyn SnapshotStore>>,
    next_cycle: AtomicU64,
    /// One cycle at a time
    cycle_guard: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<EntityRegistry>,
        operation: Arc<dyn EntityOperation>,
        config: OrchestratorConfig,
    ) -> OrchestratorResult<Self> {
        config.validate()?;

        Ok(Orchestrator {
            registry,
            operation,
            retry: RetryPolicy::from_config(&config),
            publisher: Arc::new(SnapshotPublisher::new(config.history_limit)),
            config,
            aggregator: MetricAggregator::new(),
            store: None,
            next_cycle: AtomicU64::new(1),
            cycle_guard: tokio::sync::Mutex::new(()),
        })
    }

    /// Persist every cycle to `store` and continue numbering after its latest cycle
    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> OrchestratorResult<Self> {
        let latest = store.latest_cycle_id().map_err(OrchestratorError::store)?;
        if let Some(latest) = latest {
            self.next_cycle = AtomicU64::new(latest + 1);
        }
        if let Some(snapshot) = store.latest_snapshot().map_err(OrchestratorError::store)? {
            let records = store
                .load_run_records(snapshot.cycle_id)
                .map_err(OrchestratorError::store)?;
            self.publisher.publish(snapshot, records);
        }
        self.store = Some(store);
        Ok(self)
    }

    pub fn publisher(&self) -> Arc<SnapshotPublisher> {
        self.publisher.clone()
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Id the next cycle will get
    pub fn next_cycle_id(&self) -> u64 {
        self.next_cycle.load(Ordering::SeqCst)
    }

    pub async fn run_cycle(&self) -> OrchestratorResult<AggregateSnapshot> {
        self.run_cycle_with_cancel(CancellationToken::new()).await
    }

    /// Run one cycle; cancelling `cancel` stops dispatch and fails in-flight work
    pub async fn run_cycle_with_cancel(
        &self,
        cancel: CancellationToken,
    ) -> OrchestratorResult<AggregateSnapshot> {
        let _guard = self.cycle_guard.lock().await;
        let cycle_id = self.next_cycle.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            cycle_id,
            entities = self.registry.len(),
            max_concurrency = self.config.max_concurrency,
            max_attempts = self.retry.max_attempts(),
            "Cycle started"
        );

        let (ledger, dispatched, cancelled) = self.dispatch_all(cycle_id, &cancel).await;

        if cancelled {
            tracing::warn!(cycle_id, dispatched, "Cycle cancelled");
            self.finish_without_snapshot(
                &ledger,
                "cycle_cancelled",
                serde_json::json!({ "dispatched": dispatched }),
            );
            return Err(OrchestratorError::CycleCancelled {
                cycle_id,
                dispatched,
            });
        }

        let entities = self.registry.load();
        let aggregated =
            self.aggregator
                .aggregate(cycle_id, &entities, ledger.records(), Utc::now());
        let snapshot = match aggregated {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(cycle_id, error = %e, "Aggregation failed, snapshot not published");
                self.finish_without_snapshot(
                    &ledger,
                    "cycle_failed",
                    serde_json::json!({ "error": e.to_string() }),
                );
                return Err(e.into());
            }
        };

        let records = ledger.into_records();
        self.persist(&snapshot, &records)?;
        self.publisher.publish(snapshot.clone(), records);

        tracing::info!(
            cycle_id,
            total_value = snapshot.total_value,
            failures = snapshot.failure_count,
            skipped = snapshot.skipped_count,
            "Cycle completed"
        );

        Ok(snapshot)
    }

    /// Run cycles back to back, `cycle_interval_seconds` apart, until cancelled
    ///
    /// Aggregation failures are logged and the loop continues; the previous
    /// snapshot stays authoritative. Returns the number of published cycles.
    pub async fn run_periodically(
        &self,
        cancel: CancellationToken,
        max_cycles: Option<usize>,
    ) -> OrchestratorResult<usize> {
        let interval = self.config.cycle_interval();
        let mut published = 0usize;
        let mut attempted = 0usize;

        loop {
            if cancel.is_cancelled() || max_cycles.is_some_and(|max| attempted >= max) {
                break;
            }
            attempted += 1;

            match self.run_cycle_with_cancel(cancel.child_token()).await {
                Ok(snapshot) => {
                    published += 1;
                    tracing::info!(cycle_id = snapshot.cycle_id, "{}", snapshot.summary());
                }
                Err(OrchestratorError::CycleCancelled { .. }) => break,
                Err(OrchestratorError::Aggregation(e)) => {
                    tracing::error!(error = %e, "Cycle produced no snapshot");
                }
                Err(e) => return Err(e),
            }

            if max_cycles.is_some_and(|max| attempted >= max) {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        Ok(published)
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    /// Dispatch every entity and wait for all workers (the barrier)
    ///
    /// Returns the ledger, the number of dispatched entities and whether the
    /// cycle was interrupted: dispatch stopped early or a worker was cut short.
    /// A token that fires after every worker settled interrupts nothing.
    async fn dispatch_all(
        &self,
        cycle_id: u64,
        cancel: &CancellationToken,
    ) -> (CycleLedger, usize, bool) {
        let entities = self.registry.load();
        let mut ledger = CycleLedger::new(cycle_id, entities.iter().map(|e| e.id.as_str()));

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut workers: JoinSet<WorkerReport> = JoinSet::new();
        let mut dispatched = 0usize;
        let mut cancelled = false;
        let mut interrupted = false;

        let mut queue = entities.into_iter();
        let mut next = queue.next();

        while let Some(entity) = next.take() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            if self.config.is_excluded(&entity.id) {
                tracing::debug!(cycle_id, entity_id = %entity.id, "Entity excluded, skipping");
                apply(&mut ledger, &entity.id, RunStatus::Skipped, None);
                next = queue.next();
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    drain_events(&mut ledger, &mut events_rx);
                    interrupted |= self.settle(&mut ledger, joined);
                    next = Some(entity);
                }
                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else {
                        cancelled = true;
                        break;
                    };
                    apply(&mut ledger, &entity.id, RunStatus::Running, None);
                    dispatched += 1;
                    tracing::debug!(cycle_id, entity_id = %entity.id, "Dispatching operation");

                    workers.spawn(run_entity(
                        entity,
                        self.operation.clone(),
                        self.retry.clone(),
                        self.config.operation_timeout(),
                        cancel.clone(),
                        events_tx.clone(),
                        permit,
                    ));
                    next = queue.next();
                }
            }
        }
        drop(events_tx);

        while let Some(joined) = workers.join_next().await {
            drain_events(&mut ledger, &mut events_rx);
            interrupted |= self.settle(&mut ledger, joined);
        }
        drain_events(&mut ledger, &mut events_rx);

        // A worker that died without reporting leaves its record Running
        for entity_id in ledger.ids_with_status(RunStatus::Running) {
            tracing::error!(cycle_id, entity_id = %entity_id, "Worker ended without a report");
            fail(&mut ledger, &entity_id, "worker terminated unexpectedly".to_string());
        }

        (ledger, dispatched, cancelled || interrupted)
    }

    /// Record a worker's final outcome, applying metric changes on success
    ///
    /// Returns true when the worker stopped because of cancellation.
    fn settle(
        &self,
        ledger: &mut CycleLedger,
        joined: Result<WorkerReport, tokio::task::JoinError>,
    ) -> bool {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Worker task failed to join");
                return false;
            }
        };
        let cycle_id = ledger.cycle_id();

        match report.outcome {
            WorkerOutcome::Succeeded(outcome) => match self.apply_outcome(&report.entity_id, &outcome)
            {
                Ok(()) => apply(ledger, &report.entity_id, RunStatus::Succeeded, None),
                Err(e) => {
                    tracing::warn!(
                        cycle_id,
                        entity_id = %report.entity_id,
                        error = %e,
                        "Operation result rejected by registry"
                    );
                    fail(ledger, &report.entity_id, format!("rejected update: {}", e));
                }
            },
            WorkerOutcome::Failed(detail) => {
                let failure = OrchestratorError::OperationFailure {
                    entity_id: report.entity_id.clone(),
                    detail: detail.clone(),
                };
                tracing::warn!(
                    cycle_id,
                    attempts = report.attempts,
                    error = %failure,
                    "Entity terminally failed for this cycle"
                );
                fail(ledger, &report.entity_id, detail);
            }
            WorkerOutcome::Cancelled => {
                fail(ledger, &report.entity_id, CANCELLED_DETAIL.to_string());
                return true;
            }
        }
        false
    }

    /// Single-writer path into the registry
    fn apply_outcome(&self, entity_id: &str, outcome: &Outcome) -> OrchestratorResult<()> {
        if !outcome.changes_entity() {
            return Ok(());
        }

        let current = self.registry.get(entity_id)?;
        let update = EntityUpdate {
            value: (outcome.value_delta != 0.0).then(|| current.value + outcome.value_delta),
            completion: outcome.completion,
            automation: outcome.automation,
        };
        self.registry.update(entity_id, &update)?;
        Ok(())
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    fn persist(&self, snapshot: &AggregateSnapshot, records: &[RunRecord]) -> OrchestratorResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        store
            .save_run_records(snapshot.cycle_id, records)
            .and_then(|_| store.save_snapshot(snapshot))
            .map_err(OrchestratorError::store)?;

        let event = Event::new(
            "cycle_completed",
            snapshot.cycle_id,
            serde_json::json!({
                "total_value": snapshot.total_value,
                "failure_count": snapshot.failure_count,
                "skipped_count": snapshot.skipped_count,
            }),
            ACTOR,
        );
        if let Err(e) = store.record_event(&event) {
            tracing::warn!(cycle_id = snapshot.cycle_id, error = %e, "Failed to record audit event");
        }
        Ok(())
    }

    /// Keep the run records of a cycle that produced no snapshot
    fn finish_without_snapshot(
        &self,
        ledger: &CycleLedger,
        event_type: &str,
        data: serde_json::Value,
    ) {
        let cycle_id = ledger.cycle_id();
        let records = ledger.records().to_vec();

        if let Some(store) = &self.store {
            if let Err(e) = store.save_run_records(cycle_id, &records) {
                tracing::warn!(cycle_id, error = %e, "Failed to persist run records");
            }
            if let Err(e) = store.record_event(&Event::new(event_type, cycle_id, data, ACTOR)) {
                tracing::warn!(cycle_id, error = %e, "Failed to record audit event");
            }
        }

        self.publisher.record_runs(cycle_id, records);
    }
}

// ============================================================================
// LEDGER HELPERS
// ============================================================================

fn apply(ledger: &mut CycleLedger, entity_id: &str, status: RunStatus, detail: Option<String>) {
    if let Err(e) = ledger.transition(entity_id, status, detail) {
        tracing::error!(error = %e, "Run record transition rejected");
    }
}

fn fail(ledger: &mut CycleLedger, entity_id: &str, detail: String) {
    if let Err(e) = ledger.fail(entity_id, detail) {
        tracing::error!(error = %e, "Run record transition rejected");
    }
}

fn drain_events(ledger: &mut CycleLedger, events: &mut mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            WorkerEvent::AttemptFailed {
                entity_id,
                attempt,
                detail,
            } => {
                tracing::debug!(entity_id = %entity_id, attempt, error = %detail, "Attempt failed");
                apply(ledger, &entity_id, RunStatus::Failed, Some(detail));
            }
            WorkerEvent::Retrying { entity_id, attempt } => {
                tracing::debug!(entity_id = %entity_id, attempt, "Retrying");
                apply(ledger, &entity_id, RunStatus::Running, None);
            }
        }
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Run one entity's operation with retries; holds its permit until done
async fn run_entity(
    entity: Entity,
    operation: Arc<dyn EntityOperation>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<WorkerEvent>,
    _permit: OwnedSemaphorePermit,
) -> WorkerReport {
    let entity = Arc::new(entity);
    let entity_id = entity.id.clone();
    let mut delays = retry.delays();
    let mut attempt = 1u32;

    loop {
        // A finished attempt wins over a cancel that arrives at the same time
        let result = tokio::select! {
            biased;
            result = attempt_once(operation.clone(), entity.clone(), timeout) => Some(result),
            _ = cancel.cancelled() => None,
        };

        let detail = match result {
            None => {
                return WorkerReport {
                    entity_id,
                    attempts: attempt,
                    outcome: WorkerOutcome::Cancelled,
                }
            }
            Some(Ok(outcome)) => {
                return WorkerReport {
                    entity_id,
                    attempts: attempt,
                    outcome: WorkerOutcome::Succeeded(outcome),
                }
            }
            Some(Err(detail)) => detail,
        };

        let Some(delay) = delays.next() else {
            return WorkerReport {
                entity_id,
                attempts: attempt,
                outcome: WorkerOutcome::Failed(detail),
            };
        };

        tracing::warn!(
            entity_id = %entity_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %detail,
            "Operation attempt failed, backing off"
        );
        let _ = events.send(WorkerEvent::AttemptFailed {
            entity_id: entity_id.clone(),
            attempt,
            detail,
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return WorkerReport {
                    entity_id,
                    attempts: attempt,
                    outcome: WorkerOutcome::Cancelled,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        let _ = events.send(WorkerEvent::Retrying {
            entity_id: entity_id.clone(),
            attempt,
        });
    }
}

/// One attempt in its own task, so panics and timeouts become failures
async fn attempt_once(
    operation: Arc<dyn EntityOperation>,
    entity: Arc<Entity>,
    timeout: Option<Duration>,
) -> Result<Outcome, String> {
    let mut task = AbortOnDrop(tokio::spawn(async move {
        operation.execute(&entity).await
    }));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task.0).await {
            Ok(joined) => joined,
            Err(_) => {
                return Err(format!(
                    "timed out after {:.3}s",
                    limit.as_secs_f64()
                ))
            }
        },
        None => (&mut task.0).await,
    };

    match joined {
        Ok(outcome) if outcome.success => Ok(outcome),
        Ok(outcome) => Err(outcome
            .error
            .unwrap_or_else(|| "operation reported failure".to_string())),
        Err(e) if e.is_panic() => Err("operation panicked".to_string()),
        Err(e) => Err(format!("operation aborted: {}", e)),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::entities::EntityCategory;
    use crate::publisher::SnapshotQuery;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted operation: per-entity queue of outcomes, default success(0)
    #[derive(Default)]
    struct Scripted {
        scripts: Mutex<HashMap<String, Vec<Outcome>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn script(self, id: &str, outcomes: Vec<Outcome>) -> Self {
            self.scripts.lock().unwrap().insert(id.to_string(), outcomes);
            self
        }

        fn calls_for(&self, id: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == id).count()
        }
    }

    #[async_trait]
    impl EntityOperation for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, entity: &Entity) -> Outcome {
            self.calls.lock().unwrap().push(entity.id.clone());
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&entity.id) {
                Some(queue) if queue.len() > 1 => queue.remove(0),
                Some(queue) => queue.first().cloned().unwrap_or(Outcome::success(0.0)),
                None => Outcome::success(0.0),
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl EntityOperation for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn execute(&self, _entity: &Entity) -> Outcome {
            panic!("integration bug");
        }
    }

    fn registry() -> Arc<EntityRegistry> {
        Arc::new(
            EntityRegistry::from_entities(vec![
                Entity::new("A", EntityCategory::Business, "main", 100.0, 0.5, 0.5),
                Entity::new("B", EntityCategory::Repository, "main", 50.0, 0.5, 0.5),
            ])
            .unwrap(),
        )
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            backoff_base_seconds: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_value_delta_applied_through_registry() {
        let op = Arc::new(Scripted::default().script("A", vec![Outcome::success(25.0)]));
        let orchestrator = Orchestrator::new(registry(), op, fast_config()).unwrap();

        let snapshot = orchestrator.run_cycle().await.unwrap();

        assert_eq!(snapshot.total_value, 175.0);
        let a = orchestrator.registry().get("A").unwrap();
        assert_eq!(a.value, 125.0);
        assert_eq!(a.version, 2);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let op = Arc::new(Scripted::default().script(
            "B",
            vec![Outcome::failure("flaky"), Outcome::success(0.0)],
        ));
        let orchestrator = Orchestrator::new(registry(), op.clone(), fast_config()).unwrap();

        let snapshot = orchestrator.run_cycle().await.unwrap();
        let records = orchestrator
            .publisher()
            .get_run_records(snapshot.cycle_id)
            .unwrap();
        let b = records.iter().find(|r| r.entity_id == "B").unwrap();

        assert_eq!(b.status, RunStatus::Succeeded);
        assert_eq!(b.attempts, 2);
        assert_eq!(op.calls_for("B"), 2);
        let statuses: Vec<RunStatus> = b.transitions.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Failed,
                RunStatus::Running,
                RunStatus::Succeeded
            ]
        );
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test]
    async fn test_rejected_update_fails_entity_without_retry() {
        let op = Arc::new(Scripted::default().script("B", vec![Outcome::success(-80.0)]));
        let orchestrator = Orchestrator::new(registry(), op.clone(), fast_config()).unwrap();

        let snapshot = orchestrator.run_cycle().await.unwrap();

        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.total_value, 100.0);
        assert_eq!(orchestrator.registry().get("B").unwrap().value, 50.0);
        assert_eq!(op.calls_for("B"), 1);
        let records = orchestrator.publisher().get_run_records(1).unwrap();
        assert!(records[1].error.as_deref().unwrap().starts_with("rejected update"));
    }

    #[tokio::test]
    async fn test_excluded_entities_are_skipped() {
        let op = Arc::new(Scripted::default());
        let mut config = fast_config();
        config.excluded_entity_ids.insert("B".to_string());
        let orchestrator = Orchestrator::new(registry(), op.clone(), config).unwrap();

        let snapshot = orchestrator.run_cycle().await.unwrap();

        assert_eq!(op.calls_for("B"), 0);
        assert_eq!(snapshot.skipped_count, 1);
        assert_eq!(snapshot.total_value, 150.0);
        let records = orchestrator.publisher().get_run_records(1).unwrap();
        assert_eq!(records[1].status, RunStatus::Skipped);
        assert_eq!(records[1].attempts, 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        struct Slow;

        #[async_trait]
        impl EntityOperation for Slow {
            fn name(&self) -> &str {
                "slow"
            }

            async fn execute(&self, _entity: &Entity) -> Outcome {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Outcome::success(0.0)
            }
        }

        let config = OrchestratorConfig {
            max_retries: 0,
            operation_timeout_seconds: Some(0.01),
            ..fast_config()
        };
        let orchestrator = Orchestrator::new(registry(), Arc::new(Slow), config).unwrap();

        let snapshot = orchestrator.run_cycle().await.unwrap();

        assert_eq!(snapshot.failure_count, 2);
        let records = orchestrator.publisher().get_run_records(1).unwrap();
        assert!(records[0].error.as_deref().unwrap().starts_with("timed out"));
    }

    #[tokio::test]
    async fn test_panicking_operation_is_contained() {
        let config = OrchestratorConfig {
            max_retries: 1,
            ..fast_config()
        };
        let orchestrator = Orchestrator::new(registry(), Arc::new(Panicking), config).unwrap();

        let snapshot = orchestrator.run_cycle().await.unwrap();

        assert_eq!(snapshot.failure_count, 2);
        let records = orchestrator.publisher().get_run_records(1).unwrap();
        assert!(records.iter().all(|r| r.attempts == 2));
        assert_eq!(records[0].error.as_deref(), Some("operation panicked"));
    }

    #[tokio::test]
    async fn test_cycle_ids_are_monotonic() {
        let orchestrator =
            Orchestrator::new(registry(), Arc::new(Scripted::default()), fast_config()).unwrap();

        let first = orchestrator.run_cycle().await.unwrap();
        let second = orchestrator.run_cycle().await.unwrap();

        assert_eq!(first.cycle_id, 1);
        assert_eq!(second.cycle_id, 2);
        assert_eq!(orchestrator.next_cycle_id(), 3);
    }

    #[tokio::test]
    async fn test_store_resumes_numbering_and_persists() {
        let store = Arc::new(MemoryStore::new());
        {
            let orchestrator =
                Orchestrator::new(registry(), Arc::new(Scripted::default()), fast_config())
                    .unwrap()
                    .with_store(store.clone())
                    .unwrap();
            orchestrator.run_cycle().await.unwrap();
        }

        let orchestrator = Orchestrator::new(registry(), Arc::new(Scripted::default()), fast_config())
            .unwrap()
            .with_store(store.clone())
            .unwrap();

        // Previous snapshot is visible before the first new cycle
        assert_eq!(
            orchestrator.publisher().get_latest_snapshot().unwrap().cycle_id,
            1
        );

        let snapshot = orchestrator.run_cycle().await.unwrap();
        assert_eq!(snapshot.cycle_id, 2);
        assert!(store.load_snapshot(2).unwrap().is_some());
        assert_eq!(store.load_run_records(2).unwrap().len(), 2);
        assert_eq!(store.events_for_cycle(2).unwrap()[0].event_type, "cycle_completed");
    }

    #[tokio::test]
    async fn test_run_periodically_stops_after_max_cycles() {
        let config = OrchestratorConfig {
            cycle_interval_seconds: 0.0,
            ..fast_config()
        };
        let orchestrator =
            Orchestrator::new(registry(), Arc::new(Scripted::default()), config).unwrap();

        let published = orchestrator
            .run_periodically(CancellationToken::new(), Some(3))
            .await
            .unwrap();

        assert_eq!(published, 3);
        assert_eq!(orchestrator.publisher().latest_cycle_id(), Some(3));
    }

    #[tokio::test]
    async fn test_cancel_after_every_worker_settled_still_publishes() {
        /// Fires the cycle token from inside the last entity's operation
        struct CancelOnLast {
            last: String,
            token: CancellationToken,
        }

        #[async_trait]
        impl EntityOperation for CancelOnLast {
            fn name(&self) -> &str {
                "cancel-on-last"
            }

            async fn execute(&self, entity: &Entity) -> Outcome {
                if entity.id == self.last {
                    self.token.cancel();
                }
                Outcome::success(0.0)
            }
        }

        let token = CancellationToken::new();
        let op = Arc::new(CancelOnLast {
            last: "B".to_string(),
            token: token.clone(),
        });
        let config = OrchestratorConfig {
            max_concurrency: 1,
            ..fast_config()
        };
        let orchestrator = Orchestrator::new(registry(), op, config).unwrap();

        let snapshot = orchestrator.run_cycle_with_cancel(token.clone()).await.unwrap();

        assert!(token.is_cancelled());
        assert_eq!(snapshot.total_value, 150.0);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(orchestrator.publisher().latest_cycle_id(), Some(1));
    }

    #[tokio::test]
    async fn test_run_periodically_respects_cancel() {
        let orchestrator =
            Orchestrator::new(registry(), Arc::new(Scripted::default()), fast_config()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let published = orchestrator.run_periodically(cancel, None).await.unwrap();
        assert_eq!(published, 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = OrchestratorConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        let result = Orchestrator::new(registry(), Arc::new(Scripted::default()), config);
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn test_huge_backoff_is_config_error() {
        let config = OrchestratorConfig {
            max_backoff_seconds: 1e30,
            ..Default::default()
        };
        let result = Orchestrator::new(registry(), Arc::new(Scripted::default()), config);
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }
}
