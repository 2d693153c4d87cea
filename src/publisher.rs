// 📡 Snapshot Publisher - read-only distribution point for dashboards
//
// Holds the last completed snapshot plus a bounded history of run-record
// sets. A cycle becomes visible in one swap, so readers see either the old
// cycle or the new one, never a half-built view.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

use crate::aggregator::AggregateSnapshot;
use crate::run_record::RunRecord;

/// Read-only queries external dashboards are allowed to make
pub trait SnapshotQuery {
    fn get_latest_snapshot(&self) -> Option<AggregateSnapshot>;

    fn get_run_records(&self, cycle_id: u64) -> Option<Vec<RunRecord>>;
}

struct PublisherState {
    latest: Option<Arc<AggregateSnapshot>>,
    /// (cycle id, records), oldest first
    runs: VecDeque<(u64, Arc<Vec<RunRecord>>)>,
}

pub struct SnapshotPublisher {
    state: RwLock<PublisherState>,
    history_limit: usize,
    notify: watch::Sender<Option<Arc<AggregateSnapshot>>>,
}

impl SnapshotPublisher {
    pub fn new(history_limit: usize) -> Self {
        let (notify, _) = watch::channel(None);
        SnapshotPublisher {
            state: RwLock::new(PublisherState {
                latest: None,
                runs: VecDeque::new(),
            }),
            history_limit: history_limit.max(1),
            notify,
        }
    }

    /// Make a completed cycle visible
    pub fn publish(&self, snapshot: AggregateSnapshot, records: Vec<RunRecord>) {
        let snapshot = Arc::new(snapshot);
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            Self::push_runs(&mut state, self.history_limit, snapshot.cycle_id, records);
            state.latest = Some(snapshot.clone());
        }
        self.notify.send_replace(Some(snapshot));
    }

    /// Keep run records of a cycle that produced no snapshot
    ///
    /// The latest snapshot stays authoritative.
    pub fn record_runs(&self, cycle_id: u64, records: Vec<RunRecord>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        Self::push_runs(&mut state, self.history_limit, cycle_id, records);
    }

    fn push_runs(state: &mut PublisherState, limit: usize, cycle_id: u64, records: Vec<RunRecord>) {
        state.runs.retain(|(id, _)| *id != cycle_id);
        state.runs.push_back((cycle_id, Arc::new(records)));
        while state.runs.len() > limit {
            state.runs.pop_front();
        }
    }

    /// Push interface: receiver yields every newly published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<AggregateSnapshot>>> {
        self.notify.subscribe()
    }

    /// Cycle ids with retained run records, oldest first
    pub fn cycle_ids(&self) -> Vec<u64> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.runs.iter().map(|(id, _)| *id).collect()
    }

    pub fn latest_cycle_id(&self) -> Option<u64> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.latest.as_ref().map(|s| s.cycle_id)
    }
}

impl SnapshotQuery for SnapshotPublisher {
    fn get_latest_snapshot(&self) -> Option<AggregateSnapshot> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.latest.as_deref().cloned()
    }

    fn get_run_records(&self, cycle_id: u64) -> Option<Vec<RunRecord>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .runs
            .iter()
            .find(|(id, _)| *id == cycle_id)
            .map(|(_, records)| records.as_ref().clone())
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new(32)
    }
}

// ============================================================================
// TESTS
// ============================================================================
