//! Job ledger
//!
//! In-memory in-flight / completed sets keyed by job id, kept for liveness
//! visibility only. Nothing reads it for correctness and it is empty after a
//! restart.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Completed ids retained before the oldest (lowest) ids are evicted.
const MAX_COMPLETED: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub in_flight: Vec<i64>,
    pub completed: Vec<i64>,
}

#[derive(Default)]
struct LedgerState {
    in_flight: BTreeSet<i64>,
    completed: BTreeSet<i64>,
}

/// A job id is in at most one set; in-flight -> completed happens once.
#[derive(Default)]
pub struct JobLedger {
    label: &'static str,
    state: Mutex<LedgerState>,
}

impl JobLedger {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            state: Mutex::default(),
        }
    }

    /// Mark `job_id` in flight. Returns `false` if the ledger already knows it.
    pub fn start(&self, job_id: i64) -> bool {
        let mut state = self.state.lock();
        if state.completed.contains(&job_id) || !state.in_flight.insert(job_id) {
            return false;
        }
        self.trace(&state);
        true
    }

    /// Move `job_id` from in flight to completed. Returns `false` if it was not in flight.
    pub fn finish(&self, job_id: i64) -> bool {
        let mut state = self.state.lock();
        if !state.in_flight.remove(&job_id) {
            return false;
        }
        state.completed.insert(job_id);
        while state.completed.len() > MAX_COMPLETED {
            state.completed.pop_first();
        }
        self.trace(&state);
        true
    }

    /// Drop `job_id` from in flight without completing it. `false` if it was not in flight.
    pub fn abandon(&self, job_id: i64) -> bool {
        let mut state = self.state.lock();
        if !state.in_flight.remove(&job_id) {
            return false;
        }
        self.trace(&state);
        true
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        LedgerSnapshot {
            in_flight: state.in_flight.iter().copied().collect(),
            completed: state.completed.iter().copied().collect(),
        }
    }

    fn trace(&self, state: &LedgerState) {
        debug!(
            ledger = self.label,
            "Jobs queue: {:?} | Results queue: {:?}",
            state.in_flight,
            state.completed
        );
    }
}
