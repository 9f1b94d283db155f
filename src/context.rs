//! Shared state of the batch in flight.
//!
//! The coordinator publishes every attempt and outcome here as it happens, so
//! the interruption path can checkpoint exactly what has completed.

use crate::models::{DataType, RosterEntry, Strategy, Summary};
use crate::storage::{StatusStore, StatusTable};
use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Checkpointing,
    Terminated,
}

#[derive(Debug)]
struct RunState {
    phase: Phase,
    /// False until the roster and previous table are published. A checkpoint
    /// before that point would overwrite the table with defaults.
    primed: bool,
    roster: Vec<RosterEntry>,
    previous: StatusTable,
    strategy: Strategy,
    selected: usize,
    results: HashMap<String, bool>,
    attempt_times: HashMap<String, NaiveDateTime>,
    checkpoint_failures: usize,
}

#[derive(Debug)]
pub struct RunContext {
    data_type: DataType,
    state: Mutex<RunState>,
}

impl RunContext {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            state: Mutex::new(RunState {
                phase: Phase::Running,
                primed: false,
                roster: Vec::new(),
                previous: StatusTable::new(),
                strategy: Strategy::InitialScan,
                selected: 0,
                results: HashMap::new(),
                attempt_times: HashMap::new(),
                checkpoint_failures: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        // A poisoned lock still holds consistent maps; keep checkpointing.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish the run's inputs and clear any previous progress.
    pub fn begin(
        &self,
        roster: &[RosterEntry],
        previous: StatusTable,
        strategy: Strategy,
        selected: usize,
    ) {
        let mut s = self.lock();
        s.primed = true;
        s.roster = roster.to_vec();
        s.previous = previous;
        s.strategy = strategy;
        s.selected = selected;
        s.results.clear();
        s.attempt_times.clear();
    }

    pub fn record_attempt(&self, code: &str, started: NaiveDateTime) {
        self.lock().attempt_times.insert(code.to_string(), started);
    }

    pub fn record_result(&self, code: &str, success: bool) {
        self.lock().results.insert(code.to_string(), success);
    }

    pub fn note_checkpoint_failure(&self) {
        self.lock().checkpoint_failures += 1;
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn set_phase(&self, phase: Phase) {
        self.lock().phase = phase;
    }

    pub fn is_primed(&self) -> bool {
        self.lock().primed
    }

    /// Write the table from the current state. The lock is held for the
    /// duration of the write so no update can interleave.
    pub fn checkpoint(&self, store: &StatusStore) -> Result<usize> {
        let s = self.lock();
        store.write_checkpoint(&s.roster, &s.previous, &s.results, &s.attempt_times)
    }

    pub fn summary(&self, interrupted: bool) -> Summary {
        let s = self.lock();
        let succeeded = s.results.values().filter(|ok| **ok).count();
        Summary {
            data_type: self.data_type,
            total_roster: s.roster.len(),
            selected: s.selected,
            succeeded,
            failed: s.results.len() - succeeded,
            strategy: s.strategy,
            checkpoint_failures: s.checkpoint_failures,
            interrupted,
        }
    }
}
