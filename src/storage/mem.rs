//! In-memory task store.
//!
//! Reference implementation of the store contract, used by the test suite
//! and by embedders that don't need durability. Writes run against a
//! scratch copy of the state and swap it in on success, so a failed
//! transaction observably never happened.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

use super::{MutableStore, Snapshot, TaskStore};
use crate::query::TaskQuery;
use crate::types::{JobConfig, JobKey, ScheduledTask, StoreError, TaskId, UpdateSession};

#[derive(Debug, Clone, Default)]
struct StoreState {
    tasks: BTreeMap<TaskId, ScheduledTask>,
    jobs: BTreeMap<JobKey, JobConfig>,
    updates: BTreeMap<JobKey, UpdateSession>,
}

impl Snapshot for StoreState {
    fn fetch_tasks(&self, query: &TaskQuery) -> Vec<ScheduledTask> {
        self.tasks
            .values()
            .filter(|task| query.matches(task))
            .cloned()
            .collect()
    }

    fn get_task(&self, id: &TaskId) -> Option<ScheduledTask> {
        self.tasks.get(id).cloned()
    }

    fn fetch_jobs(&self) -> Vec<JobConfig> {
        self.jobs.values().cloned().collect()
    }

    fn get_job(&self, key: &JobKey) -> Option<JobConfig> {
        self.jobs.get(key).cloned()
    }

    fn get_update_session(&self, key: &JobKey) -> Option<UpdateSession> {
        self.updates.get(key).cloned()
    }
}

impl MutableStore for StoreState {
    fn save_tasks(&mut self, tasks: Vec<ScheduledTask>) {
        for task in tasks {
            self.tasks.insert(task.task_id().clone(), task);
        }
    }

    fn delete_tasks(&mut self, ids: &BTreeSet<TaskId>) {
        for id in ids {
            self.tasks.remove(id);
        }
    }

    fn mutate_task(&mut self, id: &TaskId, mutator: &mut dyn FnMut(&mut ScheduledTask)) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) => {
                mutator(task);
                true
            }
            None => false,
        }
    }

    fn save_job(&mut self, job: JobConfig) {
        self.jobs.insert(job.key.clone(), job);
    }

    fn remove_job(&mut self, key: &JobKey) -> bool {
        self.jobs.remove(key).is_some()
    }

    fn save_update_session(&mut self, session: UpdateSession) {
        self.updates.insert(session.job.clone(), session);
    }

    fn remove_update_session(&mut self, key: &JobKey) -> bool {
        self.updates.remove(key).is_some()
    }
}

/// Lock-serialized in-memory store.
#[derive(Debug, Default)]
pub struct MemTaskStore {
    state: RwLock<StoreState>,
}

impl MemTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks, for tests and diagnostics.
    pub fn task_count(&self) -> usize {
        self.state.read().tasks.len()
    }
}

impl TaskStore for MemTaskStore {
    fn read<T>(&self, f: impl FnOnce(&dyn Snapshot) -> T) -> Result<T, StoreError> {
        let state = self.state.read();
        Ok(f(&*state))
    }

    fn write<T, E>(&self, f: impl FnOnce(&mut dyn MutableStore) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        // The write lock is the single-writer serialization point; the
        // scratch copy gives rollback without undo logging.
        let mut state = self.state.write();
        let mut scratch = state.clone();
        let value = f(&mut scratch)?;
        *state = scratch;
        Ok(value)
    }
}
