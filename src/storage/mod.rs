//! Transactional task store contract.
//!
//! The store is the only shared mutable state in the core. All mutation
//! funnels through [`TaskStore::write`]: the closure runs against a
//! mutable view, commits atomically when it returns `Ok`, and rolls back
//! in full on `Err`. Reads run against a consistent snapshot. The write
//! side is serialized; implementations must never run two write
//! transactions concurrently.

use std::collections::BTreeSet;

use crate::query::TaskQuery;
use crate::types::{JobConfig, JobKey, ScheduledTask, StoreError, TaskId, UpdateSession};

pub mod backfill;
pub mod mem;

pub use mem::MemTaskStore;

/// Read-only view over the store's contents.
pub trait Snapshot {
    /// All tasks matching the query.
    fn fetch_tasks(&self, query: &TaskQuery) -> Vec<ScheduledTask>;

    fn get_task(&self, id: &TaskId) -> Option<ScheduledTask>;

    /// All persisted job configurations (cron registrations).
    fn fetch_jobs(&self) -> Vec<JobConfig>;

    fn get_job(&self, key: &JobKey) -> Option<JobConfig>;

    fn get_update_session(&self, key: &JobKey) -> Option<UpdateSession>;
}

/// Mutable view handed to a write transaction.
pub trait MutableStore: Snapshot {
    /// Insert or replace tasks, keyed by task id.
    fn save_tasks(&mut self, tasks: Vec<ScheduledTask>);

    fn delete_tasks(&mut self, ids: &BTreeSet<TaskId>);

    /// Read-modify-write a single task. Returns false if the id is unknown.
    fn mutate_task(&mut self, id: &TaskId, mutator: &mut dyn FnMut(&mut ScheduledTask)) -> bool;

    fn save_job(&mut self, job: JobConfig);

    fn remove_job(&mut self, key: &JobKey) -> bool;

    fn save_update_session(&mut self, session: UpdateSession);

    fn remove_update_session(&mut self, key: &JobKey) -> bool;
}

/// Transactional store handle.
pub trait TaskStore: Send + Sync + 'static {
    /// Run a snapshot read. The closure sees a consistent view.
    fn read<T>(&self, f: impl FnOnce(&dyn Snapshot) -> T) -> Result<T, StoreError>;

    /// Run a serializable write transaction. Commits atomically when the
    /// closure returns `Ok`; any `Err` rolls back every mutation and is
    /// returned unchanged.
    fn write<T, E>(&self, f: impl FnOnce(&mut dyn MutableStore) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>;
}
