//! Startup reconciliation pass.
//!
//! Runs once, inside a single write transaction, before the scheduler
//! serves any external request: modernizes stored task configurations and
//! enforces shard uniqueness for active tasks.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::populate_defaults;
use crate::query::TaskQuery;
use crate::time::Clock;
use crate::types::{JobKey, ScheduleStatus, StoreError, TaskEvent, TaskId};

use super::{MutableStore, Snapshot, TaskStore};

/// What the reconciliation pass changed.
#[derive(Debug, Default, Clone)]
pub struct BackfillReport {
    /// Tasks whose configuration was rewritten in place.
    pub modernized: Vec<TaskId>,
    /// Duplicate-instance tasks forced to KILLED.
    pub forced_killed: Vec<TaskId>,
}

impl BackfillReport {
    pub fn is_empty(&self) -> bool {
        self.modernized.is_empty() && self.forced_killed.is_empty()
    }
}

/// Modernize legacy task configurations and enforce at most one active task
/// per (job, instance). Among duplicates, the lexicographically smallest
/// task id survives.
pub fn reconcile_store<S: TaskStore>(
    store: &S,
    clock: &dyn Clock,
    scheduler_host: &str,
) -> Result<BackfillReport, StoreError> {
    store.write(|tx| {
        let mut report = BackfillReport::default();
        let tasks = tx.fetch_tasks(&TaskQuery::all());

        for task in &tasks {
            let mut config = task.config().clone();
            if populate_defaults(&mut config) {
                tx.mutate_task(task.task_id(), &mut |stored| {
                    stored.assigned.task = config.clone();
                });
                report.modernized.push(task.task_id().clone());
            }
        }

        let mut by_instance: BTreeMap<(JobKey, u32), BTreeSet<TaskId>> = BTreeMap::new();
        for task in &tasks {
            if task.is_active() {
                by_instance
                    .entry((task.job_key().clone(), task.instance_id()))
                    .or_default()
                    .insert(task.task_id().clone());
            }
        }

        let now = clock.now();
        for ((job, instance_id), ids) in by_instance {
            if ids.len() < 2 {
                continue;
            }
            // BTreeSet iteration order is lexicographic; the first id wins.
            for id in ids.into_iter().skip(1) {
                tracing::warn!(
                    %job,
                    instance_id,
                    task_id = %id,
                    "duplicate active instance, forcing to KILLED"
                );
                tx.mutate_task(&id, &mut |stored| {
                    stored.status = ScheduleStatus::Killed;
                    stored.task_events.push(TaskEvent {
                        timestamp: now,
                        status: ScheduleStatus::Killed,
                        message: Some("duplicate active instance".to_string()),
                        scheduler_host: scheduler_host.to_string(),
                    });
                });
                report.forced_killed.push(id);
            }
        }

        Ok::<_, StoreError>(report)
    })
}
