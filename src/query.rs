//! Composable task queries.
//!
//! A [`TaskQuery`] is a conjunction of optional predicates over
//! [`ScheduledTask`]s. An empty query matches everything; each populated
//! field narrows the match. Queries are the unit of addressing for kills,
//! status fan-out, and snapshot reads.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{JobKey, ScheduleStatus, ScheduledTask, TaskId};

/// Predicate over scheduled tasks. Build with the constructor helpers and
/// narrow with the `with_*` methods.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQuery {
    role: Option<String>,
    job: Option<JobKey>,
    instance_ids: BTreeSet<u32>,
    task_ids: BTreeSet<TaskId>,
    statuses: BTreeSet<ScheduleStatus>,
    slave_host: Option<String>,
}

impl TaskQuery {
    /// Matches every task.
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches all tasks of one job.
    pub fn by_job(key: &JobKey) -> Self {
        Self {
            job: Some(key.clone()),
            ..Self::default()
        }
    }

    /// Matches all tasks owned by a role.
    pub fn by_role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            ..Self::default()
        }
    }

    /// Matches an explicit set of task ids.
    pub fn by_task_ids<I: IntoIterator<Item = TaskId>>(ids: I) -> Self {
        Self {
            task_ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Matches a single task id.
    pub fn by_task_id(id: &TaskId) -> Self {
        Self::by_task_ids([id.clone()])
    }

    pub fn with_instance_ids<I: IntoIterator<Item = u32>>(mut self, ids: I) -> Self {
        self.instance_ids = ids.into_iter().collect();
        self
    }

    pub fn with_statuses<I: IntoIterator<Item = ScheduleStatus>>(mut self, statuses: I) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_slave_host(mut self, host: impl Into<String>) -> Self {
        self.slave_host = Some(host.into());
        self
    }

    /// Restrict to the non-terminal statuses.
    pub fn active(self) -> Self {
        self.with_statuses(ScheduleStatus::ACTIVE)
    }

    pub fn job(&self) -> Option<&JobKey> {
        self.job.as_ref()
    }

    /// True iff the job key is the only constraint set. Distinguishes
    /// "kill the whole job" from "kill these tasks inside the job".
    pub fn is_strictly_job_scoped(&self) -> bool {
        self.job.is_some()
            && self.role.is_none()
            && self.instance_ids.is_empty()
            && self.task_ids.is_empty()
            && self.statuses.is_empty()
            && self.slave_host.is_none()
    }

    pub fn matches(&self, task: &ScheduledTask) -> bool {
        if let Some(role) = &self.role {
            if &task.config().job.role != role {
                return false;
            }
        }
        if let Some(job) = &self.job {
            if task.job_key() != job {
                return false;
            }
        }
        if !self.instance_ids.is_empty() && !self.instance_ids.contains(&task.instance_id()) {
            return false;
        }
        if !self.task_ids.is_empty() && !self.task_ids.contains(task.task_id()) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(host) = &self.slave_host {
            if task.assigned.slave_host.as_deref() != Some(host.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssignedTask, Identity, TaskConfig};
    use std::collections::{BTreeMap, BTreeSet};

    fn task(job: &JobKey, instance_id: u32, id: &str, status: ScheduleStatus) -> ScheduledTask {
        ScheduledTask {
            status,
            failure_count: 0,
            ancestor_id: None,
            assigned: AssignedTask {
                task_id: TaskId::from(id),
                slave_id: None,
                slave_host: Some("slave-a".to_string()),
                assigned_ports: BTreeMap::new(),
                task: TaskConfig {
                    owner: Identity::new(job.role.clone(), "someone"),
                    job: job.clone(),
                    instance_id,
                    cpus: 1.0,
                    ram_mb: 64,
                    disk_mb: 64,
                    requested_ports: BTreeSet::new(),
                    constraints: BTreeSet::new(),
                    executor: None,
                    is_service: false,
                    max_task_failures: 1,
                    production: false,
                    contact_email: None,
                    legacy_executor_data: None,
                },
            },
            task_events: vec![],
        }
    }

    #[test]
    fn empty_query_matches_everything() {
        let key = JobKey::new("ops", "prod", "web");
        let t = task(&key, 0, "t-0", ScheduleStatus::Running);
        assert!(TaskQuery::all().matches(&t));
    }

    #[test]
    fn job_query_filters_other_jobs() {
        let key = JobKey::new("ops", "prod", "web");
        let other = JobKey::new("ops", "prod", "db");
        let t = task(&key, 0, "t-0", ScheduleStatus::Running);
        assert!(TaskQuery::by_job(&key).matches(&t));
        assert!(!TaskQuery::by_job(&other).matches(&t));
    }

    #[test]
    fn active_excludes_terminal_tasks() {
        let key = JobKey::new("ops", "prod", "web");
        let live = task(&key, 0, "t-0", ScheduleStatus::Killing);
        let dead = task(&key, 1, "t-1", ScheduleStatus::Killed);
        let query = TaskQuery::by_job(&key).active();
        assert!(query.matches(&live));
        assert!(!query.matches(&dead));
    }

    #[test]
    fn strict_job_scope_detection() {
        let key = JobKey::new("ops", "prod", "web");
        assert!(TaskQuery::by_job(&key).is_strictly_job_scoped());
        assert!(!TaskQuery::by_job(&key).active().is_strictly_job_scoped());
        assert!(!TaskQuery::by_job(&key)
            .with_instance_ids([0])
            .is_strictly_job_scoped());
        assert!(!TaskQuery::all().is_strictly_job_scoped());
        assert!(!TaskQuery::by_role("ops").is_strictly_job_scoped());
    }

    #[test]
    fn instance_and_host_filters() {
        let key = JobKey::new("ops", "prod", "web");
        let t = task(&key, 3, "t-3", ScheduleStatus::Running);
        assert!(TaskQuery::by_job(&key).with_instance_ids([3]).matches(&t));
        assert!(!TaskQuery::by_job(&key).with_instance_ids([4]).matches(&t));
        assert!(TaskQuery::all().with_slave_host("slave-a").matches(&t));
        assert!(!TaskQuery::all().with_slave_host("slave-b").matches(&t));
    }
}
