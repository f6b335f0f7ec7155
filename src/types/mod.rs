//! Core data types for the scheduler: job identity, task configuration,
//! scheduled-task records, and lifecycle statuses.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;

pub use error::*;

/// Upper bound on the byte length of a generated task id.
pub const MAX_TASK_ID_LENGTH: usize = 255;

/// Unique identifier for a scheduled task, produced by the injected
/// task-id generator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Byte length of the identifier.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Fully-qualified job identity: (role, environment, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub role: String,
    pub environment: String,
    pub name: String,
}

impl JobKey {
    pub fn new(
        role: impl Into<String>,
        environment: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            environment: environment.into(),
            name: name.into(),
        }
    }

    /// Canonical `role/environment/name` path.
    pub fn to_path(&self) -> String {
        format!("{}/{}/{}", self.role, self.environment, self.name)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.role, self.environment, self.name)
    }
}

/// Owner of a job: the cluster role it runs as and the submitting user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub role: String,
    pub user: String,
}

impl Identity {
    pub fn new(role: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            user: user.into(),
        }
    }
}

/// Lifecycle status of a scheduled task.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ScheduleStatus {
    /// Created, waiting for assignment to a slave.
    Pending,
    /// Bound to a slave host; executor not yet started.
    Assigned,
    /// Executor acknowledged the task and is starting it.
    Starting,
    Running,
    /// Being killed so its successor can pick up an updated configuration.
    Updating,
    /// Being killed so its successor can revert to the previous configuration.
    Rollback,
    /// Being killed at operator request with an automatic reschedule to follow.
    Restarting,
    /// Kill issued to the driver; awaiting confirmation.
    Killing,
    Finished,
    Failed,
    Killed,
    Lost,
}

impl ScheduleStatus {
    /// The absorbing states: once entered, no further transition is recorded.
    pub const TERMINAL: [ScheduleStatus; 4] = [
        ScheduleStatus::Finished,
        ScheduleStatus::Failed,
        ScheduleStatus::Killed,
        ScheduleStatus::Lost,
    ];

    pub const ACTIVE: [ScheduleStatus; 8] = [
        ScheduleStatus::Pending,
        ScheduleStatus::Assigned,
        ScheduleStatus::Starting,
        ScheduleStatus::Running,
        ScheduleStatus::Updating,
        ScheduleStatus::Rollback,
        ScheduleStatus::Restarting,
        ScheduleStatus::Killing,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleStatus::Pending => "PENDING",
            ScheduleStatus::Assigned => "ASSIGNED",
            ScheduleStatus::Starting => "STARTING",
            ScheduleStatus::Running => "RUNNING",
            ScheduleStatus::Updating => "UPDATING",
            ScheduleStatus::Rollback => "ROLLBACK",
            ScheduleStatus::Restarting => "RESTARTING",
            ScheduleStatus::Killing => "KILLING",
            ScheduleStatus::Finished => "FINISHED",
            ScheduleStatus::Failed => "FAILED",
            ScheduleStatus::Killed => "KILLED",
            ScheduleStatus::Lost => "LOST",
        };
        write!(f, "{s}")
    }
}

/// Placement constraint attached to a task configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Constraint {
    /// Attribute must match one of the given values.
    Value {
        name: String,
        values: BTreeSet<String>,
    },
    /// At most `limit` instances per distinct attribute value.
    Limit { name: String, limit: u32 },
    /// Task may only run on machines dedicated to the given value.
    Dedicated { value: String },
}

impl Constraint {
    /// The default `host` diversity constraint applied to unconstrained tasks.
    pub fn host_limit(limit: u32) -> Self {
        Constraint::Limit {
            name: "host".to_string(),
            limit,
        }
    }
}

/// Opaque executor payload: a name identifying the executor and the data
/// blob it is launched with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub name: String,
    pub data: String,
}

impl ExecutorConfig {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// What to do when a cron job fires while a previous run is still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CronCollisionPolicy {
    /// Kill the previous run, then start the new one.
    #[default]
    KillExisting,
    /// Skip the new run.
    CancelNew,
    /// Start the new run alongside the previous one.
    RunOverlap,
}

/// Per-instance task configuration. Immutable once attached to a
/// [`ScheduledTask`], except for the startup modernization pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub owner: Identity,
    pub job: JobKey,
    pub instance_id: u32,
    pub cpus: f64,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub requested_ports: BTreeSet<String>,
    pub constraints: BTreeSet<Constraint>,
    /// Required at admission; `None` only on legacy rows awaiting backfill.
    pub executor: Option<ExecutorConfig>,
    pub is_service: bool,
    pub max_task_failures: u32,
    pub production: bool,
    pub contact_email: Option<String>,
    /// Raw executor payload carried by rows written before the executor
    /// config existed; consumed by the startup backfill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_executor_data: Option<Vec<u8>>,
}

impl TaskConfig {
    /// Copy of this config re-targeted at another instance id.
    pub fn with_instance_id(&self, instance_id: u32) -> Self {
        let mut config = self.clone();
        config.instance_id = instance_id;
        config
    }
}

/// Declaration of a job: identity, scale, task template, and optional cron
/// schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub key: JobKey,
    pub owner: Identity,
    pub instance_count: u32,
    /// Template applied to every instance; `template.instance_id` is
    /// overwritten at materialization time.
    pub task: TaskConfig,
    pub cron_schedule: Option<String>,
    pub cron_collision_policy: CronCollisionPolicy,
}

impl JobConfig {
    pub fn is_cron(&self) -> bool {
        self.cron_schedule.is_some()
    }

    /// Task config for one instance of this job.
    pub fn task_for_instance(&self, instance_id: u32) -> TaskConfig {
        self.task.with_instance_id(instance_id)
    }
}

/// One entry in a task's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub message: Option<String>,
    /// Hostname of the scheduler that recorded the event.
    pub scheduler_host: String,
}

/// Slave binding for a task: host, slave id, and the concrete ports backing
/// the names the config requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTask {
    pub task_id: TaskId,
    pub slave_id: Option<String>,
    pub slave_host: Option<String>,
    pub assigned_ports: BTreeMap<String, u16>,
    pub task: TaskConfig,
}

/// A materialized task instance tracked by the state manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub status: ScheduleStatus,
    pub failure_count: u32,
    /// Task id of the predecessor this task was rescheduled from.
    pub ancestor_id: Option<TaskId>,
    pub assigned: AssignedTask,
    pub task_events: Vec<TaskEvent>,
}

impl ScheduledTask {
    pub fn task_id(&self) -> &TaskId {
        &self.assigned.task_id
    }

    pub fn config(&self) -> &TaskConfig {
        &self.assigned.task
    }

    pub fn job_key(&self) -> &JobKey {
        &self.assigned.task.job
    }

    pub fn instance_id(&self) -> u32 {
        self.assigned.task.instance_id
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// In-flight rolling update for one job, protected by a random token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSession {
    pub job: JobKey,
    pub token: String,
    pub user: String,
    pub old_config: JobConfig,
    pub new_config: JobConfig,
}

/// Per-instance outcome of an update or rollback pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardUpdateResult {
    /// Instance had no active task and one was created.
    Added,
    /// Instance's task is being cycled to pick up the target configuration.
    Restarting,
    /// Instance already runs the target configuration.
    Unchanged,
}

/// Caller-reported outcome passed to `finish_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateResult {
    Success,
    Failed,
    /// Forcible termination of the session, regardless of progress.
    Terminate,
}

/// Pub-sub notification emitted once per accepted transition, after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStateChange {
    pub task_id: TaskId,
    /// `None` for the initial insert.
    pub old_status: Option<ScheduleStatus>,
    pub new_status: ScheduleStatus,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_active_partition_statuses() {
        for status in ScheduleStatus::TERMINAL {
            assert!(status.is_terminal());
            assert!(!status.is_active());
        }
        for status in ScheduleStatus::ACTIVE {
            assert!(status.is_active());
        }
        assert_eq!(ScheduleStatus::TERMINAL.len() + ScheduleStatus::ACTIVE.len(), 12);
    }

    #[test]
    fn job_key_path_rendering() {
        let key = JobKey::new("ops", "prod", "web");
        assert_eq!(key.to_path(), "ops/prod/web");
        assert_eq!(key.to_string(), "ops/prod/web");
    }

    #[test]
    fn task_id_ordering_is_lexicographic() {
        let a = TaskId::from("task-1");
        let b = TaskId::from("task-10");
        let c = TaskId::from("task-2");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn with_instance_id_only_changes_instance() {
        let config = TaskConfig {
            owner: Identity::new("ops", "ops"),
            job: JobKey::new("ops", "prod", "web"),
            instance_id: 0,
            cpus: 1.0,
            ram_mb: 128,
            disk_mb: 64,
            requested_ports: BTreeSet::new(),
            constraints: BTreeSet::new(),
            executor: Some(ExecutorConfig::new("exec", "{}")),
            is_service: false,
            max_task_failures: 1,
            production: false,
            contact_email: None,
            legacy_executor_data: None,
        };
        let moved = config.with_instance_id(7);
        assert_eq!(moved.instance_id, 7);
        assert_eq!(moved.job, config.job);
        assert_eq!(moved.executor, config.executor);
    }

    #[test]
    fn status_display_is_upper_snake() {
        assert_eq!(ScheduleStatus::Pending.to_string(), "PENDING");
        assert_eq!(ScheduleStatus::Rollback.to_string(), "ROLLBACK");
        assert_eq!(ScheduleStatus::Lost.to_string(), "LOST");
    }
}
