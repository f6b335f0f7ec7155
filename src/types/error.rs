//! Error types for the scheduler core.

use thiserror::Error;

use super::{JobKey, TaskId};

/// Caller-visible errors raised by the scheduler core.
///
/// Every variant is a logical error surfaced before any state mutation, or
/// a wrapped store failure whose transaction has already been rolled back.
/// Rejected FSM transitions are not errors; they are dropped silently.
#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job already exists: {key}")]
    DuplicateJob { key: JobKey },

    #[error("job rejected by admission filter: {reason}")]
    JobRejected { reason: String },

    #[error("job is not cron-scheduled: {key}")]
    NotCronJob { key: JobKey },

    #[error("no cron job registered for {key}")]
    CronJobNotFound { key: JobKey },

    #[error("no tasks matched the query")]
    NoMatchingTasks,

    #[error("task not found: {id}")]
    TaskNotFound { id: TaskId },

    #[error("task {id} is not pending and cannot be assigned")]
    TaskNotPending { id: TaskId },

    #[error("{offered} ports offered for {requested} requested port names")]
    InsufficientPorts { requested: usize, offered: usize },

    #[error("an update is already in progress for {key}")]
    UpdateInProgress { key: JobKey },

    #[error("no update in progress for {key}")]
    NoActiveUpdate { key: JobKey },

    #[error("update token mismatch for {key}")]
    InvalidUpdateToken { key: JobKey },

    #[error("instances {instances:?} of {key} have no active task to restart")]
    RestartMissingInstances { key: JobKey, instances: Vec<u32> },
}

/// Rejections produced by configuration validation and admission.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("{field} may not be empty")]
    EmptyIdentifier { field: &'static str },

    #[error("illegal characters in {field}: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("instance count must be at least 1")]
    InstanceCountTooLow,

    #[error("task configuration has no executor")]
    MissingExecutor,

    #[error("contact email is malformed: {value:?}")]
    InvalidContactEmail { value: String },

    #[error("invalid cron schedule: {expr:?}")]
    InvalidCronSchedule { expr: String },

    #[error("dedicated constraint {value:?} is not valid for role {role:?}")]
    InvalidDedicatedConstraint { value: String, role: String },

    #[error("task template names job {actual}, expected {expected}")]
    TemplateJobMismatch { expected: JobKey, actual: JobKey },

    #[error("generated task id is {len} bytes, limit is {limit}")]
    TaskIdTooLong { len: usize, limit: usize },
}

/// Failures inside the task store. A write transaction that returns this
/// has been rolled back in full.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("storage transaction failed: {0}")]
    Transaction(String),
}

/// Failures registering or descheduling a cron trigger.
#[derive(Error, Debug, Clone)]
pub enum CronTriggerError {
    #[error("unparseable cron expression: {expr:?}")]
    InvalidExpression { expr: String },

    #[error("unknown trigger handle")]
    UnknownHandle,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
