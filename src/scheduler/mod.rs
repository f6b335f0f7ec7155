//! Scheduler core: the entry point for job and task mutation.
//!
//! Everything callers can do to a job funnels through [`SchedulerCore`]:
//! admission, instance materialization, cron registration, kills, restarts,
//! status fan-out, and the rolling-update session surface (see `update.rs`).
//! The core owns no task state of its own; it validates, decides, and
//! delegates every mutation to the [`StateManager`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{populate_defaults, validate_job};
use crate::query::TaskQuery;
use crate::state::{StateManager, Trigger};
use crate::storage::{backfill, MutableStore, Snapshot, TaskStore};
use crate::time::Clock;
use crate::types::{
    ConfigError, CronCollisionPolicy, JobConfig, JobKey, ScheduleStatus, SchedulerError,
    SchedulerResult, TaskId,
};

pub mod cron;
mod update;

pub use cron::{
    CronJobRegistry, CronTrigger, ManualCronTrigger, StartInstances, TokioCronTrigger,
    TriggerCallback, TriggerHandle,
};

/// Admission decision for a declared job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFilterResult {
    Pass,
    Fail { reason: String },
}

/// Pluggable admission filter consulted before any job is accepted.
#[async_trait]
pub trait JobFilter: Send + Sync {
    async fn filter(&self, job: &JobConfig) -> JobFilterResult;
}

/// Filter that admits everything.
#[derive(Debug, Default)]
pub struct AcceptAllFilter;

#[async_trait]
impl JobFilter for AcceptAllFilter {
    async fn filter(&self, _job: &JobConfig) -> JobFilterResult {
        JobFilterResult::Pass
    }
}

/// Public facade over the scheduler core.
pub struct SchedulerCore<S> {
    store: Arc<S>,
    state: Arc<StateManager<S>>,
    cron: Arc<CronJobRegistry>,
    filter: Arc<dyn JobFilter>,
    clock: Arc<dyn Clock>,
    scheduler_host: String,
}

impl<S: TaskStore> SchedulerCore<S> {
    pub fn new(
        store: Arc<S>,
        state: Arc<StateManager<S>>,
        cron: Arc<CronJobRegistry>,
        filter: Arc<dyn JobFilter>,
        clock: Arc<dyn Clock>,
        scheduler_host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            state,
            cron,
            filter,
            clock,
            scheduler_host: scheduler_host.into(),
        }
    }

    pub fn state(&self) -> &Arc<StateManager<S>> {
        &self.state
    }

    pub fn cron(&self) -> &Arc<CronJobRegistry> {
        &self.cron
    }

    pub(crate) fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Install the cron registry's callback into this core. Must be called
    /// on the shared handle before any cron job is scheduled.
    pub fn wire_cron(core: &Arc<Self>) {
        let weak = Arc::downgrade(core);
        core.cron.install_runner(Arc::new(move |key: JobKey| {
            let Some(core) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                if let Err(error) = core.start_cron_job(&key).await {
                    tracing::warn!(job = %key, %error, "cron-triggered run failed");
                }
            });
        }));
    }

    /// Run the startup sequence: storage backfill, then re-registration of
    /// persisted cron jobs. Must complete before external requests are
    /// served.
    pub async fn startup(&self) -> SchedulerResult<()> {
        let report = backfill::reconcile_store(
            self.store.as_ref(),
            self.clock.as_ref(),
            &self.scheduler_host,
        )?;
        if !report.is_empty() {
            tracing::info!(
                modernized = report.modernized.len(),
                forced_killed = report.forced_killed.len(),
                "storage backfill applied"
            );
        }

        let jobs = self.store.read(|snap| snap.fetch_jobs())?;
        for job in jobs {
            if !job.is_cron() {
                continue;
            }
            let key = job.key.clone();
            if let Err(error) = self.cron.schedule(job) {
                tracing::warn!(job = %key, %error, "failed to re-register stored cron job");
            }
        }
        Ok(())
    }

    /// Admit a job declaration. Cron jobs are registered without
    /// materializing tasks; anything else gets one PENDING task per
    /// instance.
    pub async fn create_job(&self, mut job: JobConfig) -> SchedulerResult<()> {
        populate_defaults(&mut job.task);
        validate_job(&job)?;

        if let JobFilterResult::Fail { reason } = self.filter.filter(&job).await {
            return Err(SchedulerError::JobRejected { reason });
        }

        if self.cron.has_job(&job.key) {
            return Err(SchedulerError::DuplicateJob {
                key: job.key.clone(),
            });
        }
        let active = self
            .state
            .fetch_tasks(&TaskQuery::by_job(&job.key).active())?;
        if !active.is_empty() {
            return Err(SchedulerError::DuplicateJob {
                key: job.key.clone(),
            });
        }

        if let Some(expr) = &job.cron_schedule {
            if !self.cron.is_valid_schedule(expr) {
                return Err(ConfigError::InvalidCronSchedule { expr: expr.clone() }.into());
            }
            self.store.write(|tx| {
                tx.save_job(job.clone());
                Ok::<_, SchedulerError>(())
            })?;
            self.cron.schedule(job.clone())?;
            tracing::info!(job = %job.key, "cron job accepted");
        } else {
            let count = job.instance_count;
            self.materialize(&job).await?;
            tracing::info!(job = %job.key, instances = count, "job accepted");
        }
        Ok(())
    }

    /// Run one cron-triggered instantiation of a registered job, applying
    /// its collision policy against any still-active previous run.
    pub async fn start_cron_job(&self, key: &JobKey) -> SchedulerResult<()> {
        let config = self
            .cron
            .get_job(key)
            .ok_or_else(|| SchedulerError::CronJobNotFound { key: key.clone() })?;

        let active_query = TaskQuery::by_job(key).active();
        let active = self.state.fetch_tasks(&active_query)?;
        if !active.is_empty() {
            match config.cron_collision_policy {
                CronCollisionPolicy::CancelNew => {
                    tracing::info!(job = %key, "previous run still active, cancelling this run");
                    return Ok(());
                }
                CronCollisionPolicy::KillExisting => {
                    self.state
                        .apply_trigger(
                            &active_query,
                            Trigger::Kill,
                            Some("superseded by new cron run".to_string()),
                        )
                        .await?;
                    // Pending predecessors delete synchronously; anything
                    // still draining through KILLING holds its shard, so the
                    // fresh run waits for the next fire.
                    let remaining = self.state.fetch_tasks(&active_query)?;
                    if !remaining.is_empty() {
                        tracing::warn!(
                            job = %key,
                            draining = remaining.len(),
                            "previous run still draining, skipping this fire"
                        );
                        return Ok(());
                    }
                }
                CronCollisionPolicy::RunOverlap => {
                    tracing::info!(job = %key, "starting cron run alongside previous run");
                }
            }
        }
        self.materialize(&config).await
    }

    /// Kill every task matched by the query. A strictly job-scoped kill of
    /// a cron job also removes its registration.
    pub async fn kill_tasks(&self, query: &TaskQuery, user: &str) -> SchedulerResult<()> {
        let matched = self.state.fetch_tasks(query)?;

        let mut cron_removed = false;
        if query.is_strictly_job_scoped() {
            if let Some(key) = query.job() {
                if self.cron.deschedule(key) {
                    self.store.write(|tx| {
                        tx.remove_job(key);
                        Ok::<_, SchedulerError>(())
                    })?;
                    cron_removed = true;
                }
            }
        }

        if matched.is_empty() && !cron_removed {
            return Err(SchedulerError::NoMatchingTasks);
        }

        self.state
            .apply_trigger(query, Trigger::Kill, Some(format!("killed by {user}")))
            .await?;
        Ok(())
    }

    /// Cycle the given instances through RESTARTING. Instances whose task
    /// is still PENDING count as restarted without a transition.
    pub async fn restart_shards(
        &self,
        key: &JobKey,
        instance_ids: &BTreeSet<u32>,
        user: &str,
    ) -> SchedulerResult<()> {
        let query = TaskQuery::by_job(key)
            .active()
            .with_instance_ids(instance_ids.iter().copied());
        let active = self.state.fetch_tasks(&query)?;

        let found: BTreeSet<u32> = active.iter().map(|task| task.instance_id()).collect();
        let missing: Vec<u32> = instance_ids.difference(&found).copied().collect();
        if !missing.is_empty() {
            return Err(SchedulerError::RestartMissingInstances {
                key: key.clone(),
                instances: missing,
            });
        }

        self.state
            .apply_trigger(&query, Trigger::Restart, Some(format!("restarted by {user}")))
            .await?;
        Ok(())
    }

    /// Entry point for the executor-status pipeline.
    pub async fn set_task_status(
        &self,
        query: &TaskQuery,
        status: ScheduleStatus,
        message: Option<String>,
    ) -> SchedulerResult<usize> {
        self.state.change_state(query, status, message).await
    }

    /// Reconcile tasks whose slaves are gone: active tasks go LOST (and
    /// reschedule), terminal ones are removed outright.
    pub async fn tasks_deleted(&self, ids: &BTreeSet<TaskId>) -> SchedulerResult<()> {
        let tasks = self
            .state
            .fetch_tasks(&TaskQuery::by_task_ids(ids.iter().cloned()))?;

        let (active, terminal): (Vec<_>, Vec<_>) =
            tasks.into_iter().partition(|task| task.is_active());

        if !active.is_empty() {
            let query =
                TaskQuery::by_task_ids(active.iter().map(|task| task.task_id().clone()));
            self.state
                .apply_trigger(
                    &query,
                    Trigger::Report(ScheduleStatus::Lost),
                    Some("slave removed".to_string()),
                )
                .await?;
        }
        if !terminal.is_empty() {
            let ids: BTreeSet<TaskId> = terminal
                .iter()
                .map(|task| task.task_id().clone())
                .collect();
            self.state.delete_tasks(&ids).await?;
        }
        Ok(())
    }

    async fn materialize(&self, job: &JobConfig) -> SchedulerResult<()> {
        let configs = (0..job.instance_count)
            .map(|instance_id| job.task_for_instance(instance_id))
            .collect();
        self.state.insert_tasks(configs).await?;
        Ok(())
    }
}
