//! Transactional executor for task lifecycle transitions.
//!
//! Every mutation the scheduler performs on a task funnels through the
//! [`StateManager`], inside one store write transaction. Side effects that
//! leave the process (driver kills, event publication) are buffered in a
//! [`TxEffects`] during the transaction and dispatched only after commit; a
//! rolled-back transaction therefore has no external footprint.
//!
//! The scheduler core composes multi-step operations (update passes,
//! finish-update cleanup) out of the crate-internal `*_in_tx` primitives so
//! the whole operation commits or rolls back as one transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::driver::Driver;
use crate::events::EventSink;
use crate::query::TaskQuery;
use crate::storage::{MutableStore, Snapshot, TaskStore};
use crate::time::Clock;
use crate::types::{
    AssignedTask, ConfigError, ScheduleStatus, ScheduledTask, SchedulerError, SchedulerResult,
    TaskConfig, TaskEvent, TaskId, TaskStateChange, MAX_TASK_ID_LENGTH,
};

use super::machine::{plan_transition, RescheduleSource, TransitionPlan, Trigger, WorkItem};

/// Pluggable task-id generator.
pub type TaskIdGenerator = Arc<dyn Fn(&TaskConfig) -> String + Send + Sync>;

/// Default generator: `<role>-<env>-<name>-<instance>-<seq>` with a
/// process-local counter. The counter is not durable and restarts from zero
/// with the process.
pub fn counter_task_id_generator() -> TaskIdGenerator {
    let counter = AtomicU64::new(0);
    Arc::new(move |config: &TaskConfig| {
        let seq = counter.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-{}-{}-{}",
            config.job.role, config.job.environment, config.job.name, config.instance_id, seq
        )
    })
}

/// External work buffered during a transaction, dispatched post-commit.
#[derive(Default)]
pub(crate) struct TxEffects {
    kills: Vec<TaskId>,
    events: Vec<TaskStateChange>,
}

/// Owns the task FSM and the transactional glue to the store.
pub struct StateManager<S> {
    store: Arc<S>,
    driver: Arc<dyn Driver>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    task_ids: TaskIdGenerator,
    scheduler_host: String,
}

impl<S: TaskStore> StateManager<S> {
    pub fn new(
        store: Arc<S>,
        driver: Arc<dyn Driver>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        task_ids: TaskIdGenerator,
        scheduler_host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            driver,
            events,
            clock,
            task_ids,
            scheduler_host: scheduler_host.into(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create one PENDING task per configuration. Fails the whole batch if
    /// the generator produces an oversize id.
    pub async fn insert_tasks(&self, configs: Vec<TaskConfig>) -> SchedulerResult<Vec<TaskId>> {
        let mut effects = TxEffects::default();
        let ids = self.store.write(|tx| {
            let mut ids = Vec::with_capacity(configs.len());
            for config in configs {
                ids.push(self.insert_in_tx(tx, config, 0, None, &mut effects)?);
            }
            Ok::<_, SchedulerError>(ids)
        })?;
        self.dispatch_effects(effects).await;
        Ok(ids)
    }

    /// Bind a PENDING task to a slave, pairing each requested port name with
    /// a distinct offered port.
    pub async fn assign_task(
        &self,
        task_id: &TaskId,
        slave_host: impl Into<String>,
        slave_id: impl Into<String>,
        ports: BTreeSet<u16>,
    ) -> SchedulerResult<AssignedTask> {
        let slave_host = slave_host.into();
        let slave_id = slave_id.into();
        let mut effects = TxEffects::default();

        let assigned = self.store.write(|tx| {
            let task = tx
                .get_task(task_id)
                .ok_or_else(|| SchedulerError::TaskNotFound {
                    id: task_id.clone(),
                })?;
            if task.status != ScheduleStatus::Pending {
                return Err(SchedulerError::TaskNotPending {
                    id: task_id.clone(),
                });
            }

            let requested = &task.config().requested_ports;
            if ports.len() < requested.len() {
                return Err(SchedulerError::InsufficientPorts {
                    requested: requested.len(),
                    offered: ports.len(),
                });
            }
            let assigned_ports: BTreeMap<String, u16> = requested
                .iter()
                .cloned()
                .zip(ports.iter().copied())
                .collect();

            let event = TaskEvent {
                timestamp: self.clock.now(),
                status: ScheduleStatus::Assigned,
                message: Some(format!("assigned to {slave_host}")),
                scheduler_host: self.scheduler_host.clone(),
            };
            tx.mutate_task(task_id, &mut |stored| {
                stored.status = ScheduleStatus::Assigned;
                stored.assigned.slave_host = Some(slave_host.clone());
                stored.assigned.slave_id = Some(slave_id.clone());
                stored.assigned.assigned_ports = assigned_ports.clone();
                stored.task_events.push(event.clone());
            });

            effects.events.push(TaskStateChange {
                task_id: task_id.clone(),
                old_status: Some(ScheduleStatus::Pending),
                new_status: ScheduleStatus::Assigned,
                message: None,
            });

            // Re-read so the returned record reflects the binding.
            tx.get_task(task_id)
                .map(|stored| stored.assigned)
                .ok_or_else(|| SchedulerError::TaskNotFound {
                    id: task_id.clone(),
                })
        })?;

        self.dispatch_effects(effects).await;
        Ok(assigned)
    }

    /// Apply a reported status to every matching task. Returns how many
    /// tasks actually transitioned; rejected transitions are dropped.
    pub async fn change_state(
        &self,
        query: &TaskQuery,
        status: ScheduleStatus,
        message: Option<String>,
    ) -> SchedulerResult<usize> {
        let trigger = if status == ScheduleStatus::Killing {
            Trigger::Kill
        } else {
            Trigger::Report(status)
        };
        self.apply_trigger(query, trigger, message).await
    }

    /// Unconditional removal. Not a transition: no events, no kills.
    pub async fn delete_tasks(&self, ids: &BTreeSet<TaskId>) -> SchedulerResult<()> {
        self.store.write(|tx| {
            tx.delete_tasks(ids);
            Ok::<_, SchedulerError>(())
        })
    }

    /// Snapshot read.
    pub fn fetch_tasks(&self, query: &TaskQuery) -> SchedulerResult<Vec<ScheduledTask>> {
        Ok(self.store.read(|snap| snap.fetch_tasks(query))?)
    }

    /// Run one trigger against every matching task in a single transaction.
    pub(crate) async fn apply_trigger(
        &self,
        query: &TaskQuery,
        trigger: Trigger,
        message: Option<String>,
    ) -> SchedulerResult<usize> {
        let mut effects = TxEffects::default();
        let applied = self.store.write(|tx| {
            let tasks = tx.fetch_tasks(query);
            let mut applied = 0;
            for task in tasks {
                if self.step_in_tx(tx, &task, trigger, message.as_deref(), &mut effects)? {
                    applied += 1;
                }
            }
            Ok::<_, SchedulerError>(applied)
        })?;
        self.dispatch_effects(effects).await;
        Ok(applied)
    }

    // ── In-transaction primitives for composite operations ────────────

    /// Plan and apply one trigger against one task. Returns whether the
    /// transition was accepted.
    pub(crate) fn step_in_tx(
        &self,
        tx: &mut dyn MutableStore,
        task: &ScheduledTask,
        trigger: Trigger,
        message: Option<&str>,
        effects: &mut TxEffects,
    ) -> Result<bool, SchedulerError> {
        match plan_transition(task, trigger) {
            Some(plan) => {
                self.apply_plan(tx, task, &plan, message, effects)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Create a PENDING task inside an open transaction.
    pub(crate) fn insert_in_tx(
        &self,
        tx: &mut dyn MutableStore,
        config: TaskConfig,
        failure_count: u32,
        ancestor_id: Option<TaskId>,
        effects: &mut TxEffects,
    ) -> Result<TaskId, SchedulerError> {
        let message = ancestor_id
            .as_ref()
            .map(|ancestor| format!("rescheduled from {ancestor}"));
        let task = self.create_task(config, failure_count, ancestor_id)?;
        let id = task.task_id().clone();
        effects.events.push(TaskStateChange {
            task_id: id.clone(),
            old_status: None,
            new_status: ScheduleStatus::Pending,
            message,
        });
        tx.save_tasks(vec![task]);
        Ok(id)
    }

    /// Rewrite a PENDING task's configuration in place, preserving its id
    /// and status.
    pub(crate) fn rewrite_config_in_tx(
        &self,
        tx: &mut dyn MutableStore,
        task_id: &TaskId,
        config: TaskConfig,
        effects: &mut TxEffects,
    ) {
        let event = TaskEvent {
            timestamp: self.clock.now(),
            status: ScheduleStatus::Pending,
            message: Some("configuration replaced while pending".to_string()),
            scheduler_host: self.scheduler_host.clone(),
        };
        tx.mutate_task(task_id, &mut |stored| {
            stored.assigned.task = config.clone();
            stored.task_events.push(event.clone());
        });
        effects.events.push(TaskStateChange {
            task_id: task_id.clone(),
            old_status: Some(ScheduleStatus::Pending),
            new_status: ScheduleStatus::Pending,
            message: Some("configuration replaced".to_string()),
        });
    }

    /// Dispatch buffered external work after a committed transaction.
    pub(crate) async fn dispatch_effects(&self, effects: TxEffects) {
        // Best effort, never unwinds committed state.
        for task_id in effects.kills {
            self.driver.kill_task(&task_id).await;
        }
        for change in effects.events {
            self.events.publish(change).await;
        }
    }

    fn apply_plan(
        &self,
        tx: &mut dyn MutableStore,
        task: &ScheduledTask,
        plan: &TransitionPlan,
        message: Option<&str>,
        effects: &mut TxEffects,
    ) -> Result<(), SchedulerError> {
        let task_id = task.task_id().clone();
        let mut failure_count = task.failure_count;

        for item in &plan.work {
            match item {
                WorkItem::IncrementFailures => {
                    failure_count += 1;
                    tx.mutate_task(&task_id, &mut |stored| {
                        stored.failure_count += 1;
                    });
                }
                WorkItem::UpdateState => {
                    let event = TaskEvent {
                        timestamp: self.clock.now(),
                        status: plan.next,
                        message: message.map(String::from),
                        scheduler_host: self.scheduler_host.clone(),
                    };
                    tx.mutate_task(&task_id, &mut |stored| {
                        stored.status = plan.next;
                        stored.task_events.push(event.clone());
                    });
                }
                WorkItem::Reschedule(source) => {
                    if let Some(config) = self.reschedule_config(tx, task, *source) {
                        self.insert_in_tx(
                            tx,
                            config,
                            failure_count,
                            Some(task_id.clone()),
                            effects,
                        )?;
                    }
                }
                WorkItem::Delete => {
                    tx.delete_tasks(&BTreeSet::from([task_id.clone()]));
                }
                WorkItem::Kill => {
                    effects.kills.push(task_id.clone());
                }
            }
        }

        effects.events.push(TaskStateChange {
            task_id,
            old_status: Some(task.status),
            new_status: plan.next,
            message: message.map(String::from),
        });
        Ok(())
    }

    /// Configuration for a rescheduled successor. `None` means the
    /// reschedule is skipped (vanished session or out-of-range instance).
    fn reschedule_config(
        &self,
        tx: &dyn MutableStore,
        task: &ScheduledTask,
        source: RescheduleSource,
    ) -> Option<TaskConfig> {
        match source {
            RescheduleSource::Same => Some(task.config().clone()),
            RescheduleSource::Updated | RescheduleSource::Previous => {
                let key = task.job_key();
                let Some(session) = tx.get_update_session(key) else {
                    tracing::warn!(
                        job = %key,
                        task_id = %task.task_id(),
                        "no update session at reschedule time, dropping successor"
                    );
                    return None;
                };
                let target = match source {
                    RescheduleSource::Updated => &session.new_config,
                    _ => &session.old_config,
                };
                let instance_id = task.instance_id();
                if instance_id >= target.instance_count {
                    tracing::info!(
                        job = %key,
                        instance_id,
                        "instance removed by the target configuration, not rescheduling"
                    );
                    return None;
                }
                Some(target.task_for_instance(instance_id))
            }
        }
    }

    fn create_task(
        &self,
        config: TaskConfig,
        failure_count: u32,
        ancestor_id: Option<TaskId>,
    ) -> Result<ScheduledTask, SchedulerError> {
        let id = (self.task_ids)(&config);
        if id.len() > MAX_TASK_ID_LENGTH {
            return Err(ConfigError::TaskIdTooLong {
                len: id.len(),
                limit: MAX_TASK_ID_LENGTH,
            }
            .into());
        }
        Ok(ScheduledTask {
            status: ScheduleStatus::Pending,
            failure_count,
            ancestor_id,
            assigned: AssignedTask {
                task_id: TaskId::new(id),
                slave_id: None,
                slave_host: None,
                assigned_ports: Default::default(),
                task: config,
            },
            task_events: vec![TaskEvent {
                timestamp: self.clock.now(),
                status: ScheduleStatus::Pending,
                message: None,
                scheduler_host: self.scheduler_host.clone(),
            }],
        })
    }
}
