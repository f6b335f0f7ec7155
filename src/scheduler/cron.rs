//! Cron job registry and schedule triggering.
//!
//! The registry tracks which jobs are cron-managed and owns their trigger
//! registrations. Firing is delegated to a [`CronTrigger`]: the production
//! implementation parses expressions with the `cron` crate and runs one
//! timer task per registration; tests use [`ManualCronTrigger`] and fire
//! registrations explicitly. The registry reaches back into the scheduler
//! through a `start_instances` callback installed at wiring time.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::types::{CronTriggerError, JobConfig, JobKey, SchedulerError, SchedulerResult};

/// Opaque registration handle returned by [`CronTrigger::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerHandle(u64);

/// Callback invoked when a registration fires.
pub type TriggerCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback from the registry into the scheduler core, installed at wiring
/// time so the registry never holds a reference to the core itself.
pub type StartInstances = Arc<dyn Fn(JobKey) + Send + Sync>;

/// Schedules callbacks against cron expressions.
pub trait CronTrigger: Send + Sync {
    fn is_valid_schedule(&self, expr: &str) -> bool;

    fn schedule(
        &self,
        expr: &str,
        callback: TriggerCallback,
    ) -> Result<TriggerHandle, CronTriggerError>;

    fn deschedule(&self, handle: TriggerHandle);
}

/// Production trigger: one tokio task per registration, sleeping until the
/// next fire time in UTC.
#[derive(Default)]
pub struct TokioCronTrigger {
    next_handle: AtomicU64,
    tasks: DashMap<u64, tokio::task::JoinHandle<()>>,
}

impl TokioCronTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abort every registration. Used on scheduler shutdown.
    pub fn shutdown(&self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
        self.tasks.clear();
    }
}

impl CronTrigger for TokioCronTrigger {
    fn is_valid_schedule(&self, expr: &str) -> bool {
        Schedule::from_str(expr).is_ok()
    }

    fn schedule(
        &self,
        expr: &str,
        callback: TriggerCallback,
    ) -> Result<TriggerHandle, CronTriggerError> {
        let schedule = Schedule::from_str(expr).map_err(|_| CronTriggerError::InvalidExpression {
            expr: expr.to_string(),
        })?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.after(&Utc::now()).next() else {
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;
                callback();
            }
        });
        self.tasks.insert(handle, task);
        Ok(TriggerHandle(handle))
    }

    fn deschedule(&self, handle: TriggerHandle) {
        if let Some((_, task)) = self.tasks.remove(&handle.0) {
            task.abort();
        }
    }
}

impl Drop for TokioCronTrigger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Test trigger: registrations are stored, never fire on their own, and can
/// be fired explicitly.
#[derive(Default)]
pub struct ManualCronTrigger {
    next_handle: AtomicU64,
    entries: DashMap<u64, (String, TriggerCallback)>,
}

impl ManualCronTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registration_count(&self) -> usize {
        self.entries.len()
    }

    /// Fire one registration, as if its schedule had elapsed.
    pub fn fire(&self, handle: TriggerHandle) -> bool {
        match self.entries.get(&handle.0) {
            Some(entry) => {
                (entry.value().1)();
                true
            }
            None => false,
        }
    }

    /// Fire every registration once.
    pub fn fire_all(&self) {
        let callbacks: Vec<TriggerCallback> = self
            .entries
            .iter()
            .map(|entry| entry.value().1.clone())
            .collect();
        for callback in callbacks {
            callback();
        }
    }
}

impl CronTrigger for ManualCronTrigger {
    fn is_valid_schedule(&self, expr: &str) -> bool {
        Schedule::from_str(expr).is_ok()
    }

    fn schedule(
        &self,
        expr: &str,
        callback: TriggerCallback,
    ) -> Result<TriggerHandle, CronTriggerError> {
        if !self.is_valid_schedule(expr) {
            return Err(CronTriggerError::InvalidExpression {
                expr: expr.to_string(),
            });
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(handle, (expr.to_string(), callback));
        Ok(TriggerHandle(handle))
    }

    fn deschedule(&self, handle: TriggerHandle) {
        self.entries.remove(&handle.0);
    }
}

struct CronEntry {
    config: JobConfig,
    handle: TriggerHandle,
}

/// Tracks cron-managed jobs and their trigger registrations.
///
/// A job key is either registered here or has live instance tasks in the
/// store, never both; the scheduler core maintains that exclusion.
pub struct CronJobRegistry {
    trigger: Arc<dyn CronTrigger>,
    entries: DashMap<JobKey, CronEntry>,
    runner: Arc<RwLock<Option<StartInstances>>>,
}

impl CronJobRegistry {
    pub fn new(trigger: Arc<dyn CronTrigger>) -> Self {
        Self {
            trigger,
            entries: DashMap::new(),
            runner: Arc::new(RwLock::new(None)),
        }
    }

    /// Install the scheduler's start-instances callback. Must happen before
    /// any registration fires.
    pub fn install_runner(&self, runner: StartInstances) {
        *self.runner.write() = Some(runner);
    }

    pub fn is_valid_schedule(&self, expr: &str) -> bool {
        self.trigger.is_valid_schedule(expr)
    }

    pub fn has_job(&self, key: &JobKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_job(&self, key: &JobKey) -> Option<JobConfig> {
        self.entries.get(key).map(|entry| entry.config.clone())
    }

    pub fn get_jobs(&self) -> Vec<JobConfig> {
        self.entries
            .iter()
            .map(|entry| entry.config.clone())
            .collect()
    }

    /// Register a cron job and schedule its trigger.
    pub fn schedule(&self, config: JobConfig) -> SchedulerResult<()> {
        let expr = config
            .cron_schedule
            .clone()
            .ok_or_else(|| SchedulerError::NotCronJob {
                key: config.key.clone(),
            })?;

        let key = config.key.clone();
        let runner = self.runner.clone();
        let fire_key = key.clone();
        let callback: TriggerCallback = Arc::new(move || {
            let run = runner.read().clone();
            match run {
                Some(run) => run(fire_key.clone()),
                None => tracing::warn!(job = %fire_key, "cron fired before wiring completed"),
            }
        });

        let handle = self
            .trigger
            .schedule(&expr, callback)
            .map_err(|_| SchedulerError::Config(crate::types::ConfigError::InvalidCronSchedule {
                expr: expr.clone(),
            }))?;

        tracing::info!(job = %key, schedule = %expr, "cron job registered");
        self.entries.insert(key, CronEntry { config, handle });
        Ok(())
    }

    /// Drop a registration and its trigger. Returns false for unknown keys.
    pub fn deschedule(&self, key: &JobKey) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.trigger.deschedule(entry.handle);
                tracing::info!(job = %key, "cron job descheduled");
                true
            }
            None => false,
        }
    }

    /// Replace a registration's config, rescheduling its trigger.
    pub fn replace(&self, config: JobConfig) -> SchedulerResult<()> {
        self.deschedule(&config.key);
        self.schedule(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CronCollisionPolicy, ExecutorConfig, Identity, TaskConfig};
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    fn cron_job(key: &JobKey, expr: &str) -> JobConfig {
        JobConfig {
            key: key.clone(),
            owner: Identity::new(key.role.clone(), "deployer"),
            instance_count: 1,
            task: TaskConfig {
                owner: Identity::new(key.role.clone(), "deployer"),
                job: key.clone(),
                instance_id: 0,
                cpus: 0.5,
                ram_mb: 64,
                disk_mb: 32,
                requested_ports: BTreeSet::new(),
                constraints: BTreeSet::new(),
                executor: Some(ExecutorConfig::new("exec", "{}")),
                is_service: false,
                max_task_failures: 1,
                production: false,
                contact_email: None,
                legacy_executor_data: None,
            },
            cron_schedule: Some(expr.to_string()),
            cron_collision_policy: CronCollisionPolicy::default(),
        }
    }

    #[test]
    fn schedule_validation() {
        let trigger = ManualCronTrigger::new();
        assert!(trigger.is_valid_schedule("0 0 * * * *"));
        assert!(trigger.is_valid_schedule("0 */5 * * * *"));
        assert!(!trigger.is_valid_schedule("not a schedule"));
        assert!(!trigger.is_valid_schedule(""));
    }

    #[test]
    fn registry_schedules_and_deschedules() {
        let trigger = Arc::new(ManualCronTrigger::new());
        let registry = CronJobRegistry::new(trigger.clone());
        let key = JobKey::new("ops", "prod", "nightly");

        registry.schedule(cron_job(&key, "0 0 2 * * *")).unwrap();
        assert!(registry.has_job(&key));
        assert_eq!(trigger.registration_count(), 1);
        assert_eq!(registry.get_jobs().len(), 1);

        assert!(registry.deschedule(&key));
        assert!(!registry.has_job(&key));
        assert_eq!(trigger.registration_count(), 0);
        assert!(!registry.deschedule(&key));
    }

    #[test]
    fn rejects_non_cron_config() {
        let registry = CronJobRegistry::new(Arc::new(ManualCronTrigger::new()));
        let key = JobKey::new("ops", "prod", "web");
        let mut job = cron_job(&key, "0 0 2 * * *");
        job.cron_schedule = None;
        assert!(matches!(
            registry.schedule(job),
            Err(SchedulerError::NotCronJob { .. })
        ));
    }

    #[test]
    fn rejects_bad_expression() {
        let registry = CronJobRegistry::new(Arc::new(ManualCronTrigger::new()));
        let key = JobKey::new("ops", "prod", "web");
        assert!(matches!(
            registry.schedule(cron_job(&key, "bogus")),
            Err(SchedulerError::Config(_))
        ));
        assert!(!registry.has_job(&key));
    }

    #[test]
    fn firing_invokes_the_installed_runner() {
        let trigger = Arc::new(ManualCronTrigger::new());
        let registry = CronJobRegistry::new(trigger.clone());
        let key = JobKey::new("ops", "prod", "nightly");

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let expected = key.clone();
        registry.install_runner(Arc::new(move |job| {
            assert_eq!(job, expected);
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.schedule(cron_job(&key, "0 0 2 * * *")).unwrap();
        trigger.fire_all();
        trigger.fire_all();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn replace_swaps_config_and_registration() {
        let trigger = Arc::new(ManualCronTrigger::new());
        let registry = CronJobRegistry::new(trigger.clone());
        let key = JobKey::new("ops", "prod", "nightly");

        registry.schedule(cron_job(&key, "0 0 2 * * *")).unwrap();
        let mut replacement = cron_job(&key, "0 0 4 * * *");
        replacement.instance_count = 5;
        registry.replace(replacement).unwrap();

        assert_eq!(trigger.registration_count(), 1);
        let stored = registry.get_job(&key).unwrap();
        assert_eq!(stored.instance_count, 5);
        assert_eq!(stored.cron_schedule.as_deref(), Some("0 0 4 * * *"));
    }

    #[tokio::test]
    async fn tokio_trigger_registers_and_aborts() {
        let trigger = TokioCronTrigger::new();
        let handle = trigger
            .schedule("0 0 2 * * *", Arc::new(|| {}))
            .unwrap();
        assert!(trigger.is_valid_schedule("0 0 2 * * *"));
        trigger.deschedule(handle);
        assert!(trigger.tasks.is_empty());
    }
}
