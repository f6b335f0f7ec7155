//! Bosun workload scheduler core.
//!
//! The core accepts job declarations, materializes them into per-instance
//! tasks, drives each task through its lifecycle state machine against a
//! transactional store, and coordinates rolling updates, rollbacks,
//! restarts, and cron-triggered instantiation. Placement, health checking,
//! executor lifecycle, and the RPC surface live outside this crate and are
//! reached through the collaborator traits ([`Driver`], [`EventSink`],
//! [`CronTrigger`], [`JobFilter`], [`storage::TaskStore`]).

pub mod config;
pub mod driver;
pub mod events;
pub mod query;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod time;
pub mod types;

// Re-export the surface most embedders need.
pub use driver::{Driver, LoggingDriver};
pub use events::{CollectingSink, EventSink, FanoutSink, TracingEventSink};
pub use query::TaskQuery;
pub use scheduler::{
    AcceptAllFilter, CronJobRegistry, CronTrigger, JobFilter, JobFilterResult, ManualCronTrigger,
    SchedulerCore, TokioCronTrigger, TriggerHandle,
};
pub use state::{counter_task_id_generator, StateManager, TaskIdGenerator};
pub use storage::{MemTaskStore, MutableStore, Snapshot, TaskStore};
pub use time::{Clock, ManualClock, SystemClock};
pub use types::*;

use std::sync::Arc;

/// Construction-time wiring for the scheduler core.
///
/// Collaborators default to the in-process implementations (logging driver,
/// tracing event sink, system clock, tokio cron trigger, accept-all
/// filter); override the ones the deployment actually provides.
pub struct SchedulerBuilder<S> {
    store: Arc<S>,
    driver: Arc<dyn Driver>,
    sinks: Vec<Arc<dyn EventSink>>,
    clock: Arc<dyn Clock>,
    trigger: Arc<dyn CronTrigger>,
    filter: Arc<dyn JobFilter>,
    task_ids: TaskIdGenerator,
    scheduler_host: String,
}

impl<S: TaskStore> SchedulerBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            driver: Arc::new(LoggingDriver),
            sinks: Vec::new(),
            clock: Arc::new(SystemClock),
            trigger: Arc::new(TokioCronTrigger::new()),
            filter: Arc::new(AcceptAllFilter),
            task_ids: counter_task_id_generator(),
            scheduler_host: "bosun-scheduler".to_string(),
        }
    }

    pub fn driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = driver;
        self
    }

    /// Add an event subscriber. Subscribers receive every accepted
    /// transition, post-commit, in registration order.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cron_trigger(mut self, trigger: Arc<dyn CronTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn job_filter(mut self, filter: Arc<dyn JobFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn task_id_generator(mut self, task_ids: TaskIdGenerator) -> Self {
        self.task_ids = task_ids;
        self
    }

    pub fn scheduler_host(mut self, host: impl Into<String>) -> Self {
        self.scheduler_host = host.into();
        self
    }

    /// Assemble the core and install the cron wiring.
    pub fn build(mut self) -> Arc<SchedulerCore<S>> {
        let events: Arc<dyn EventSink> = match self.sinks.len() {
            0 => Arc::new(TracingEventSink),
            1 => self.sinks.remove(0),
            _ => Arc::new(FanoutSink::new(self.sinks)),
        };

        let state = Arc::new(StateManager::new(
            self.store.clone(),
            self.driver,
            events,
            self.clock.clone(),
            self.task_ids,
            self.scheduler_host.clone(),
        ));
        let cron = Arc::new(CronJobRegistry::new(self.trigger));
        let core = Arc::new(SchedulerCore::new(
            self.store,
            state,
            cron,
            self.filter,
            self.clock,
            self.scheduler_host,
        ));
        SchedulerCore::wire_cron(&core);
        core
    }
}
