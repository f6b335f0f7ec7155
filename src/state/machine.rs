//! Per-task transition planning.
//!
//! [`plan_transition`] is a pure function from (task, trigger) to a plan:
//! the status to record and the ordered work items the state manager must
//! apply. Rejected transitions return `None` and are dropped without error;
//! terminal states absorb every trigger. The planner never touches the
//! store, which keeps the whole lifecycle table testable in isolation.

use crate::types::{ScheduleStatus, ScheduledTask};

use ScheduleStatus::*;

/// Which configuration a rescheduled successor is created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RescheduleSource {
    /// The outgoing task's own configuration.
    Same,
    /// The in-flight update session's new configuration.
    Updated,
    /// The in-flight update session's previous configuration.
    Previous,
}

/// Work items emitted by an accepted transition, applied in the order they
/// appear in the plan: failure-count increment, then the status write, then
/// the successor insert, then the row delete. Kills are buffered and
/// dispatched after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkItem {
    IncrementFailures,
    UpdateState,
    Reschedule(RescheduleSource),
    Delete,
    Kill,
}

/// What drove the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// Status reported by the executor pipeline.
    Report(ScheduleStatus),
    /// Operator- or scheduler-initiated kill. Pending tasks are removed
    /// outright; anything else drains through KILLING, whose terminal exit
    /// never reschedules — which is what suppresses resurrection on a
    /// whole-job kill.
    Kill,
    Restart,
    Update,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TransitionPlan {
    /// Status recorded and published for this transition.
    pub next: ScheduleStatus,
    pub work: Vec<WorkItem>,
}

impl TransitionPlan {
    fn new(next: ScheduleStatus, work: Vec<WorkItem>) -> Option<Self> {
        Some(Self { next, work })
    }

    #[cfg(test)]
    pub fn has(&self, item: WorkItem) -> bool {
        self.work.contains(&item)
    }
}

pub(crate) fn plan_transition(task: &ScheduledTask, trigger: Trigger) -> Option<TransitionPlan> {
    use WorkItem::*;

    let from = task.status;
    if from.is_terminal() {
        return None;
    }

    match trigger {
        Trigger::Kill => match from {
            // Never handed to a slave; nothing to kill, nothing to keep.
            Pending => TransitionPlan::new(Killed, vec![Delete]),
            Killing => None,
            _ => TransitionPlan::new(Killing, vec![UpdateState, Kill]),
        },

        Trigger::Restart => match from {
            Assigned | Starting | Running => {
                TransitionPlan::new(Restarting, vec![UpdateState, Kill])
            }
            _ => None,
        },

        Trigger::Update => match from {
            Assigned | Starting | Running => TransitionPlan::new(Updating, vec![UpdateState, Kill]),
            _ => None,
        },

        Trigger::Rollback => match from {
            Assigned | Starting | Running => TransitionPlan::new(Rollback, vec![UpdateState, Kill]),
            // Already draining for the update; retarget the successor only.
            Updating => TransitionPlan::new(Rollback, vec![UpdateState]),
            _ => None,
        },

        Trigger::Report(to) if to == from => None,

        Trigger::Report(to) => match (from, to) {
            (Pending, Assigned) => TransitionPlan::new(Assigned, vec![UpdateState]),

            (Assigned, Starting) => TransitionPlan::new(Starting, vec![UpdateState]),
            (Starting, Running) => TransitionPlan::new(Running, vec![UpdateState]),

            // Lost before reaching a stable state: replace it.
            (Assigned | Starting, Lost) => {
                TransitionPlan::new(Lost, vec![UpdateState, Reschedule(RescheduleSource::Same)])
            }
            // Killed out-of-band before starting, or finished before the
            // executor ever ran it: both count as a killed launch.
            (Assigned, Finished | Killed) | (Starting, Killed) => {
                TransitionPlan::new(Killed, vec![UpdateState, Reschedule(RescheduleSource::Same)])
            }

            (Starting | Running, Finished) => {
                let mut work = vec![UpdateState];
                if task.config().is_service {
                    work.push(Reschedule(RescheduleSource::Same));
                }
                TransitionPlan::new(Finished, work)
            }

            (Assigned | Starting | Running, Failed) => {
                let config = task.config();
                let mut work = vec![IncrementFailures, UpdateState];
                if config.is_service || task.failure_count + 1 < config.max_task_failures {
                    work.push(Reschedule(RescheduleSource::Same));
                }
                TransitionPlan::new(Failed, work)
            }

            (Running, Lost) => {
                TransitionPlan::new(Lost, vec![UpdateState, Reschedule(RescheduleSource::Same)])
            }
            // Externally killed, not through this scheduler: replace it.
            (Running, Killed) => {
                TransitionPlan::new(Killed, vec![UpdateState, Reschedule(RescheduleSource::Same)])
            }

            // A kill we issued has completed, whatever the executor called it.
            (Killing, Finished | Failed | Killed | Lost) => {
                TransitionPlan::new(Killed, vec![UpdateState])
            }

            (Updating, Finished | Failed | Killed | Lost) => {
                TransitionPlan::new(to, vec![UpdateState, Reschedule(RescheduleSource::Updated)])
            }
            (Rollback, Finished | Failed | Killed | Lost) => {
                TransitionPlan::new(to, vec![UpdateState, Reschedule(RescheduleSource::Previous)])
            }
            (Restarting, Finished | Failed | Killed | Lost) => {
                TransitionPlan::new(to, vec![UpdateState, Reschedule(RescheduleSource::Same)])
            }

            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssignedTask, ExecutorConfig, Identity, JobKey, TaskConfig, TaskId};
    use std::collections::{BTreeMap, BTreeSet};

    fn task(status: ScheduleStatus, is_service: bool, failures: u32, max: u32) -> ScheduledTask {
        let job = JobKey::new("ops", "prod", "web");
        ScheduledTask {
            status,
            failure_count: failures,
            ancestor_id: None,
            assigned: AssignedTask {
                task_id: TaskId::from("t-0"),
                slave_id: None,
                slave_host: None,
                assigned_ports: BTreeMap::new(),
                task: TaskConfig {
                    owner: Identity::new("ops", "deployer"),
                    job,
                    instance_id: 0,
                    cpus: 1.0,
                    ram_mb: 128,
                    disk_mb: 64,
                    requested_ports: BTreeSet::new(),
                    constraints: BTreeSet::new(),
                    executor: Some(ExecutorConfig::new("exec", "{}")),
                    is_service,
                    max_task_failures: max,
                    production: false,
                    contact_email: None,
                    legacy_executor_data: None,
                },
            },
            task_events: vec![],
        }
    }

    fn batch(status: ScheduleStatus) -> ScheduledTask {
        task(status, false, 0, 1)
    }

    #[test]
    fn terminal_states_absorb_everything() {
        for from in ScheduleStatus::TERMINAL {
            for trigger in [
                Trigger::Report(Running),
                Trigger::Report(Killed),
                Trigger::Kill,
                Trigger::Restart,
                Trigger::Update,
            ] {
                assert!(plan_transition(&batch(from), trigger).is_none());
            }
        }
    }

    #[test]
    fn redundant_report_is_dropped() {
        assert!(plan_transition(&batch(Running), Trigger::Report(Running)).is_none());
    }

    #[test]
    fn happy_path_chain() {
        let plan = plan_transition(&batch(Pending), Trigger::Report(Assigned)).unwrap();
        assert_eq!(plan.next, Assigned);
        assert_eq!(plan.work, vec![WorkItem::UpdateState]);

        assert_eq!(
            plan_transition(&batch(Assigned), Trigger::Report(Starting))
                .unwrap()
                .next,
            Starting
        );
        assert_eq!(
            plan_transition(&batch(Starting), Trigger::Report(Running))
                .unwrap()
                .next,
            Running
        );
    }

    #[test]
    fn pending_kill_deletes_without_driver_kill() {
        let plan = plan_transition(&batch(Pending), Trigger::Kill).unwrap();
        assert_eq!(plan.next, Killed);
        assert_eq!(plan.work, vec![WorkItem::Delete]);
    }

    #[test]
    fn running_kill_drains_through_killing() {
        let plan = plan_transition(&batch(Running), Trigger::Kill).unwrap();
        assert_eq!(plan.next, Killing);
        assert!(plan.has(WorkItem::Kill));
        assert!(plan.has(WorkItem::UpdateState));

        // Terminal exit from KILLING never reschedules.
        let done = plan_transition(&batch(Killing), Trigger::Report(Killed)).unwrap();
        assert_eq!(done.next, Killed);
        assert_eq!(done.work, vec![WorkItem::UpdateState]);
    }

    #[test]
    fn service_finish_reschedules_batch_does_not() {
        let service = task(Running, true, 0, 1);
        let plan = plan_transition(&service, Trigger::Report(Finished)).unwrap();
        assert!(plan.has(WorkItem::Reschedule(RescheduleSource::Same)));

        let plan = plan_transition(&batch(Running), Trigger::Report(Finished)).unwrap();
        assert!(!plan.has(WorkItem::Reschedule(RescheduleSource::Same)));
    }

    #[test]
    fn failure_respects_max_task_failures() {
        // Four prior failures, limit five: one more try.
        let plan = plan_transition(&task(Running, false, 3, 5), Trigger::Report(Failed)).unwrap();
        assert!(plan.has(WorkItem::IncrementFailures));
        assert!(plan.has(WorkItem::Reschedule(RescheduleSource::Same)));

        // At the limit: no more retries.
        let plan = plan_transition(&task(Running, false, 4, 5), Trigger::Report(Failed)).unwrap();
        assert!(plan.has(WorkItem::IncrementFailures));
        assert!(!plan.has(WorkItem::Reschedule(RescheduleSource::Same)));

        // Services ignore the limit.
        let plan = plan_transition(&task(Running, true, 99, 1), Trigger::Report(Failed)).unwrap();
        assert!(plan.has(WorkItem::Reschedule(RescheduleSource::Same)));
    }

    #[test]
    fn lost_tasks_are_replaced() {
        for from in [Assigned, Starting, Running] {
            let plan = plan_transition(&batch(from), Trigger::Report(Lost)).unwrap();
            assert_eq!(plan.next, Lost);
            assert!(plan.has(WorkItem::Reschedule(RescheduleSource::Same)));
        }
    }

    #[test]
    fn update_and_rollback_pick_session_configs() {
        let plan = plan_transition(&batch(Running), Trigger::Update).unwrap();
        assert_eq!(plan.next, Updating);
        assert!(plan.has(WorkItem::Kill));

        let plan = plan_transition(&batch(Updating), Trigger::Report(Killed)).unwrap();
        assert!(plan.has(WorkItem::Reschedule(RescheduleSource::Updated)));

        let plan = plan_transition(&batch(Rollback), Trigger::Report(Finished)).unwrap();
        assert!(plan.has(WorkItem::Reschedule(RescheduleSource::Previous)));
    }

    #[test]
    fn rollback_retargets_an_updating_task_without_second_kill() {
        let plan = plan_transition(&batch(Updating), Trigger::Rollback).unwrap();
        assert_eq!(plan.next, Rollback);
        assert!(!plan.has(WorkItem::Kill));
    }

    #[test]
    fn restart_cycles_through_restarting() {
        let plan = plan_transition(&batch(Running), Trigger::Restart).unwrap();
        assert_eq!(plan.next, Restarting);
        assert!(plan.has(WorkItem::Kill));

        let plan = plan_transition(&batch(Restarting), Trigger::Report(Killed)).unwrap();
        assert!(plan.has(WorkItem::Reschedule(RescheduleSource::Same)));
    }

    #[test]
    fn finished_before_start_counts_as_killed_launch() {
        let plan = plan_transition(&batch(Assigned), Trigger::Report(Finished)).unwrap();
        assert_eq!(plan.next, Killed);
        assert!(plan.has(WorkItem::Reschedule(RescheduleSource::Same)));
    }

    #[test]
    fn reports_on_pending_other_than_assigned_are_dropped() {
        for to in [Running, Finished, Failed, Lost] {
            assert!(plan_transition(&batch(Pending), Trigger::Report(to)).is_none());
        }
    }
}
