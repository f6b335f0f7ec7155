//! Rolling update orchestration.
//!
//! An update is a per-job, token-protected session persisted in the store.
//! `initiate_job_update` records the session and hands the caller a random
//! token; every subsequent pass (`update_shards`, `rollback_shards`) and the
//! final `finish_update` must present it. Each pass runs as one store
//! transaction, so a failed pass leaves no partial shard flips behind.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::config::{populate_defaults, validate_job};
use crate::query::TaskQuery;
use crate::state::{Trigger, TxEffects};
use crate::storage::{MutableStore, Snapshot, TaskStore};
use crate::types::{
    JobConfig, JobKey, ScheduleStatus, ScheduledTask, SchedulerError, SchedulerResult,
    ShardUpdateResult, UpdateResult, UpdateSession,
};

use super::SchedulerCore;

/// Rebuild a job-level view of what is currently running, used as the
/// rollback target. The template comes from the lowest-instance task; the
/// instance count spans the live instance set.
fn snapshot_job_config(key: &JobKey, active: &[ScheduledTask]) -> Option<JobConfig> {
    let template = active
        .iter()
        .min_by_key(|task| task.instance_id())
        .map(|task| task.config().clone())?;
    let instance_count = active
        .iter()
        .map(|task| task.instance_id())
        .max()
        .map(|max| max + 1)?;
    Some(JobConfig {
        key: key.clone(),
        owner: template.owner.clone(),
        instance_count,
        task: template,
        cron_schedule: None,
        cron_collision_policy: Default::default(),
    })
}

impl<S: TaskStore> SchedulerCore<S> {
    /// Begin a rolling update. Returns the session token, or `None` when
    /// the job is cron-managed (its registration is replaced in place and
    /// no rolling update happens).
    pub async fn initiate_job_update(
        &self,
        mut new_config: JobConfig,
        user: impl Into<String>,
    ) -> SchedulerResult<Option<String>> {
        let user = user.into();
        populate_defaults(&mut new_config.task);
        validate_job(&new_config)?;
        let key = new_config.key.clone();

        if self.cron().has_job(&key) {
            let mut replacement = new_config;
            if replacement.cron_schedule.is_none() {
                replacement.cron_schedule = self
                    .cron()
                    .get_job(&key)
                    .and_then(|job| job.cron_schedule);
            }
            self.store().write(|tx| {
                tx.save_job(replacement.clone());
                Ok::<_, SchedulerError>(())
            })?;
            self.cron().replace(replacement)?;
            tracing::info!(job = %key, "cron job configuration replaced");
            return Ok(None);
        }

        let active = self
            .state()
            .fetch_tasks(&TaskQuery::by_job(&key).active())?;
        if active.is_empty() {
            return Err(SchedulerError::NoMatchingTasks);
        }
        if active.iter().any(|task| {
            matches!(
                task.status,
                ScheduleStatus::Updating | ScheduleStatus::Rollback | ScheduleStatus::Restarting
            )
        }) {
            return Err(SchedulerError::UpdateInProgress { key });
        }

        let old_config =
            snapshot_job_config(&key, &active).ok_or(SchedulerError::NoMatchingTasks)?;
        let token = Uuid::new_v4().simple().to_string();
        let session = UpdateSession {
            job: key.clone(),
            token: token.clone(),
            user,
            old_config,
            new_config,
        };

        self.store().write(|tx| {
            if tx.get_update_session(&key).is_some() {
                return Err(SchedulerError::UpdateInProgress { key: key.clone() });
            }
            tx.save_update_session(session.clone());
            Ok(())
        })?;

        tracing::info!(job = %key, "update session opened");
        Ok(Some(token))
    }

    /// Move the given instances towards the update's new configuration.
    pub async fn update_shards(
        &self,
        key: &JobKey,
        user: &str,
        instance_ids: &BTreeSet<u32>,
        token: &str,
    ) -> SchedulerResult<BTreeMap<u32, ShardUpdateResult>> {
        self.shard_pass(key, user, instance_ids, token, PassDirection::Forward)
            .await
    }

    /// Move the given instances back to the update's previous
    /// configuration. Instances the update added are killed outright.
    pub async fn rollback_shards(
        &self,
        key: &JobKey,
        user: &str,
        instance_ids: &BTreeSet<u32>,
        token: &str,
    ) -> SchedulerResult<BTreeMap<u32, ShardUpdateResult>> {
        self.shard_pass(key, user, instance_ids, token, PassDirection::Back)
            .await
    }

    /// Close the update session. A `Success` with a shrunken instance count
    /// kills the orphaned instances; `Failed`/`Terminate` kill instances
    /// that only exist in the new configuration. The token may be omitted
    /// only by the user who opened the session.
    pub async fn finish_update(
        &self,
        key: &JobKey,
        user: &str,
        token: Option<&str>,
        result: UpdateResult,
    ) -> SchedulerResult<()> {
        let message = format!("update finished by {user}");
        let mut effects = TxEffects::default();

        self.store().write(|tx| {
            let session =
                tx.get_update_session(key)
                    .ok_or_else(|| SchedulerError::NoActiveUpdate {
                        key: key.clone(),
                    })?;
            let authorized = match token {
                Some(token) => token == session.token,
                None => user == session.user,
            };
            if !authorized {
                return Err(SchedulerError::InvalidUpdateToken { key: key.clone() });
            }

            tx.remove_update_session(key);

            let surviving = match result {
                UpdateResult::Success => &session.new_config,
                UpdateResult::Failed | UpdateResult::Terminate => &session.old_config,
            };
            for task in tx.fetch_tasks(&TaskQuery::by_job(key).active()) {
                if task.instance_id() >= surviving.instance_count {
                    self.state()
                        .step_in_tx(tx, &task, Trigger::Kill, Some(&message), &mut effects)?;
                }
            }
            Ok(())
        })?;

        self.state().dispatch_effects(effects).await;
        tracing::info!(job = %key, ?result, "update session closed");
        Ok(())
    }

    async fn shard_pass(
        &self,
        key: &JobKey,
        user: &str,
        instance_ids: &BTreeSet<u32>,
        token: &str,
        direction: PassDirection,
    ) -> SchedulerResult<BTreeMap<u32, ShardUpdateResult>> {
        let message = match direction {
            PassDirection::Forward => format!("updated by {user}"),
            PassDirection::Back => format!("rolled back by {user}"),
        };
        let mut effects = TxEffects::default();

        let results = self.store().write(|tx| {
            let session =
                tx.get_update_session(key)
                    .ok_or_else(|| SchedulerError::NoActiveUpdate {
                        key: key.clone(),
                    })?;
            if session.token != token {
                return Err(SchedulerError::InvalidUpdateToken { key: key.clone() });
            }

            let target_config = match direction {
                PassDirection::Forward => &session.new_config,
                PassDirection::Back => &session.old_config,
            };
            let trigger = match direction {
                PassDirection::Forward => Trigger::Update,
                PassDirection::Back => Trigger::Rollback,
            };

            let active = tx.fetch_tasks(&TaskQuery::by_job(key).active());
            let by_instance: BTreeMap<u32, &ScheduledTask> = active
                .iter()
                .map(|task| (task.instance_id(), task))
                .collect();

            let mut results = BTreeMap::new();
            for &instance_id in instance_ids {
                match by_instance.get(&instance_id) {
                    Some(task) => {
                        // Rolling back an instance the update added: nothing
                        // to revert to, so it is killed and never replaced.
                        if direction == PassDirection::Back
                            && instance_id >= session.old_config.instance_count
                        {
                            self.state().step_in_tx(
                                tx,
                                task,
                                Trigger::Kill,
                                Some(&message),
                                &mut effects,
                            )?;
                            results.insert(instance_id, ShardUpdateResult::Restarting);
                            continue;
                        }

                        let target = target_config.task_for_instance(instance_id);
                        if task.config() == &target {
                            results.insert(instance_id, ShardUpdateResult::Unchanged);
                        } else if task.status == ScheduleStatus::Pending {
                            self.state().rewrite_config_in_tx(
                                tx,
                                task.task_id(),
                                target,
                                &mut effects,
                            );
                            results.insert(instance_id, ShardUpdateResult::Restarting);
                        } else {
                            self.state().step_in_tx(
                                tx,
                                task,
                                trigger,
                                Some(&message),
                                &mut effects,
                            )?;
                            results.insert(instance_id, ShardUpdateResult::Restarting);
                        }
                    }
                    None if instance_id < target_config.instance_count => {
                        self.state().insert_in_tx(
                            tx,
                            target_config.task_for_instance(instance_id),
                            0,
                            None,
                            &mut effects,
                        )?;
                        results.insert(instance_id, ShardUpdateResult::Added);
                    }
                    None => {
                        tracing::debug!(
                            job = %key,
                            instance_id,
                            "instance outside the target configuration, skipping"
                        );
                    }
                }
            }
            Ok(results)
        })?;

        self.state().dispatch_effects(effects).await;
        Ok(results)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassDirection {
    Forward,
    Back,
}
