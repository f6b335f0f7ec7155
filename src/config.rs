//! Job and task configuration validation.
//!
//! Admission runs every declared job through [`validate_job`] before any
//! state is touched. [`populate_defaults`] is the shared modernization path:
//! admission applies it to incoming templates and the startup backfill
//! applies it to stored rows, so both populations end up identical.

use crate::types::{ConfigError, Constraint, ExecutorConfig, JobConfig, TaskConfig};

/// Executor name synthesized for rows that predate executor configs.
pub const LEGACY_EXECUTOR_NAME: &str = "AuroraExecutor";

fn validate_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::EmptyIdentifier { field });
    }
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !ok {
        return Err(ConfigError::InvalidIdentifier {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn validate_dedicated(value: &str, job: &JobConfig) -> Result<(), ConfigError> {
    let role = &job.key.role;
    let valid = value == role
        || value == job.key.to_path()
        || value
            .strip_prefix(role.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|suffix| !suffix.is_empty());
    if !valid {
        return Err(ConfigError::InvalidDedicatedConstraint {
            value: value.to_string(),
            role: role.clone(),
        });
    }
    Ok(())
}

/// Validate a job declaration. No state is read or written; failures map to
/// the invalid-configuration error kind.
pub fn validate_job(config: &JobConfig) -> Result<(), ConfigError> {
    validate_identifier("role", &config.key.role)?;
    validate_identifier("environment", &config.key.environment)?;
    validate_identifier("name", &config.key.name)?;
    validate_identifier("user", &config.owner.user)?;

    if config.instance_count < 1 {
        return Err(ConfigError::InstanceCountTooLow);
    }
    if config.task.job != config.key {
        return Err(ConfigError::TemplateJobMismatch {
            expected: config.key.clone(),
            actual: config.task.job.clone(),
        });
    }
    validate_task(&config.task, config)
}

fn validate_task(task: &TaskConfig, job: &JobConfig) -> Result<(), ConfigError> {
    if task.executor.is_none() && task.legacy_executor_data.is_none() {
        return Err(ConfigError::MissingExecutor);
    }
    if let Some(email) = &task.contact_email {
        // Shape check only; deliverability is not this layer's problem.
        if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
            return Err(ConfigError::InvalidContactEmail {
                value: email.clone(),
            });
        }
    }
    for constraint in &task.constraints {
        if let Constraint::Dedicated { value } = constraint {
            validate_dedicated(value, job)?;
        }
    }
    Ok(())
}

/// Fill in the modern defaults an older declaration may lack. Returns true
/// if the config was changed.
pub fn populate_defaults(task: &mut TaskConfig) -> bool {
    let mut changed = false;

    if task.max_task_failures == 0 {
        task.max_task_failures = 1;
        changed = true;
    }
    if task.constraints.is_empty() {
        task.constraints.insert(Constraint::host_limit(1));
        changed = true;
    }
    if task.executor.is_none() {
        if let Some(data) = task.legacy_executor_data.take() {
            task.executor = Some(ExecutorConfig::new(
                LEGACY_EXECUTOR_NAME,
                String::from_utf8_lossy(&data).into_owned(),
            ));
            changed = true;
        }
    }

    changed
}
