//! Command sink towards the executor-facing driver.

use async_trait::async_trait;

use crate::types::TaskId;

/// One-way command channel to the placement/executor layer.
///
/// Kills are dispatched after the owning transaction commits and are
/// best-effort; the driver must tolerate repeated kill requests for the
/// same task id.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn kill_task(&self, task_id: &TaskId);
}

/// Driver that only records the request in the log. Useful as a stand-in
/// until a real driver is wired, and in tests that don't assert on kills.
#[derive(Debug, Default)]
pub struct LoggingDriver;

#[async_trait]
impl Driver for LoggingDriver {
    async fn kill_task(&self, task_id: &TaskId) {
        tracing::debug!(%task_id, "kill requested");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records every kill for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingDriver {
        pub kills: Mutex<Vec<TaskId>>,
    }

    impl RecordingDriver {
        pub fn killed(&self) -> Vec<TaskId> {
            self.kills.lock().clone()
        }
    }

    #[async_trait]
    impl Driver for RecordingDriver {
        async fn kill_task(&self, task_id: &TaskId) {
            self.kills.lock().push(task_id.clone());
        }
    }
}
