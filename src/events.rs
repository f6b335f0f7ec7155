//! Post-commit event publication.
//!
//! Every accepted transition produces exactly one [`TaskStateChange`],
//! published after the transaction commits. Subscribers are composed at
//! construction time through [`FanoutSink`]; there is no runtime discovery.

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::TaskStateChange;

/// Receives task state-change notifications.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, change: TaskStateChange);
}

/// Sink that logs each transition.
#[derive(Debug, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, change: TaskStateChange) {
        match change.old_status {
            Some(old) => tracing::info!(
                task_id = %change.task_id,
                from = %old,
                to = %change.new_status,
                "task state changed"
            ),
            None => tracing::info!(
                task_id = %change.task_id,
                to = %change.new_status,
                "task created"
            ),
        }
    }
}

/// Broadcasts each event to a fixed set of sinks, in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn publish(&self, change: TaskStateChange) {
        for sink in &self.sinks {
            sink.publish(change.clone()).await;
        }
    }
}

/// Buffers events for assertions.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: parking_lot::Mutex<Vec<TaskStateChange>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<TaskStateChange> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn publish(&self, change: TaskStateChange) {
        self.events.lock().push(change);
    }
}
