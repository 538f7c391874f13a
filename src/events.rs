//! Execution lifecycle notifications.
//!
//! The orchestrator emits an event at each state transition a collaborator
//! might care about. Delivery beyond the observers registered here is the
//! collaborator's business.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::result::{ExecutionResult, ExecutionStatus, Stage};

/// A lifecycle event keyed by execution id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Accepted and waiting for a concurrency slot.
    Queued {
        execution_id: String,
        language: String,
    },
    /// Holding a slot; execution started.
    Started {
        execution_id: String,
        language: String,
    },
    /// Result finalized.
    Completed {
        execution_id: String,
        status: ExecutionStatus,
        stage: Stage,
        duration_ms: u64,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Queued { execution_id, .. }
            | Self::Started { execution_id, .. }
            | Self::Completed { execution_id, .. } => execution_id,
        }
    }

    pub(crate) fn completed(result: &ExecutionResult) -> Self {
        Self::Completed {
            execution_id: result.execution_id.clone(),
            status: result.status,
            stage: result.stage,
            duration_ms: result.duration_ms,
        }
    }
}

/// Hook point for lifecycle notifications.
///
/// Called inline on the orchestrator's control flow; implementations must
/// not block.
pub trait ExecutionObserver: Send + Sync {
    fn notify(&self, event: &ExecutionEvent);
}

/// Observer that logs every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn notify(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::Queued {
                execution_id,
                language,
            } => debug!(execution_id = %execution_id, language = %language, "Execution queued"),
            ExecutionEvent::Started {
                execution_id,
                language,
            } => info!(execution_id = %execution_id, language = %language, "Execution started"),
            ExecutionEvent::Completed {
                execution_id,
                status,
                duration_ms,
                ..
            } => info!(
                execution_id = %execution_id,
                status = %status,
                elapsed_ms = duration_ms,
                "Execution completed"
            ),
        }
    }
}

/// Observer that fans events out to any number of subscribers.
///
/// Slow subscribers lag and miss events rather than stalling executions.
#[derive(Debug, Clone)]
pub struct BroadcastObserver {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }
}

impl ExecutionObserver for BroadcastObserver {
    fn notify(&self, event: &ExecutionEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_tag() {
        let event = ExecutionEvent::Started {
            execution_id: "e1".to_string(),
            language: "python".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "started");
        assert_eq!(json["execution_id"], "e1");
        assert_eq!(event.execution_id(), "e1");
    }

    #[tokio::test]
    async fn broadcast_observer_delivers_to_subscribers() {
        let observer = BroadcastObserver::new(8);
        let mut rx = observer.subscribe();

        observer.notify(&ExecutionEvent::Queued {
            execution_id: "e2".to_string(),
            language: "sh".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.execution_id(), "e2");
    }

    #[test]
    fn broadcast_without_subscribers_does_not_fail() {
        let observer = BroadcastObserver::new(1);
        observer.notify(&ExecutionEvent::Completed {
            execution_id: "e3".to_string(),
            status: ExecutionStatus::Succeeded,
            stage: Stage::Execution,
            duration_ms: 1,
        });
    }
}
