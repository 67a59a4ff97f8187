//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` between the process registry,
//! the health monitor and the job runner. Collaborators such as an HTTP
//! layer subscribe to it to observe worker and job lifecycle changes.

use kiln_core::lifecycle::ExecutionMode;
use kiln_core::types::{JobId, WorkerId};
use serde::Serialize;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// OrchestratorEvent
// ---------------------------------------------------------------------------

/// A lifecycle change worth telling the rest of the system about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A worker process was added to the registry.
    ProcessRegistered {
        worker_id: WorkerId,
        pid: u32,
        port: Option<u16>,
        mode: ExecutionMode,
    },

    /// A tracked process exited on its own.
    ProcessExited {
        worker_id: WorkerId,
        pid: u32,
        exit_code: Option<i32>,
    },

    /// A tracked process was stopped on request.
    ProcessKilled { worker_id: WorkerId, pid: u32 },

    /// The health monitor removed a dead or silent process.
    ZombieReclaimed {
        worker_id: WorkerId,
        pid: u32,
        reason: String,
    },

    /// A job produced its artifact.
    JobCompleted {
        job_id: JobId,
        worker_id: WorkerId,
        artifact_bytes: u64,
    },

    /// A job failed.
    JobFailed { job_id: JobId, error: String },

    /// A job was cancelled.
    JobCancelled { job_id: JobId },
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out event bus.
///
/// # Usage
///
/// ```rust
/// use kiln_events::bus::{EventBus, OrchestratorEvent};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(OrchestratorEvent::JobCancelled { job_id: "job-1".into() });
/// ```
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// `capacity` events are buffered per receiver; a receiver that falls
    /// further behind gets `RecvError::Lagged` and skips ahead.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Fan `event` out to every receiver. A bus nobody listens to drops it.
    pub fn publish(&self, event: OrchestratorEvent) {
        // Err only means there are no receivers.
        let _ = self.sender.send(event);
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_sees_published_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(OrchestratorEvent::ProcessKilled {
            worker_id: "w1".into(),
            pid: 42,
        });

        let received = rx.recv().await.expect("event delivered");
        assert_eq!(
            received,
            OrchestratorEvent::ProcessKilled {
                worker_id: "w1".into(),
                pid: 42,
            }
        );
    }

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(OrchestratorEvent::JobCancelled {
            job_id: "job-7".into(),
        });

        assert_eq!(
            first.recv().await.expect("first copy"),
            second.recv().await.expect("second copy")
        );
    }

    #[test]
    fn publishing_into_the_void_is_fine() {
        let bus = EventBus::default();
        bus.publish(OrchestratorEvent::JobFailed {
            job_id: "orphan".into(),
            error: "nobody listening".into(),
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = OrchestratorEvent::ProcessRegistered {
            worker_id: "w1".into(),
            pid: 7,
            port: Some(8101),
            mode: ExecutionMode::Server,
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "process_registered");
        assert_eq!(json["mode"], "server");
        assert_eq!(json["port"], 8101);
    }
}
