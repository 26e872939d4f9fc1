//! ABOUTME: Engine event notifications delivered without blocking the scheduler
//! ABOUTME: Broadcast bus for in-process subscribers, webhook sink and fan-out

use std::sync::Arc;

use cw_core::{CameraId, Id};
use cw_db::{DetectionResult, JobStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

pub mod webhook;

pub use webhook::WebhookSink;

/// Events emitted by the scheduling engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    DetectionFound {
        camera_id: CameraId,
        result: DetectionResult,
    },
    JobStateChanged {
        job_id: Id,
        status: JobStatus,
    },
}

impl EngineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::DetectionFound { .. } => "detection_found",
            EngineEvent::JobStateChanged { .. } => "job_state_changed",
        }
    }
}

/// Receiver of engine events.
///
/// `publish` must return promptly and never fail; delivery problems are the
/// sink's own concern.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// In-process broadcast of engine events. Slow subscribers lag and skip
/// events rather than holding up the publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl NotificationSink for EventBus {
    fn publish(&self, event: EngineEvent) {
        if self.sender.send(event).is_err() {
            trace!("No event subscribers; event dropped");
        }
    }
}

/// Publishes each event to every inner sink
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl NotificationSink for FanoutSink {
    fn publish(&self, event: EngineEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_event(status: JobStatus) -> EngineEvent {
        EngineEvent::JobStateChanged {
            job_id: Id::new(),
            status,
        }
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = job_event(JobStatus::Completed);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_state_changed");
        assert_eq!(json["status"], "completed");
        assert_eq!(event.kind(), "job_state_changed");
    }

    #[test]
    fn test_publish_without_subscribers_does_not_fail() {
        let bus = EventBus::new(4);
        bus.publish(job_event(JobStatus::Running));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_bus() {
        let first = Arc::new(EventBus::new(4));
        let second = Arc::new(EventBus::new(4));
        let mut rx1 = first.subscribe();
        let mut rx2 = second.subscribe();

        let fanout = FanoutSink::new().with(first.clone()).with(second.clone());
        assert_eq!(fanout.len(), 2);

        let event = job_event(JobStatus::Aborted);
        fanout.publish(event.clone());

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }
}
