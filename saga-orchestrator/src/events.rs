//! In-process fan-out of saga/step state transitions to observers such as
//! the metrics subsystem and (eventually) a dashboard push channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Tagged-variant event emitted after a transition has been persisted
/// (read-your-writes: subscribers never observe an event for a state that
/// isn't yet durable).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SagaEvent {
    SagaStarted {
        saga_id: Uuid,
        name: String,
        correlation_id: Option<String>,
        at: DateTime<Utc>,
    },
    SagaCompleted {
        saga_id: Uuid,
        at: DateTime<Utc>,
    },
    SagaFailed {
        saga_id: Uuid,
        error_message: String,
        at: DateTime<Utc>,
    },
    SagaCompensated {
        saga_id: Uuid,
        at: DateTime<Utc>,
    },
    SagaTimedOut {
        saga_id: Uuid,
        at: DateTime<Utc>,
    },
    StepStarted {
        saga_id: Uuid,
        step_id: Uuid,
        step_name: String,
        at: DateTime<Utc>,
    },
    StepCompleted {
        saga_id: Uuid,
        step_id: Uuid,
        step_name: String,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    StepFailed {
        saga_id: Uuid,
        step_id: Uuid,
        step_name: String,
        error_message: String,
        at: DateTime<Utc>,
    },
    StepRetrying {
        saga_id: Uuid,
        step_id: Uuid,
        step_name: String,
        retry_count: u32,
        at: DateTime<Utc>,
    },
    StepCompensated {
        saga_id: Uuid,
        step_id: Uuid,
        step_name: String,
        at: DateTime<Utc>,
    },
    StepCompensationFailed {
        saga_id: Uuid,
        step_id: Uuid,
        step_name: String,
        error_message: String,
        at: DateTime<Utc>,
    },
    MetricsSnapshot {
        snapshot: crate::metrics::MetricsSnapshot,
        at: DateTime<Utc>,
    },
}

impl SagaEvent {
    pub fn saga_id(&self) -> Option<Uuid> {
        match self {
            SagaEvent::SagaStarted { saga_id, .. }
            | SagaEvent::SagaCompleted { saga_id, .. }
            | SagaEvent::SagaFailed { saga_id, .. }
            | SagaEvent::SagaCompensated { saga_id, .. }
            | SagaEvent::SagaTimedOut { saga_id, .. }
            | SagaEvent::StepStarted { saga_id, .. }
            | SagaEvent::StepCompleted { saga_id, .. }
            | SagaEvent::StepFailed { saga_id, .. }
            | SagaEvent::StepRetrying { saga_id, .. }
            | SagaEvent::StepCompensated { saga_id, .. }
            | SagaEvent::StepCompensationFailed { saga_id, .. } => Some(*saga_id),
            SagaEvent::MetricsSnapshot { .. } => None,
        }
    }
}

/// Broadcast-backed event bus. Cloning an `EventBus` shares the same
/// underlying channel; every subscriber sees every event published after it
/// subscribed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SagaEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SagaEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Returns the number of active subscribers that
    /// received it; publishing with zero subscribers is not an error.
    pub fn publish(&self, event: SagaEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(16);
        let mut receiver = bus.subscribe();

        let saga_id = Uuid::new_v4();
        bus.publish(SagaEvent::SagaStarted {
            saga_id,
            name: "demo".into(),
            correlation_id: None,
            at: Utc::now(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.saga_id(), Some(saga_id));
    }

    #[tokio::test]
    async fn publishing_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(SagaEvent::SagaCompleted {
            saga_id: Uuid::new_v4(),
            at: Utc::now(),
        });
    }
}
