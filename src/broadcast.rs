//! Live event fan-out.
//!
//! Best-effort delivery to connected subscribers over a tokio broadcast
//! channel. Durable ordering lives in the store's event log; reconnecting
//! subscribers replay `events_after(experiment_id, last_seq)` before
//! switching to the live feed, so a dropped or lagged receiver only ever
//! costs latency, not correctness.

use tokio::sync::broadcast;

use crate::model::ExperimentEvent;

#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<ExperimentEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to live subscribers. Send errors mean nobody is listening,
    /// which is fine.
    pub fn publish(&self, event: &ExperimentEvent) {
        let receivers = self.sender.send(event.clone()).unwrap_or(0);
        tracing::debug!(
            experiment_id = %event.experiment_id,
            seq = event.seq,
            event_type = %event.event_type,
            receivers,
            "event published"
        );
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExperimentEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExperimentPhase;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(seq: i64) -> ExperimentEvent {
        ExperimentEvent {
            experiment_id: Uuid::new_v4(),
            seq,
            event_type: "phase_changed".into(),
            phase: ExperimentPhase::Running,
            message: "m".into(),
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let bus = EventBroadcaster::new(16);
        let mut rx = bus.subscribe();
        bus.publish(&event(1));
        bus.publish(&event(2));
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBroadcaster::new(16);
        bus.publish(&event(1));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
