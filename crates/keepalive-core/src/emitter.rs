//! Publishes synthetic keepalive check events to the bus (spec.md §4.4).
//! Emission is best-effort: failures are logged, never returned, since loss
//! here self-heals on the next timer tick or keepalive.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bus::{BusMessage, MessageBus, Topic};
use crate::entity::SyntheticCheckEvent;
use crate::logging::MonitorLog;

#[async_trait]
pub trait EventEmitter: Send + Sync + std::fmt::Debug {
    async fn pass(&self, event: SyntheticCheckEvent);
}

#[derive(Debug)]
pub struct BusEventEmitter {
    bus: Arc<dyn MessageBus>,
    log: MonitorLog,
}

impl BusEventEmitter {
    pub fn new(bus: Arc<dyn MessageBus>, log: MonitorLog) -> Self {
        Self { bus, log }
    }
}

#[async_trait]
impl EventEmitter for BusEventEmitter {
    async fn pass(&self, event: SyntheticCheckEvent) {
        let entity_id = event.entity.id.clone();
        let status = event.check.status;
        if let Err(e) = self.bus.publish(Topic::Event, BusMessage::Check(event)).await {
            self.log.warn(format!(
                "failed to publish keepalive check event for {entity_id} (status {}): {e}",
                status.0
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryMessageBus;
    use crate::entity::{CheckHistory, CheckStatus, Entity};
    use std::collections::HashSet;

    #[tokio::test]
    async fn pass_publishes_to_the_event_topic() {
        let bus = Arc::new(InMemoryMessageBus::new());
        let mut rx = bus.subscribe(Topic::Event, "test", 4).await.unwrap();
        let emitter = BusEventEmitter::new(bus, MonitorLog::root());

        let entity = Entity {
            id: "h1".to_string(),
            organization: "default".to_string(),
            environment: "default".to_string(),
            subscriptions: HashSet::new(),
            keepalive_timeout: 0,
            deregister: false,
            deregistration_handler: None,
            last_seen: 0,
        };
        let event = SyntheticCheckEvent::new(entity, CheckStatus::OK, "ok".into(), CheckHistory::default(), 0);
        emitter.pass(event).await;

        let received = rx.try_recv().unwrap();
        assert!(received.as_check().is_some());
    }
}
