/// Domain event bus
///
/// The execution engine and the webhook service never call each other; they
/// meet here. Publishers fire named events, subscribers match by name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub const WORKFLOW_CREATED: &str = "workflow:created";
pub const WORKFLOW_UPDATED: &str = "workflow:updated";
pub const INSTANCE_CREATED: &str = "workflow:instance:created";
pub const INSTANCE_COMPLETED: &str = "workflow:instance:completed";
pub const INSTANCE_FAILED: &str = "workflow:instance:failed";
pub const INSTANCE_CANCELLED: &str = "workflow:instance:cancelled";
pub const STEP_COMPLETED: &str = "workflow:step:completed";
pub const STEP_REJECTED: &str = "workflow:step:rejected";
pub const STEP_ASSIGNED: &str = "workflow:step:assigned";
pub const WEBHOOK_CREATED: &str = "webhook:created";
pub const DELIVERY_SUCCESS: &str = "webhook:delivery:success";
pub const DELIVERY_FAILURE: &str = "webhook:delivery:failure";

/// A named event raised by one of the core services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub name: String,
    pub tenant_id: Option<String>,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(name: &str, tenant_id: Option<String>, payload: Value) -> Self {
        Self {
            name: name.to_string(),
            tenant_id,
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Delivery outcome events are never fed back into webhook matching
    pub fn is_delivery_outcome(&self) -> bool {
        self.name == DELIVERY_SUCCESS || self.name == DELIVERY_FAILURE
    }
}

/// In-process broadcast bus
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// simply dropped, and slow subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: DomainEvent) {
        tracing::debug!("📣 Event: {} ({})", event.name, event.payload);
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, name: &str, tenant_id: Option<String>, payload: Value) {
        self.publish(DomainEvent::new(name, tenant_id, payload));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
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
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(STEP_COMPLETED, Some("t1".into()), json!({"stepId": "a"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, STEP_COMPLETED);
        assert_eq!(event.tenant_id.as_deref(), Some("t1"));
        assert!(!event.is_delivery_outcome());
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(WORKFLOW_CREATED, None, json!({}));
    }
}
