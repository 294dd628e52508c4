/// Webhook registry and delivery record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};
use uuid::Uuid;

/// A registered outbound subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    /// HMAC key; deliveries are signed when present
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
    /// Subscribed event types (e.g., "workflow:step:completed")
    pub events: Vec<String>,
    #[serde(default)]
    pub status: WebhookStatus,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Optional content-type scope; events carrying another contentTypeId are skipped
    #[serde(default)]
    pub content_type_ids: Option<Vec<String>>,
    /// Static headers added to every delivery
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Whether this webhook subscribes to the given event
    pub fn matches(&self, event: &WebhookEvent) -> bool {
        if self.status != WebhookStatus::Active {
            return false;
        }
        if !self.events.iter().any(|e| e == &event.event_type || e == "*") {
            return false;
        }
        if let (Some(own), Some(requested)) = (self.tenant_id.as_deref(), event.tenant_id.as_deref()) {
            if own != requested {
                return false;
            }
        }
        match (&self.content_type_ids, event.content_type_id()) {
            (Some(scope), Some(ct)) if !scope.is_empty() => scope.iter().any(|s| s == ct),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookStatus {
    #[default]
    Active,
    Inactive,
}

/// Input for registering or updating a webhook
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookInput {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub events: Vec<String>,
    #[serde(default)]
    pub status: WebhookStatus,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub content_type_ids: Option<Vec<String>>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// An outbound event offered to the webhook matcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(event_type: &str, data: Value, tenant_id: Option<String>) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            tenant_id,
            timestamp: Utc::now(),
        }
    }

    pub fn content_type_id(&self) -> Option<&str> {
        self.data.get("contentTypeId").and_then(Value::as_str)
    }
}

pub type EventFilter = Arc<dyn Fn(&WebhookEvent, &Webhook) -> bool + Send + Sync>;
pub type EventTransform = Arc<dyn Fn(&WebhookEvent, &Webhook) -> anyhow::Result<Value> + Send + Sync>;

/// Per-call trigger options
#[derive(Clone, Default)]
pub struct TriggerOptions {
    /// Accumulate into the webhook's batch instead of delivering immediately
    pub batchable: bool,
    pub filter: Option<EventFilter>,
    pub transform: Option<EventTransform>,
}

impl fmt::Debug for TriggerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerOptions")
            .field("batchable", &self.batchable)
            .field("filter", &self.filter.is_some())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// Outcome counts of a trigger call; delivery happens later
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    pub matched: usize,
    pub queued: usize,
    pub batched: usize,
    pub filtered: usize,
    pub failed: usize,
}

/// Request snapshot kept on every delivery record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Append-only record of one delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event_type: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub request: RequestSnapshot,
    pub response: Option<String>,
    pub error: Option<String>,
    pub response_time_ms: u64,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hook(events: &[&str]) -> Webhook {
        Webhook {
            id: Uuid::new_v4(),
            name: "h".into(),
            url: "https://example.test/hook".into(),
            secret: None,
            events: events.iter().map(|s| s.to_string()).collect(),
            status: WebhookStatus::Active,
            tenant_id: Some("t1".into()),
            content_type_ids: Some(vec!["article".into()]),
            headers: HashMap::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn matching_honors_type_tenant_and_scope() {
        let h = hook(&["workflow:step:completed"]);
        let ev = |t: &str, tenant: Option<&str>, ct: &str| {
            WebhookEvent::new(t, json!({"contentTypeId": ct}), tenant.map(str::to_string))
        };

        assert!(h.matches(&ev("workflow:step:completed", Some("t1"), "article")));
        assert!(!h.matches(&ev("workflow:step:rejected", Some("t1"), "article")));
        assert!(!h.matches(&ev("workflow:step:completed", Some("t2"), "article")));
        assert!(!h.matches(&ev("workflow:step:completed", Some("t1"), "page")));
    }

    #[test]
    fn inactive_webhooks_never_match() {
        let mut h = hook(&["*"]);
        h.status = WebhookStatus::Inactive;
        assert!(!h.matches(&WebhookEvent::new("anything", json!({}), None)));
    }

    #[test]
    fn secret_is_not_serialized() {
        let mut h = hook(&["x"]);
        h.secret = Some("s3cret".into());
        let json = serde_json::to_string(&h).unwrap();
        assert!(!json.contains("s3cret"));
    }
}
