/// Audit sink collaborator
///
/// The core only produces audit entries. Storage is somebody else's problem;
/// the default sink writes them to the tracing pipeline under the `audit` target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub details: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: &str, entity_type: &str, entity_id: impl ToString) -> Self {
        Self {
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            user_id: None,
            tenant_id: None,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(str::to_string);
        self
    }

    pub fn tenant(mut self, tenant_id: Option<&str>) -> Self {
        self.tenant_id = tenant_id.map(str::to_string);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log(&self, entry: AuditEntry) -> anyhow::Result<()>;
}

/// Writes audit entries as structured tracing events
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log(&self, entry: AuditEntry) -> anyhow::Result<()> {
        tracing::info!(
            target: "audit",
            action = %entry.action,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            user_id = entry.user_id.as_deref().unwrap_or("-"),
            tenant_id = entry.tenant_id.as_deref().unwrap_or("-"),
            "{}",
            entry.details.as_ref().map(|d| d.to_string()).unwrap_or_default()
        );
        Ok(())
    }
}

/// Fire-and-forget front for an audit sink
///
/// Entries are handed to a spawned task; sink failures are logged and never
/// reach the caller.
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn record(&self, entry: AuditEntry) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            let action = entry.action.clone();
            if let Err(e) = sink.log(entry).await {
                tracing::warn!("⚠️ Audit sink rejected '{}': {}", action, e);
            }
        });
    }
}

impl std::fmt::Debug for Auditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auditor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<AuditEntry>);

    #[async_trait]
    impl AuditSink for ChannelSink {
        async fn log(&self, entry: AuditEntry) -> anyhow::Result<()> {
            self.0.send(entry)?;
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn log(&self, _entry: AuditEntry) -> anyhow::Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    #[tokio::test]
    async fn auditor_forwards_entries() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let auditor = Auditor::new(Arc::new(ChannelSink(tx)));
        auditor.record(
            AuditEntry::new("workflow.create", "workflow", "wf-1")
                .user(Some("u1"))
                .details(json!({"name": "Review"})),
        );

        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.action, "workflow.create");
        assert_eq!(entry.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn sink_failures_stay_contained() {
        let auditor = Auditor::new(Arc::new(FailingSink));
        auditor.record(AuditEntry::new("x", "y", "z"));
        tokio::task::yield_now().await;
    }
}
