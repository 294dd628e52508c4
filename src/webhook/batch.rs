/// Per-webhook event batching
///
/// Batchable events accumulate per webhook until the batch reaches the
/// configured size or its flush time passes. Batches sit behind `BatchStore`;
/// the in-memory store serves a single process.

use crate::webhook::types::WebhookEvent;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// An event waiting in a batch, with its (possibly transformed) data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchedEvent {
    pub event: WebhookEvent,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookBatch {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub events: Vec<BatchedEvent>,
    pub created_at: DateTime<Utc>,
    /// The periodic sweep flushes the batch once this has passed
    pub flush_at: DateTime<Utc>,
}

impl WebhookBatch {
    pub fn new(webhook_id: Uuid, flush_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_id,
            events: Vec::new(),
            created_at: Utc::now(),
            flush_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.flush_at
    }

    /// Body of the single HTTP call that delivers the whole batch
    pub fn payload(&self) -> Value {
        let events: Vec<Value> = self
            .events
            .iter()
            .map(|e| {
                json!({
                    "type": e.event.event_type,
                    "data": e.data,
                    "tenantId": e.event.tenant_id,
                    "timestamp": e.event.timestamp.to_rfc3339(),
                })
            })
            .collect();
        json!({
            "type": "batch",
            "batchId": self.id,
            "count": events.len(),
            "events": events,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Append to the webhook's open batch, opening one with `flush_at` if needed.
    /// Returns the batch size after the append.
    async fn push(&self, webhook_id: Uuid, item: BatchedEvent, flush_at: DateTime<Utc>) -> Result<usize>;
    /// Detach the webhook's open batch
    async fn take(&self, webhook_id: Uuid) -> Result<Option<WebhookBatch>>;
    /// Detach every batch due at `now`
    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<WebhookBatch>>;
    async fn take_all(&self) -> Result<Vec<WebhookBatch>>;
}

#[derive(Debug, Default)]
pub struct InMemoryBatchStore {
    batches: RwLock<HashMap<Uuid, WebhookBatch>>,
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn push(&self, webhook_id: Uuid, item: BatchedEvent, flush_at: DateTime<Utc>) -> Result<usize> {
        let mut batches = self.batches.write().await;
        let batch = batches
            .entry(webhook_id)
            .or_insert_with(|| WebhookBatch::new(webhook_id, flush_at));
        batch.events.push(item);
        Ok(batch.events.len())
    }

    async fn take(&self, webhook_id: Uuid) -> Result<Option<WebhookBatch>> {
        Ok(self.batches.write().await.remove(&webhook_id))
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<WebhookBatch>> {
        let mut batches = self.batches.write().await;
        let due: Vec<Uuid> = batches
            .values()
            .filter(|b| b.is_due(now))
            .map(|b| b.webhook_id)
            .collect();
        Ok(due.iter().filter_map(|id| batches.remove(id)).collect())
    }

    async fn take_all(&self) -> Result<Vec<WebhookBatch>> {
        Ok(self.batches.write().await.drain().map(|(_, b)| b).collect())
    }
}
