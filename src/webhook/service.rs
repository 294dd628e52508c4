/// Webhook registry and delivery engine
///
/// `trigger_webhook` matches an event against the active webhooks and, per
/// match, runs breaker check → filter → transform → batch or queue. Delivery
/// happens on the delivery queue; failures are recorded, fed to the breaker
/// and retried with exponential backoff. The trigger caller only ever sees
/// counts, never delivery errors.

use crate::{
    audit::{AuditEntry, Auditor},
    config::WebhookConfig,
    error::{ApiError, ApiResult},
    events::{self, DomainEvent, EventBus},
    runtime::{queue::WorkQueue, scheduler::retry_delay},
    storage::PersistenceGateway,
    webhook::{
        batch::{BatchStore, BatchedEvent, WebhookBatch},
        breaker::{BreakerPolicy, BreakerStore, CircuitBreaker, CircuitBreakerState},
        delivery::{event_payload, OutboundRequest, WebhookTransport, BATCH_EVENT},
        types::{
            TriggerOptions, TriggerReport, Webhook, WebhookDelivery, WebhookEvent, WebhookInput,
        },
    },
};
use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::{
    sync::{Arc, Weak},
    time::Instant,
};
use tokio::{
    sync::{broadcast::error::RecvError, Mutex},
    task::JoinHandle,
};
use uuid::Uuid;

/// Event type sent by `test_webhook`
pub const TEST_EVENT: &str = "webhook:test";

/// One queued delivery attempt
#[derive(Debug, Clone)]
struct DeliveryJob {
    webhook_id: Uuid,
    event_type: String,
    payload: Value,
    /// 1-based
    attempt: u32,
}

pub struct WebhookService {
    storage: Arc<dyn PersistenceGateway>,
    config: WebhookConfig,
    breaker: CircuitBreaker,
    batches: Arc<dyn BatchStore>,
    transport: Arc<dyn WebhookTransport>,
    events: EventBus,
    auditor: Auditor,
    queue: WorkQueue<DeliveryJob>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebhookService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn PersistenceGateway>,
        config: WebhookConfig,
        breaker_store: Arc<dyn BreakerStore>,
        batches: Arc<dyn BatchStore>,
        transport: Arc<dyn WebhookTransport>,
        events: EventBus,
        auditor: Auditor,
    ) -> Arc<Self> {
        let breaker = CircuitBreaker::new(breaker_store, BreakerPolicy::from(&config));
        let queue = WorkQueue::new(config.delivery_concurrency);
        Arc::new(Self {
            storage,
            config,
            breaker,
            batches,
            transport,
            events,
            auditor,
            queue,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start delivery workers and the batch sweeper
    ///
    /// With `listen_to_events`, every domain event on the bus (except delivery
    /// outcomes) is offered to `trigger_webhook`.
    pub async fn init(self: &Arc<Self>, listen_to_events: bool) -> Result<()> {
        let weak = Arc::downgrade(self);
        self.queue
            .start(move |job: DeliveryJob| {
                let weak = weak.clone();
                async move {
                    if let Some(service) = weak.upgrade() {
                        service.process(job).await;
                    }
                }
            })
            .await;

        let mut tasks = self.tasks.lock().await;
        if self.config.batching_enabled {
            tasks.push(self.spawn_batch_sweeper());
        }
        if listen_to_events {
            tasks.push(self.spawn_event_listener());
        }

        tracing::info!(
            "🪝 Webhook service started (batching: {}, listening: {})",
            self.config.batching_enabled,
            listen_to_events
        );
        Ok(())
    }

    /// Flush pending batches, drain the delivery queue, stop background tasks
    pub async fn shutdown(&self) -> Result<()> {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        for batch in self.batches.take_all().await? {
            self.flush_batch(batch)?;
        }
        if tokio::time::timeout(self.config.delivery_timeout, self.queue.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!("⚠️ Webhook deliveries still pending at shutdown: {}", self.queue.pending());
        }
        self.queue.shutdown().await;
        tracing::info!("⏹️ Webhook service stopped");
        Ok(())
    }

    /// Resolves once no delivery is queued, running or waiting for a retry
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    fn spawn_batch_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.batch_timeout.max(std::time::Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(service) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = service.flush_due_batches().await {
                    tracing::error!("❌ Batch sweep failed: {:#}", e);
                }
            }
        })
    }

    fn spawn_event_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut receiver = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match receiver.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("⚠️ Webhook listener lagged, {} events dropped", missed);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(service) = weak.upgrade() else {
                    break;
                };
                service.on_domain_event(event).await;
            }
        })
    }

    async fn on_domain_event(&self, event: DomainEvent) {
        if event.is_delivery_outcome() {
            return;
        }
        let webhook_event = WebhookEvent {
            event_type: event.name,
            data: event.payload,
            tenant_id: event.tenant_id,
            timestamp: event.occurred_at,
        };
        if let Err(e) = self
            .trigger_webhook(webhook_event, TriggerOptions::default())
            .await
        {
            tracing::error!("❌ Failed to trigger webhooks for domain event: {}", e);
        }
    }

    // ---------------------------------------------------------------------
    // Registry
    // ---------------------------------------------------------------------

    pub async fn create_webhook(&self, input: WebhookInput, user_id: Option<&str>) -> ApiResult<Webhook> {
        validate_input(&input)?;
        let now = Utc::now();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            name: input.name,
            url: input.url,
            secret: input.secret,
            events: input.events,
            status: input.status,
            tenant_id: input.tenant_id,
            content_type_ids: input.content_type_ids,
            headers: input.headers,
            created_at: now,
            updated_at: now,
        };
        self.storage.create_webhook(&webhook).await?;

        tracing::info!("🪝 Created webhook {} ({}) -> {}", webhook.id, webhook.name, webhook.url);
        self.auditor.record(
            AuditEntry::new("webhook.create", "webhook", webhook.id)
                .user(user_id)
                .tenant(webhook.tenant_id.as_deref())
                .details(json!({"name": webhook.name, "events": webhook.events})),
        );
        self.events.emit(
            events::WEBHOOK_CREATED,
            webhook.tenant_id.clone(),
            json!({
                "webhookId": webhook.id,
                "name": webhook.name,
                "url": webhook.url,
                "events": webhook.events,
            }),
        );
        Ok(webhook)
    }

    /// Replace a webhook's settings; an absent secret keeps the stored one
    pub async fn update_webhook(&self, id: Uuid, input: WebhookInput, user_id: Option<&str>) -> ApiResult<Webhook> {
        validate_input(&input)?;
        let current = self.get_webhook(id).await?;
        let webhook = Webhook {
            id,
            name: input.name,
            url: input.url,
            secret: input.secret.or(current.secret),
            events: input.events,
            status: input.status,
            tenant_id: input.tenant_id,
            content_type_ids: input.content_type_ids,
            headers: input.headers,
            created_at: current.created_at,
            updated_at: Utc::now(),
        };
        self.storage.update_webhook(&webhook).await?;

        tracing::info!("🔥 Updated webhook {} ({})", webhook.id, webhook.name);
        self.auditor.record(
            AuditEntry::new("webhook.update", "webhook", id)
                .user(user_id)
                .tenant(webhook.tenant_id.as_deref()),
        );
        Ok(webhook)
    }

    /// Remove the webhook together with its breaker state and open batch
    pub async fn delete_webhook(&self, id: Uuid, user_id: Option<&str>) -> ApiResult<()> {
        if !self.storage.delete_webhook(id).await? {
            return Err(ApiError::not_found("webhook", id));
        }
        self.breaker.reset(id).await?;
        self.batches.take(id).await?;

        tracing::info!("🗑️ Deleted webhook {}", id);
        self.auditor
            .record(AuditEntry::new("webhook.delete", "webhook", id).user(user_id));
        Ok(())
    }

    pub async fn get_webhook(&self, id: Uuid) -> ApiResult<Webhook> {
        self.storage
            .get_webhook(id)
            .await?
            .ok_or_else(|| ApiError::not_found("webhook", id))
    }

    /// All webhooks, or those of one tenant
    pub async fn list_webhooks(&self, tenant_id: Option<&str>) -> ApiResult<Vec<Webhook>> {
        let webhooks = self.storage.list_webhooks().await?;
        Ok(match tenant_id {
            Some(tenant) => webhooks
                .into_iter()
                .filter(|w| w.tenant_id.as_deref() == Some(tenant))
                .collect(),
            None => webhooks,
        })
    }

    /// Delivery history, most recent first
    pub async fn list_deliveries(&self, id: Uuid, limit: usize) -> ApiResult<Vec<WebhookDelivery>> {
        self.get_webhook(id).await?;
        Ok(self.storage.list_deliveries(id, limit).await?)
    }

    pub async fn breaker_state(&self, id: Uuid) -> ApiResult<CircuitBreakerState> {
        self.get_webhook(id).await?;
        Ok(self.breaker.state(id).await?)
    }

    /// Deliver a `webhook:test` event right away and return the record
    ///
    /// Bypasses queue and breaker; the attempt is still recorded.
    pub async fn test_webhook(&self, id: Uuid) -> ApiResult<WebhookDelivery> {
        let webhook = self.get_webhook(id).await?;
        let event = WebhookEvent::new(
            TEST_EVENT,
            json!({"message": "Test delivery", "webhookId": id}),
            webhook.tenant_id.clone(),
        );
        let payload = event_payload(&event, event.data.clone());
        let delivery = self.attempt(&webhook, TEST_EVENT, &payload, 1).await?;
        self.storage.record_delivery(&delivery).await?;
        Ok(delivery)
    }

    // ---------------------------------------------------------------------
    // Triggering
    // ---------------------------------------------------------------------

    pub async fn trigger_webhook(&self, event: WebhookEvent, options: TriggerOptions) -> ApiResult<TriggerReport> {
        let mut report = TriggerReport::default();
        let webhooks: Vec<Webhook> = self
            .storage
            .list_webhooks()
            .await?
            .into_iter()
            .filter(|w| w.matches(&event))
            .collect();

        for webhook in webhooks {
            report.matched += 1;

            if !self.breaker.allow(webhook.id).await? {
                tracing::warn!(
                    "🔌 Circuit open for webhook {}, skipping {}",
                    webhook.id,
                    event.event_type
                );
                report.failed += 1;
                continue;
            }

            if let Some(filter) = &options.filter {
                if !filter(&event, &webhook) {
                    report.filtered += 1;
                    continue;
                }
            }

            let data = match &options.transform {
                Some(transform) => match transform(&event, &webhook) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!("⚠️ Transform for webhook {} failed: {}", webhook.id, e);
                        report.failed += 1;
                        continue;
                    }
                },
                None => event.data.clone(),
            };

            if options.batchable && self.config.batching_enabled {
                let flush_at = Utc::now()
                    + chrono::Duration::from_std(self.config.batch_timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(5));
                let size = self
                    .batches
                    .push(
                        webhook.id,
                        BatchedEvent {
                            event: event.clone(),
                            data,
                        },
                        flush_at,
                    )
                    .await?;
                report.batched += 1;
                if size >= self.config.batch_size {
                    if let Some(batch) = self.batches.take(webhook.id).await? {
                        self.flush_batch(batch)?;
                    }
                }
            } else {
                self.queue.enqueue(DeliveryJob {
                    webhook_id: webhook.id,
                    event_type: event.event_type.clone(),
                    payload: event_payload(&event, data),
                    attempt: 1,
                })?;
                report.queued += 1;
            }
        }

        tracing::debug!("🎯 Trigger {}: {:?}", event.event_type, report);
        Ok(report)
    }

    /// Flush every batch whose flush time has passed
    pub async fn flush_due_batches(&self) -> Result<usize> {
        let due = self.batches.take_due(Utc::now()).await?;
        let count = due.len();
        for batch in due {
            self.flush_batch(batch)?;
        }
        Ok(count)
    }

    fn flush_batch(&self, batch: WebhookBatch) -> Result<()> {
        if batch.events.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            "📦 Flushing batch {} of {} events for webhook {}",
            batch.id,
            batch.events.len(),
            batch.webhook_id
        );
        self.queue.enqueue(DeliveryJob {
            webhook_id: batch.webhook_id,
            event_type: BATCH_EVENT.to_string(),
            payload: batch.payload(),
            attempt: 1,
        })
    }

    // ---------------------------------------------------------------------
    // Delivery
    // ---------------------------------------------------------------------

    async fn process(&self, job: DeliveryJob) {
        if let Err(e) = self.deliver(job).await {
            tracing::error!("❌ Delivery bookkeeping failed: {:#}", e);
        }
    }

    async fn deliver(&self, job: DeliveryJob) -> Result<()> {
        let Some(webhook) = self.storage.get_webhook(job.webhook_id).await? else {
            tracing::debug!("⏭️ Webhook {} is gone, dropping delivery", job.webhook_id);
            return Ok(());
        };
        if !self.breaker.allow(webhook.id).await? {
            tracing::warn!(
                "🔌 Circuit open for webhook {}, dropping attempt {} of {}",
                webhook.id,
                job.attempt,
                job.event_type
            );
            return Ok(());
        }

        let delivery = self
            .attempt(&webhook, &job.event_type, &job.payload, job.attempt)
            .await?;
        self.storage.record_delivery(&delivery).await?;

        let outcome = json!({
            "webhookId": webhook.id,
            "deliveryId": delivery.id,
            "eventType": delivery.event_type,
            "statusCode": delivery.status_code,
            "attempt": delivery.attempt,
            "error": delivery.error,
        });
        if delivery.success {
            self.breaker.record_success(webhook.id).await?;
            self.events
                .emit(events::DELIVERY_SUCCESS, webhook.tenant_id.clone(), outcome);
            return Ok(());
        }

        self.breaker.record_failure(webhook.id).await?;
        self.events
            .emit(events::DELIVERY_FAILURE, webhook.tenant_id.clone(), outcome);

        if job.attempt <= self.config.max_retries {
            let delay = retry_delay(self.config.retry_backoff_base, job.attempt);
            tracing::info!(
                "🔁 Retrying {} to webhook {} in {:?} (attempt {})",
                job.event_type,
                webhook.id,
                delay,
                job.attempt + 1
            );
            self.queue.enqueue_after(
                DeliveryJob {
                    attempt: job.attempt + 1,
                    ..job
                },
                delay,
            );
        } else {
            tracing::warn!(
                "⚠️ Giving up on {} to webhook {} after {} attempts",
                job.event_type,
                webhook.id,
                job.attempt
            );
        }
        Ok(())
    }

    /// One HTTP attempt turned into a delivery record
    async fn attempt(&self, webhook: &Webhook, event_type: &str, payload: &Value, attempt: u32) -> Result<WebhookDelivery> {
        let request = OutboundRequest::build(webhook, event_type, payload, self.config.delivery_timeout)?;
        let started = Instant::now();
        let result = self.transport.post(&request).await;
        let response_time_ms = started.elapsed().as_millis() as u64;

        let (success, status_code, response, error) = match result {
            Ok(response) => {
                let success = response.is_success();
                let error = (!success).then(|| format!("HTTP {}", response.status));
                (success, Some(response.status), Some(response.recorded_body()), error)
            }
            Err(e) => (false, None, None, Some(e.to_string())),
        };

        if success {
            tracing::info!("✅ Delivered {} to webhook {} in {}ms", event_type, webhook.id, response_time_ms);
        } else {
            tracing::warn!(
                "❌ Delivery of {} to webhook {} failed: {}",
                event_type,
                webhook.id,
                error.as_deref().unwrap_or("unknown error")
            );
        }

        Ok(WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            event_type: event_type.to_string(),
            success,
            status_code,
            request: request.snapshot(),
            response,
            error,
            response_time_ms,
            attempt,
            timestamp: Utc::now(),
        })
    }
}

impl std::fmt::Debug for WebhookService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookService")
            .field("config", &self.config)
            .field("pending", &self.queue.pending())
            .finish_non_exhaustive()
    }
}

fn validate_input(input: &WebhookInput) -> ApiResult<()> {
    if input.name.trim().is_empty() {
        return Err(ApiError::validation("webhook name is required"));
    }
    let url = reqwest::Url::parse(&input.url)
        .map_err(|e| ApiError::validation(format!("invalid webhook url '{}': {}", input.url, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::validation(format!(
            "webhook url must be http or https, got '{}'",
            url.scheme()
        )));
    }
    if input.events.is_empty() || input.events.iter().any(|e| e.trim().is_empty()) {
        return Err(ApiError::validation("webhook needs at least one non-empty event type"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(url: &str, events: &[&str]) -> WebhookInput {
        WebhookInput {
            name: "hook".into(),
            url: url.into(),
            events: events.iter().map(|e| e.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn input_validation() {
        assert!(validate_input(&input("https://example.test/in", &["x"])).is_ok());
        assert!(validate_input(&input("ftp://example.test/in", &["x"])).is_err());
        assert!(validate_input(&input("not a url", &["x"])).is_err());
        assert!(validate_input(&input("http://example.test", &[])).is_err());

        let mut unnamed = input("http://example.test", &["x"]);
        unnamed.name = "  ".into();
        assert!(matches!(validate_input(&unnamed), Err(ApiError::Validation(_))));
    }
}
